//! SurrealDB schema migrations and initialization
//!
//! Sets up every Hypnos table with the unique indexes the storage contracts
//! rely on. Uniqueness of synthesized knowledge is enforced here, in the
//! store, not by read-then-write checks in the engine.

use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all Hypnos tables in SurrealDB
///
/// Safe to call multiple times (idempotent).
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing Hypnos SurrealDB schema");

    init_events_table(db).await?;
    init_memories_table(db).await?;
    init_procedures_table(db).await?;
    init_embedding_history_table(db).await?;
    init_locks_table(db).await?;
    init_references_table(db).await?;

    info!("Hypnos schema initialization complete");
    Ok(())
}

/// Initialize `events` table
///
/// Schema:
/// ```text
/// TABLE events {
///   event_id:              STRING (unique)
///   namespace:             STRING (indexed)
///   session_id:            STRING
///   timestamp:             DATETIME
///   event_type:            STRING
///   content:               STRING
///   embedding:             OBJECT { vector, model_version, created_at }
///   tags:                  ARRAY<STRING>
///   importance_score:      FLOAT
///   resource / outcome:    STRING?
///   consolidation_status:  STRING (unconsolidated | consolidating | consolidated)
///   merged:                BOOL
///   canonical_id:          STRING?
///   claimed_by:            STRING?
///   version:               INT
/// }
/// ```
///
/// Rows are never deleted; `delete NONE` keeps merged events for audit.
async fn init_events_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing events table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS events AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_event_id ON TABLE events COLUMNS event_id UNIQUE;

        -- Lifecycle scans: unconsolidated live events of a namespace
        DEFINE INDEX IF NOT EXISTS idx_events_ns_status ON TABLE events COLUMNS namespace, merged, consolidation_status;

        DEFINE INDEX IF NOT EXISTS idx_events_ns_session ON TABLE events COLUMNS namespace, session_id;

        DEFINE INDEX IF NOT EXISTS idx_events_canonical ON TABLE events COLUMNS canonical_id;

        DEFINE INDEX IF NOT EXISTS idx_events_claimed_by ON TABLE events COLUMNS claimed_by;

        -- Drift scans by embedding model version
        DEFINE INDEX IF NOT EXISTS idx_events_model_version ON TABLE events COLUMNS embedding.model_version;
    "#;

    db.query(sql).await?.check()?;
    info!("✓ events table initialized");
    Ok(())
}

/// Initialize `memories` table
///
/// Constraints:
/// - `memory_id` is unique
/// - `(namespace, content_hash)` is unique; concurrent inserts of the same
///   content in one namespace resolve to exactly one row
async fn init_memories_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing memories table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS memories SCHEMALESS;

        DEFINE INDEX IF NOT EXISTS idx_memory_id ON TABLE memories COLUMNS memory_id UNIQUE;

        REMOVE INDEX IF EXISTS idx_memory_content_hash ON TABLE memories;

        DEFINE INDEX IF NOT EXISTS idx_memory_ns_content_hash ON TABLE memories COLUMNS namespace, content_hash UNIQUE;

        DEFINE INDEX IF NOT EXISTS idx_memory_namespace ON TABLE memories COLUMNS namespace;

        DEFINE INDEX IF NOT EXISTS idx_memory_model_version ON TABLE memories COLUMNS embedding.model_version;
    "#;

    db.query(sql).await?.check()?;
    info!("✓ memories table initialized");
    Ok(())
}

/// Initialize `procedures` table
///
/// Constraints:
/// - `(namespace, step_signature_hash)` is unique
async fn init_procedures_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing procedures table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS procedures SCHEMALESS;

        DEFINE INDEX IF NOT EXISTS idx_procedure_id ON TABLE procedures COLUMNS procedure_id UNIQUE;

        REMOVE INDEX IF EXISTS idx_procedure_signature ON TABLE procedures;

        DEFINE INDEX IF NOT EXISTS idx_procedure_ns_signature ON TABLE procedures COLUMNS namespace, step_signature_hash UNIQUE;

        DEFINE INDEX IF NOT EXISTS idx_procedure_namespace ON TABLE procedures COLUMNS namespace;
    "#;

    db.query(sql).await?.check()?;
    info!("✓ procedures table initialized");
    Ok(())
}

/// Initialize `embedding_history` table (append-only)
async fn init_embedding_history_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing embedding_history table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS embedding_history AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update NONE
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_history_owner ON TABLE embedding_history COLUMNS owner_kind, owner_id;
    "#;

    db.query(sql).await?.check()?;
    info!("✓ embedding_history table initialized");
    Ok(())
}

/// Initialize `consolidation_locks` table
///
/// At most one lease row per scope key; the unique index arbitrates
/// concurrent acquirers.
async fn init_locks_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing consolidation_locks table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS consolidation_locks SCHEMALESS;

        DEFINE INDEX IF NOT EXISTS idx_lock_scope ON TABLE consolidation_locks COLUMNS scope_key UNIQUE;
    "#;

    db.query(sql).await?.check()?;
    info!("✓ consolidation_locks table initialized");
    Ok(())
}

/// Initialize `event_references` table
async fn init_references_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing event_references table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS event_references SCHEMALESS;

        DEFINE INDEX IF NOT EXISTS idx_reference_pair ON TABLE event_references COLUMNS holder, event_id UNIQUE;

        DEFINE INDEX IF NOT EXISTS idx_reference_event ON TABLE event_references COLUMNS event_id;
    "#;

    db.query(sql).await?.check()?;
    info!("✓ event_references table initialized");
    Ok(())
}
