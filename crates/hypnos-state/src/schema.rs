//! Schema definitions for Hypnos SurrealDB tables
//!
//! Tables:
//! - events: Raw episodic events (append-only, merged rows kept for audit)
//! - memories: Synthesized semantic memories (unique on namespace + content_hash)
//! - procedures: Synthesized procedures (unique on namespace + step_signature_hash)
//! - embedding_history: Superseded embeddings, one row per replacement
//! - consolidation_locks: Per-scope run leases (unique on scope_key)
//! - event_references: External references to events (unique per holder/event)
//!
//! Row types convert to and from `storage_traits` types at the boundary.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::storage_traits::{
    ConsolidationStatus, ContentDigest, EmbeddingRecord, EpisodicEvent, EventId, LockLease,
    MemoryId, PatternId, Procedure, ProcedureId, SemanticMemory, StorageResult,
};

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Vector plus model version, stored inline on events and memories
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbEmbedding {
    pub vector: Vec<f32>,
    pub model_version: String,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
}

impl From<EmbeddingRecord> for DbEmbedding {
    fn from(r: EmbeddingRecord) -> Self {
        DbEmbedding {
            vector: r.vector,
            model_version: r.model_version,
            created_at: r.created_at,
        }
    }
}

impl From<DbEmbedding> for EmbeddingRecord {
    fn from(r: DbEmbedding) -> Self {
        EmbeddingRecord {
            vector: r.vector,
            model_version: r.model_version,
            created_at: r.created_at,
        }
    }
}

/// Episodic event row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRow {
    /// SurrealDB record ID
    pub id: Option<surrealdb::sql::Thing>,
    /// Application event id (unique)
    pub event_id: String,
    pub namespace: String,
    pub session_id: String,
    #[serde(with = "surreal_datetime")]
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub content: String,
    pub embedding: DbEmbedding,
    pub tags: Vec<String>,
    pub importance_score: f32,
    pub resource: Option<String>,
    pub outcome: Option<String>,
    /// One of: unconsolidated | consolidating | consolidated
    pub consolidation_status: String,
    /// Denormalised `canonical_id.is_some()` so filters never compare NONE
    pub merged: bool,
    pub canonical_id: Option<String>,
    pub claimed_by: Option<String>,
    pub version: u64,
}

impl From<EpisodicEvent> for EventRow {
    fn from(e: EpisodicEvent) -> Self {
        EventRow {
            id: None,
            event_id: e.id.0,
            namespace: e.namespace,
            session_id: e.session_id,
            timestamp: e.timestamp,
            event_type: e.event_type,
            content: e.content,
            embedding: e.embedding.into(),
            tags: e.tags.into_iter().collect(),
            importance_score: e.importance_score,
            resource: e.resource,
            outcome: e.outcome,
            consolidation_status: e.consolidation_status.as_str().to_string(),
            merged: e.canonical_id.is_some(),
            canonical_id: e.canonical_id.map(|c| c.0),
            claimed_by: e.claimed_by,
            version: e.version,
        }
    }
}

impl TryFrom<EventRow> for EpisodicEvent {
    type Error = StorageError;

    fn try_from(row: EventRow) -> StorageResult<Self> {
        Ok(EpisodicEvent {
            id: EventId(row.event_id),
            namespace: row.namespace,
            session_id: row.session_id,
            timestamp: row.timestamp,
            event_type: row.event_type,
            content: row.content,
            embedding: row.embedding.into(),
            tags: row.tags.into_iter().collect::<BTreeSet<_>>(),
            importance_score: row.importance_score,
            resource: row.resource,
            outcome: row.outcome,
            consolidation_status: ConsolidationStatus::parse(&row.consolidation_status)?,
            canonical_id: row.canonical_id.map(EventId),
            claimed_by: row.claimed_by,
            version: row.version,
        })
    }
}

/// Semantic memory row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRow {
    pub id: Option<surrealdb::sql::Thing>,
    pub memory_id: String,
    pub namespace: String,
    pub content: String,
    /// SHA-256 of the normalised content (unique)
    pub content_hash: String,
    pub embedding: DbEmbedding,
    pub usefulness_score: f32,
    pub source_pattern_ids: Vec<String>,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
}

impl From<SemanticMemory> for MemoryRow {
    fn from(m: SemanticMemory) -> Self {
        MemoryRow {
            id: None,
            memory_id: m.id.0,
            namespace: m.namespace,
            content: m.content,
            content_hash: m.content_hash.into(),
            embedding: m.embedding.into(),
            usefulness_score: m.usefulness_score,
            source_pattern_ids: m.source_pattern_ids.into_iter().map(|p| p.0).collect(),
            created_at: m.created_at,
        }
    }
}

impl TryFrom<MemoryRow> for SemanticMemory {
    type Error = StorageError;

    fn try_from(row: MemoryRow) -> StorageResult<Self> {
        Ok(SemanticMemory {
            id: MemoryId(row.memory_id),
            namespace: row.namespace,
            content: row.content,
            content_hash: ContentDigest::try_from(row.content_hash)?,
            embedding: row.embedding.into(),
            usefulness_score: row.usefulness_score,
            source_pattern_ids: row.source_pattern_ids.into_iter().map(PatternId).collect(),
            created_at: row.created_at,
        })
    }
}

/// Procedure row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcedureRow {
    pub id: Option<surrealdb::sql::Thing>,
    pub procedure_id: String,
    pub namespace: String,
    pub name: String,
    pub ordered_steps: Vec<String>,
    /// SHA-256 over the ordered steps (unique)
    pub step_signature_hash: String,
    pub source_pattern_ids: Vec<String>,
    pub effectiveness_score: f32,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
}

impl From<Procedure> for ProcedureRow {
    fn from(p: Procedure) -> Self {
        ProcedureRow {
            id: None,
            procedure_id: p.id.0,
            namespace: p.namespace,
            name: p.name,
            ordered_steps: p.ordered_steps,
            step_signature_hash: p.step_signature_hash.into(),
            source_pattern_ids: p.source_pattern_ids.into_iter().map(|p| p.0).collect(),
            effectiveness_score: p.effectiveness_score,
            created_at: p.created_at,
        }
    }
}

impl TryFrom<ProcedureRow> for Procedure {
    type Error = StorageError;

    fn try_from(row: ProcedureRow) -> StorageResult<Self> {
        Ok(Procedure {
            id: ProcedureId(row.procedure_id),
            namespace: row.namespace,
            name: row.name,
            ordered_steps: row.ordered_steps,
            step_signature_hash: ContentDigest::try_from(row.step_signature_hash)?,
            source_pattern_ids: row.source_pattern_ids.into_iter().map(PatternId).collect(),
            effectiveness_score: row.effectiveness_score,
            created_at: row.created_at,
        })
    }
}

/// Superseded embedding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingHistoryRow {
    pub id: Option<surrealdb::sql::Thing>,
    /// "event" | "memory"
    pub owner_kind: String,
    pub owner_id: String,
    pub embedding: DbEmbedding,
    #[serde(with = "surreal_datetime")]
    pub archived_at: DateTime<Utc>,
}

/// Consolidation lease row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRow {
    pub id: Option<surrealdb::sql::Thing>,
    pub scope_key: String,
    pub owner: String,
    #[serde(with = "surreal_datetime")]
    pub acquired_at: DateTime<Utc>,
    #[serde(with = "surreal_datetime")]
    pub expires_at: DateTime<Utc>,
}

impl From<LockLease> for LockRow {
    fn from(l: LockLease) -> Self {
        LockRow {
            id: None,
            scope_key: l.scope_key,
            owner: l.owner,
            acquired_at: l.acquired_at,
            expires_at: l.expires_at,
        }
    }
}

impl From<LockRow> for LockLease {
    fn from(r: LockRow) -> Self {
        LockLease {
            scope_key: r.scope_key,
            owner: r.owner,
            acquired_at: r.acquired_at,
            expires_at: r.expires_at,
        }
    }
}

/// External reference to an event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceRow {
    pub id: Option<surrealdb::sql::Thing>,
    pub holder: String,
    pub event_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_traits::EpisodicEvent;

    #[test]
    fn event_row_round_trip_keeps_lifecycle_fields() {
        let mut event = EpisodicEvent::new(
            "ns",
            "s1",
            "tool_call",
            "ran cargo fmt",
            EmbeddingRecord::new(vec![1.0, 0.0], "m1"),
        )
        .with_tags(["fmt"]);
        event.canonical_id = Some(EventId::from("canon"));
        event.version = 3;

        let row = EventRow::from(event.clone());
        assert!(row.merged);
        assert_eq!(row.consolidation_status, "unconsolidated");

        let back = EpisodicEvent::try_from(row).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn memory_row_rejects_bad_digest() {
        let row = MemoryRow {
            id: None,
            memory_id: "m".into(),
            namespace: "ns".into(),
            content: "x".into(),
            content_hash: "not-a-digest".into(),
            embedding: EmbeddingRecord::new(vec![], "m1").into(),
            usefulness_score: 0.8,
            source_pattern_ids: vec![],
            created_at: Utc::now(),
        };
        assert!(SemanticMemory::try_from(row).is_err());
    }
}
