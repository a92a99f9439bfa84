//! Storage trait definitions for Hypnos
//!
//! These traits define the persistence contracts the consolidation engine
//! depends on:
//! - `EventStore`: raw episodic events and their consolidation lifecycle
//! - `KnowledgeStore`: synthesized semantic memories and procedures
//! - `EmbeddingStore`: versioned vectors on any vector-bearing record
//! - `ConsolidationLocks`: per-scope run leases with stale-lease reclaim
//! - `ReferenceIndex`: external references to events (redirected on merge)
//!
//! All traits are async and backend-agnostic. An in-memory backend is
//! provided for testing via the `fakes` module.

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Generate a new random id.
            pub fn new() -> Self {
                $name(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(s.to_string())
            }
        }
    };
}

string_id!(
    /// Unique identifier of an episodic event
    EventId
);
string_id!(
    /// Unique identifier of a semantic memory
    MemoryId
);
string_id!(
    /// Unique identifier of a procedure
    ProcedureId
);
string_id!(
    /// Unique identifier of an extracted pattern
    PatternId
);

/// Content digest (SHA-256 hex string).
///
/// The inner field is private to guarantee the string is always valid
/// lowercase hex produced by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl From<ContentDigest> for String {
    fn from(d: ContentDigest) -> Self {
        d.0
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Episodic events
// ---------------------------------------------------------------------------

/// Consolidation lifecycle of an event.
///
/// Transitions: Unconsolidated → Consolidating → Consolidated, with
/// Consolidating → Unconsolidated when a run fails or is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsolidationStatus {
    Unconsolidated,
    Consolidating,
    Consolidated,
}

impl ConsolidationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unconsolidated => "unconsolidated",
            Self::Consolidating => "consolidating",
            Self::Consolidated => "consolidated",
        }
    }

    pub fn parse(s: &str) -> StorageResult<Self> {
        match s {
            "unconsolidated" => Ok(Self::Unconsolidated),
            "consolidating" => Ok(Self::Consolidating),
            "consolidated" => Ok(Self::Consolidated),
            other => Err(StorageError::InvalidStatus(other.to_string())),
        }
    }
}

impl fmt::Display for ConsolidationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A vector together with the model version that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub vector: Vec<f32>,
    pub model_version: String,
    pub created_at: DateTime<Utc>,
}

impl EmbeddingRecord {
    pub fn new(vector: Vec<f32>, model_version: impl Into<String>) -> Self {
        Self {
            vector,
            model_version: model_version.into(),
            created_at: Utc::now(),
        }
    }

    /// Override the creation time (imports and tests).
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.created_at
    }
}

/// A single recorded interaction, the raw unit of memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodicEvent {
    pub id: EventId,
    /// Scope key the event belongs to (agent, project, tenant...).
    pub namespace: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    /// Categorical kind, e.g. "tool_call", "conversation", "error".
    pub event_type: String,
    pub content: String,
    pub embedding: EmbeddingRecord,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub importance_score: f32,
    /// Associated resource (file, URL, ticket...), if any.
    #[serde(default)]
    pub resource: Option<String>,
    /// Outcome label such as "success" or "failure", if any.
    #[serde(default)]
    pub outcome: Option<String>,
    pub consolidation_status: ConsolidationStatus,
    /// Set when this event has been merged into a canonical event.
    #[serde(default)]
    pub canonical_id: Option<EventId>,
    /// Run id holding the `Consolidating` claim.
    #[serde(default)]
    pub claimed_by: Option<String>,
    /// Optimistic-lock counter, bumped on every write.
    #[serde(default)]
    pub version: u64,
}

impl EpisodicEvent {
    pub fn new(
        namespace: impl Into<String>,
        session_id: impl Into<String>,
        event_type: impl Into<String>,
        content: impl Into<String>,
        embedding: EmbeddingRecord,
    ) -> Self {
        Self {
            id: EventId::new(),
            namespace: namespace.into(),
            session_id: session_id.into(),
            timestamp: Utc::now(),
            event_type: event_type.into(),
            content: content.into(),
            embedding,
            tags: BTreeSet::new(),
            importance_score: 0.5,
            resource: None,
            outcome: None,
            consolidation_status: ConsolidationStatus::Unconsolidated,
            canonical_id: None,
            claimed_by: None,
            version: 0,
        }
    }

    pub fn with_id(mut self, id: impl Into<EventId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance_score = importance.clamp(0.0, 1.0);
        self
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn with_outcome(mut self, outcome: impl Into<String>) -> Self {
        self.outcome = Some(outcome.into());
        self
    }

    /// Merged events are kept for audit but excluded from content reads.
    pub fn is_merged(&self) -> bool {
        self.canonical_id.is_some()
    }
}

impl From<String> for EventId {
    fn from(s: String) -> Self {
        EventId(s)
    }
}

// ---------------------------------------------------------------------------
// Synthesized knowledge
// ---------------------------------------------------------------------------

/// Durable, deduplicated knowledge distilled from accepted patterns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticMemory {
    pub id: MemoryId,
    pub namespace: String,
    pub content: String,
    /// Uniqueness key over the normalised content.
    pub content_hash: ContentDigest,
    pub embedding: EmbeddingRecord,
    pub usefulness_score: f32,
    pub source_pattern_ids: Vec<PatternId>,
    pub created_at: DateTime<Utc>,
}

/// A reusable ordered workflow distilled from a temporal or frequency pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Procedure {
    pub id: ProcedureId,
    pub namespace: String,
    pub name: String,
    pub ordered_steps: Vec<String>,
    /// Uniqueness key over the ordered steps.
    pub step_signature_hash: ContentDigest,
    pub source_pattern_ids: Vec<PatternId>,
    pub effectiveness_score: f32,
    pub created_at: DateTime<Utc>,
}

/// Outcome of an insert guarded by a unique key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome<Id> {
    /// A new row was written.
    Inserted(Id),
    /// A row with the same unique key already existed; nothing was written.
    Existing(Id),
}

impl<Id> InsertOutcome<Id> {
    pub fn id(&self) -> &Id {
        match self {
            InsertOutcome::Inserted(id) | InsertOutcome::Existing(id) => id,
        }
    }

    pub fn is_inserted(&self) -> bool {
        matches!(self, InsertOutcome::Inserted(_))
    }
}

// ---------------------------------------------------------------------------
// Embeddings
// ---------------------------------------------------------------------------

/// Identifies a vector-bearing record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum EmbeddingOwner {
    Event(EventId),
    Memory(MemoryId),
}

impl EmbeddingOwner {
    pub fn kind(&self) -> &'static str {
        match self {
            EmbeddingOwner::Event(_) => "event",
            EmbeddingOwner::Memory(_) => "memory",
        }
    }

    pub fn id_str(&self) -> &str {
        match self {
            EmbeddingOwner::Event(id) => id.as_str(),
            EmbeddingOwner::Memory(id) => id.as_str(),
        }
    }
}

impl fmt::Display for EmbeddingOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id_str())
    }
}

/// A vector-bearing record as seen by the drift monitor.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingEntry {
    pub owner: EmbeddingOwner,
    /// Text the vector was computed from.
    pub content: String,
    pub embedding: EmbeddingRecord,
}

// ---------------------------------------------------------------------------
// Merge commits
// ---------------------------------------------------------------------------

/// An event id paired with the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedId {
    pub event_id: EventId,
    pub version: u64,
}

/// All writes of one duplicate merge, applied atomically.
///
/// Every row is guarded by the version it was read at; if any guard fails
/// nothing is written and `StorageError::VersionConflict` is returned.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeCommit {
    pub canonical: VersionedId,
    pub tags: BTreeSet<String>,
    pub importance_score: f32,
    /// Events to point at the canonical id. May include children of a
    /// demoted canonical, which are re-pointed to keep the forest flat.
    pub merged: Vec<VersionedId>,
}

// ---------------------------------------------------------------------------
// Locks
// ---------------------------------------------------------------------------

/// A time-bounded lease on a consolidation scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockLease {
    pub scope_key: String,
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockLease {
    pub fn new(scope_key: &str, owner: &str, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            scope_key: scope_key.to_string(),
            owner: owner.to_string(),
            acquired_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// A successfully acquired lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockAcquisition {
    pub lease: LockLease,
    /// Owner of the expired lease that was reclaimed, if any. Its claims are
    /// orphaned and must be released by the new holder.
    pub reclaimed_from: Option<String>,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Append-only store of raw episodic events.
///
/// Guarantees:
/// - Events are never physically deleted; merged events keep `canonical_id`.
/// - Lifecycle transitions are conditional per row, so two runs can never
///   claim the same event.
/// - `list_*` reads exclude merged events and are ordered by timestamp.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Record a new event. Fails with `UniqueViolation` on a duplicate id.
    async fn insert_event(&self, event: EpisodicEvent) -> StorageResult<EventId>;

    /// Fetch one event (merged or not). `NotFound` if absent.
    async fn get_event(&self, id: &EventId) -> StorageResult<EpisodicEvent>;

    /// Fetch several events in the order given. `NotFound` if any is absent.
    async fn get_events(&self, ids: &[EventId]) -> StorageResult<Vec<EpisodicEvent>>;

    /// Live events of a namespace, optionally restricted to one session.
    async fn list_live_events(
        &self,
        namespace: &str,
        session_id: Option<&str>,
    ) -> StorageResult<Vec<EpisodicEvent>>;

    /// Live events of a namespace in the given lifecycle state.
    async fn list_by_status(
        &self,
        namespace: &str,
        status: ConsolidationStatus,
    ) -> StorageResult<Vec<EpisodicEvent>>;

    /// Events whose `canonical_id` points at `canonical`.
    async fn list_merged_into(&self, canonical: &EventId) -> StorageResult<Vec<EpisodicEvent>>;

    /// Unconsolidated → Consolidating for each id still unconsolidated.
    /// Returns the ids this call actually claimed.
    async fn claim_events(&self, ids: &[EventId], run_id: &str) -> StorageResult<Vec<EventId>>;

    /// Consolidating → Consolidated for ids claimed by `run_id`.
    async fn finalize_claims(&self, ids: &[EventId], run_id: &str) -> StorageResult<usize>;

    /// Consolidating → Unconsolidated for ids claimed by `run_id`.
    async fn release_claims(&self, ids: &[EventId], run_id: &str) -> StorageResult<usize>;

    /// Consolidating → Unconsolidated for every event claimed by `run_id`.
    async fn release_run_claims(&self, run_id: &str) -> StorageResult<usize>;

    /// Apply a duplicate merge atomically (see [`MergeCommit`]).
    async fn commit_merge(&self, commit: MergeCommit) -> StorageResult<()>;
}

/// Store of synthesized knowledge with unique-key deduplication.
///
/// Guarantees:
/// - `(namespace, content_hash)` and `(namespace, step_signature_hash)` are
///   unique at all times, including under concurrent inserts; the loser gets
///   `Existing`. Equal content in two namespaces yields two records.
/// - A record is written together with its pattern links, never partially.
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    async fn insert_semantic_memory(
        &self,
        memory: SemanticMemory,
    ) -> StorageResult<InsertOutcome<MemoryId>>;

    async fn find_memory_by_hash(
        &self,
        namespace: &str,
        content_hash: &ContentDigest,
    ) -> StorageResult<Option<SemanticMemory>>;

    async fn get_memory(&self, id: &MemoryId) -> StorageResult<SemanticMemory>;

    async fn list_memories(&self, namespace: &str) -> StorageResult<Vec<SemanticMemory>>;

    /// Add a pattern link (idempotent).
    async fn link_memory_pattern(&self, id: &MemoryId, pattern: &PatternId) -> StorageResult<()>;

    async fn insert_procedure(
        &self,
        procedure: Procedure,
    ) -> StorageResult<InsertOutcome<ProcedureId>>;

    async fn find_procedure_by_signature(
        &self,
        namespace: &str,
        signature: &ContentDigest,
    ) -> StorageResult<Option<Procedure>>;

    async fn get_procedure(&self, id: &ProcedureId) -> StorageResult<Procedure>;

    async fn list_procedures(&self, namespace: &str) -> StorageResult<Vec<Procedure>>;

    /// Add a pattern link (idempotent).
    async fn link_procedure_pattern(
        &self,
        id: &ProcedureId,
        pattern: &PatternId,
    ) -> StorageResult<()>;
}

/// Versioned vectors on events and memories.
///
/// `replace_embedding` never mutates a vector in place: the previous record
/// moves to history and the new one is installed in the same atomic write,
/// so a reader sees either the old or the new record, never a mix.
#[async_trait]
pub trait EmbeddingStore: Send + Sync {
    /// Install `record` as current, returning the record it replaced.
    async fn replace_embedding(
        &self,
        owner: &EmbeddingOwner,
        record: EmbeddingRecord,
    ) -> StorageResult<EmbeddingRecord>;

    /// Superseded records for `owner`, oldest first.
    async fn embedding_history(&self, owner: &EmbeddingOwner)
        -> StorageResult<Vec<EmbeddingRecord>>;

    /// Current embeddings of live events and memories in a namespace.
    async fn list_embeddings(&self, namespace: &str) -> StorageResult<Vec<EmbeddingEntry>>;

    /// Current embeddings of the given owners. `NotFound` if any is absent.
    async fn get_embeddings(&self, owners: &[EmbeddingOwner])
        -> StorageResult<Vec<EmbeddingEntry>>;
}

/// Per-scope consolidation leases.
///
/// Semantics:
/// - At most one unexpired lease per scope key.
/// - An expired lease may be reclaimed by any caller; the previous owner is
///   reported so its orphaned claims can be released.
#[async_trait]
pub trait ConsolidationLocks: Send + Sync {
    /// Take the lease, or `None` if another owner holds an unexpired one.
    async fn try_acquire(
        &self,
        scope_key: &str,
        owner: &str,
        ttl: Duration,
    ) -> StorageResult<Option<LockAcquisition>>;

    /// Extend a held lease. `false` if `owner` no longer holds it.
    async fn renew(&self, scope_key: &str, owner: &str, ttl: Duration) -> StorageResult<bool>;

    /// Drop a held lease. `false` if `owner` did not hold it.
    async fn release(&self, scope_key: &str, owner: &str) -> StorageResult<bool>;

    async fn current(&self, scope_key: &str) -> StorageResult<Option<LockLease>>;
}

/// References held by other layers (e.g. knowledge-graph edges) to events.
#[async_trait]
pub trait ReferenceIndex: Send + Sync {
    async fn add_reference(&self, holder: &str, event: &EventId) -> StorageResult<()>;

    async fn references_to(&self, event: &EventId) -> StorageResult<Vec<String>>;

    /// Re-point every reference to `from` at `to`. Returns how many moved.
    async fn redirect_references(&self, from: &EventId, to: &EventId) -> StorageResult<usize>;
}

/// A complete backend: every storage concern behind one handle.
pub trait MemoryBackend:
    EventStore + KnowledgeStore + EmbeddingStore + ConsolidationLocks + ReferenceIndex
{
}

impl<T> MemoryBackend for T where
    T: EventStore + KnowledgeStore + EmbeddingStore + ConsolidationLocks + ReferenceIndex
{
}
