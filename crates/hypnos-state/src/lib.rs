//! Hypnos-State: persistence layer for the Hypnos memory engine
//!
//! This crate owns every byte the consolidation engine reads or writes:
//! episodic events, synthesized memories and procedures, embedding history,
//! consolidation leases and external event references.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: conditional lifecycle transitions, unique keys, atomic merges.
//!
//! ## Key Components
//!
//! - `storage_traits`: backend-agnostic async contracts
//! - `fakes::InMemoryStore`: single-mutex backend for tests
//! - `SurrealStore`: SurrealDB backend (in-memory, surrealkv, or remote)

mod error;
pub mod fakes;
mod handle;
pub mod migrations;
mod schema;
pub mod storage_traits;
pub mod surreal_store;

pub use error::{StateError, StorageError};
pub use handle::{CloudConfig, StoreConfig};
pub use storage_traits::{
    ConsolidationLocks, ConsolidationStatus, ContentDigest, EmbeddingEntry, EmbeddingOwner,
    EmbeddingRecord, EmbeddingStore, EpisodicEvent, EventId, EventStore, InsertOutcome,
    KnowledgeStore, LockAcquisition, LockLease, MemoryBackend, MemoryId, MergeCommit, PatternId,
    Procedure, ProcedureId, ReferenceIndex, SemanticMemory, StorageResult, VersionedId,
};
pub use surreal_store::SurrealStore;

/// Result type for hypnos-state setup operations
pub type Result<T> = std::result::Result<T, StateError>;
