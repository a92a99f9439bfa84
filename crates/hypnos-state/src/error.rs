//! Error types for hypnos-state

use thiserror::Error;

/// Errors raised while connecting to or preparing the backing database
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

/// Errors returned by the storage traits.
///
/// `VersionConflict` and `UniqueViolation` are expected under contention:
/// callers re-read and retry rather than treating them as failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    /// A referenced record does not exist
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// An optimistic update lost the race against a concurrent writer
    #[error("version conflict on {id}")]
    VersionConflict { id: String },

    /// A unique key is already taken
    #[error("unique constraint violated: {key}")]
    UniqueViolation { key: String },

    /// A digest string is not 64 lowercase hex characters
    #[error("invalid digest: {digest}")]
    InvalidDigest { digest: String },

    /// A stored status string is not a known lifecycle state
    #[error("invalid consolidation status: {0}")]
    InvalidStatus(String),

    /// An in-process lock was poisoned by a panicking writer
    #[error("store lock poisoned")]
    LockPoisoned,

    /// Backend-specific failure
    #[error("backend error: {0}")]
    Backend(String),
}

impl StorageError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        StorageError::NotFound {
            kind,
            id: id.into(),
        }
    }
}

impl From<StateError> for StorageError {
    fn from(err: StateError) -> Self {
        StorageError::Backend(err.to_string())
    }
}
