//! Engine-level error taxonomy for Hypnos.

use hypnos_state::StorageError;

/// Errors produced by the consolidation engine.
///
/// Per-cluster failures inside a consolidation run are not surfaced through
/// this type; they are collected into the run report instead. Validator
/// timeouts likewise end as `RejectionReason::Timeout` on the pattern.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Malformed input, rejected before any state change.
    #[error("validation error: {0}")]
    Validation(String),

    /// Embedding or validation provider is down.
    #[error("resource unavailable: {resource}: {detail}")]
    ResourceUnavailable { resource: String, detail: String },

    /// Double claim, overlapping groups, or a uniqueness race that did not
    /// resolve after retrying.
    #[error("consistency error: {0}")]
    Consistency(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: String, id: String },

    /// Another run holds the scope lock; retry later.
    #[error("consolidation already running for scope {scope} (held by {holder})")]
    ConsolidationInProgress { scope: String, holder: String },

    #[error("operation registered twice: {name}")]
    DuplicateOperation { name: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Map storage `NotFound` onto the engine's own variant so callers
    /// match on one shape.
    pub fn from_storage(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { kind, id } => EngineError::NotFound {
                kind: kind.to_string(),
                id,
            },
            other => EngineError::Storage(other),
        }
    }
}

/// Result type for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;
