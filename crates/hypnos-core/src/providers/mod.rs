//! External collaborators: embedding and pattern-validation providers.
//!
//! Both are async traits held as `Arc<dyn ...>`. A provider distinguishes
//! "I am down" (`Unavailable`) from "I tried and failed" (`Failed`); the
//! engine degrades differently on each.

pub mod hashing;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::pattern::Pattern;

pub use hashing::HashingEmbedder;

/// Errors a provider may report.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("provider call failed: {0}")]
    Failed(String),
}

/// A freshly computed vector and the model version that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub vector: Vec<f32>,
    pub model_version: String,
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Embedding, ProviderError>;

    /// Version tag stamped on every vector this provider produces.
    fn model_version(&self) -> String;
}

/// System-2 verdict on a candidate pattern.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValidationVerdict {
    /// Proposed confidence; the engine clamps it around the System-1 value.
    pub confidence: f32,
    pub accept: bool,
}

#[async_trait]
pub trait PatternValidator: Send + Sync {
    async fn validate(&self, pattern: &Pattern) -> Result<ValidationVerdict, ProviderError>;
}
