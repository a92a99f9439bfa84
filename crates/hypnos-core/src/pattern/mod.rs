//! Candidate patterns: System-1 extraction and System-2 validation.
//!
//! A [`Pattern`] is a hypothesis about a cluster. It lives for one
//! consolidation run and is discarded after synthesis; only its id survives
//! as a link on the memories and procedures it produced.

pub mod extract;
pub mod validate;

use std::fmt;

use chrono::{DateTime, Utc};
use hypnos_state::{EventId, PatternId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub use extract::extract_patterns;
pub use validate::{
    validate_patterns, RejectionReason, ValidatedPattern, ValidationDecision, ValidationSettings,
    ValidationStrategy,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    /// Repeated near-identical content.
    Frequency,
    /// Ordered multi-step structure.
    Temporal,
    /// Events explicitly tagged as high-impact.
    Discovery,
}

impl PatternType {
    pub fn as_str(self) -> &'static str {
        match self {
            PatternType::Frequency => "frequency",
            PatternType::Temporal => "temporal",
            PatternType::Discovery => "discovery",
        }
    }
}

impl fmt::Display for PatternType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub id: PatternId,
    pub pattern_type: PatternType,
    pub event_type: String,
    /// Source events in timestamp order.
    pub source_event_ids: Vec<EventId>,
    /// Always in [0, 1].
    pub confidence: f32,
    pub content: String,
    /// Ordered step texts for procedure synthesis; empty for discoveries.
    #[serde(default)]
    pub steps: Vec<String>,
    /// Set once a validator has returned a verdict on this pattern.
    pub validated: bool,
    pub created_at: DateTime<Utc>,
}

impl Pattern {
    /// Id derived from the pattern type and its sources, so re-extracting
    /// the same cluster yields the same id.
    pub fn derive_id(pattern_type: PatternType, sources: &[EventId]) -> PatternId {
        let mut sorted: Vec<&str> = sources.iter().map(|id| id.as_str()).collect();
        sorted.sort_unstable();
        let mut hasher = Sha256::new();
        hasher.update(pattern_type.as_str().as_bytes());
        for id in sorted {
            hasher.update([0u8]);
            hasher.update(id.as_bytes());
        }
        let digest = hex::encode(hasher.finalize());
        PatternId(format!("pat-{}", &digest[..16]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_id_ignores_source_order() {
        let a = Pattern::derive_id(
            PatternType::Frequency,
            &[EventId::from("e1"), EventId::from("e2")],
        );
        let b = Pattern::derive_id(
            PatternType::Frequency,
            &[EventId::from("e2"), EventId::from("e1")],
        );
        let c = Pattern::derive_id(
            PatternType::Temporal,
            &[EventId::from("e1"), EventId::from("e2")],
        );
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.as_str().starts_with("pat-"));
    }
}
