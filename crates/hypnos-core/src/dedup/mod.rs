//! Duplicate detection and merging of episodic events.
//!
//! [`DedupManager::find_duplicates`] is read-only. [`DedupManager::merge`]
//! commits one atomic, version-guarded write per attempt, so concurrent
//! merges over overlapping groups converge instead of corrupting the
//! canonical forest.

mod find;
mod merge;

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use hypnos_state::{EventId, MemoryBackend};
use serde::{Deserialize, Serialize};

use crate::config::{DedupConfig, SimilarityWeights};
use crate::error::EngineError;

/// Composite score of one compared pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairScore {
    pub a: EventId,
    pub b: EventId,
    pub score: f32,
}

/// Transitively grouped near-duplicates. Not persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    /// Members in timestamp order.
    pub event_ids: Vec<EventId>,
    /// Every compared pair inside the group that met the threshold.
    pub scores: Vec<PairScore>,
    /// Survivor under the default keep policy.
    pub canonical_id: EventId,
}

/// Which member of a group survives a merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy", content = "event_id")]
pub enum KeepPolicy {
    /// Earliest timestamp; ties go to higher importance, then smaller id.
    #[default]
    Earliest,
    MostImportant,
    Latest,
    Explicit(EventId),
}

impl fmt::Display for KeepPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeepPolicy::Earliest => f.write_str("earliest"),
            KeepPolicy::MostImportant => f.write_str("most_important"),
            KeepPolicy::Latest => f.write_str("latest"),
            KeepPolicy::Explicit(id) => write!(f, "explicit:{id}"),
        }
    }
}

impl FromStr for KeepPolicy {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "earliest" => Ok(KeepPolicy::Earliest),
            "most_important" | "most-important" => Ok(KeepPolicy::MostImportant),
            "latest" => Ok(KeepPolicy::Latest),
            other => match other.strip_prefix("explicit:") {
                Some(id) if !id.is_empty() => Ok(KeepPolicy::Explicit(EventId::from(id))),
                _ => Err(EngineError::validation(format!(
                    "unknown keep policy '{other}' (expected earliest, most_important, latest or explicit:<id>)"
                ))),
            },
        }
    }
}

/// State of a canonical event after a merge. Derived from the store, so a
/// repeated merge of the same group yields an identical value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeResult {
    pub canonical_id: EventId,
    /// Events currently pointing at the canonical.
    pub merged_count: usize,
    pub fields_unioned: Vec<String>,
    pub tags: BTreeSet<String>,
    pub importance_score: f32,
}

pub struct DedupManager {
    store: Arc<dyn MemoryBackend>,
    weights: SimilarityWeights,
    config: DedupConfig,
}

impl DedupManager {
    pub fn new(store: Arc<dyn MemoryBackend>, weights: SimilarityWeights, config: DedupConfig) -> Self {
        Self {
            store,
            weights,
            config,
        }
    }
}
