use serde::{Deserialize, Serialize};

/// Per-run knobs. The validator wiring itself is fixed when the
/// orchestrator is built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationStrategy {
    /// Max events claimed by this run; falls back to the configured default.
    pub batch_limit: Option<usize>,
    /// Treat this run as heuristic-only even if a validator is configured.
    pub skip_validation: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every cluster finalised.
    Completed,
    /// Some clusters failed and were released; the rest finalised.
    Partial,
    /// Stopped at a cluster boundary; unfinished clusters were released.
    Cancelled,
    /// Every cluster failed.
    Failed,
}

impl RunOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RunOutcome::Completed => "completed",
            RunOutcome::Partial => "partial",
            RunOutcome::Cancelled => "cancelled",
            RunOutcome::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterFailure {
    pub cluster: String,
    pub event_count: usize,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationReport {
    pub run_id: String,
    pub scope: String,
    /// Events finalised as consolidated by this run.
    pub events_processed: usize,
    /// Accepted patterns.
    pub patterns_extracted: usize,
    pub discoveries_found: usize,
    pub memories_created: usize,
    pub procedures_created: usize,
    pub rejected_count: usize,
    pub candidates_extracted: usize,
    /// Patterns a validator returned a verdict on.
    pub validated_count: usize,
    pub memories_reused: usize,
    pub procedures_reused: usize,
    /// Claims returned to unconsolidated: failed or cancelled clusters, plus
    /// orphans of a reclaimed lock.
    pub events_reverted: usize,
    pub cluster_failures: Vec<ClusterFailure>,
    pub outcome: RunOutcome,
    pub duration_ms: u64,
}

impl ConsolidationReport {
    pub(crate) fn empty(run_id: &str, scope: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            scope: scope.to_string(),
            events_processed: 0,
            patterns_extracted: 0,
            discoveries_found: 0,
            memories_created: 0,
            procedures_created: 0,
            rejected_count: 0,
            candidates_extracted: 0,
            validated_count: 0,
            memories_reused: 0,
            procedures_reused: 0,
            events_reverted: 0,
            cluster_failures: Vec::new(),
            outcome: RunOutcome::Completed,
            duration_ms: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Completed
    }
}
