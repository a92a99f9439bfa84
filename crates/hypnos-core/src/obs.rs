//! Structured observability hooks for consolidation lifecycle events.
//!
//! This module provides:
//! - Run-scoped tracing spans via `ConsolidationSpan`
//! - Emission functions for run start/finish, phase changes, merges,
//!   degraded validator calls and drift reports
//!
//! Events are emitted at `info!` level, degradations at `warn!`. Filtering
//! follows `RUST_LOG`; see [`crate::telemetry::init_tracing`].

use tracing::{info, warn};

/// Run-scoped span for a consolidation run.
///
/// # Example
///
/// ```ignore
/// let span = ConsolidationSpan::new("run-12345", "agent-1");
/// run.instrument(span.span()).await;
/// // every event logged by `run` carries run_id and scope
/// ```
pub struct ConsolidationSpan {
    span: tracing::Span,
}

impl ConsolidationSpan {
    pub fn new(run_id: &str, scope: &str) -> Self {
        Self {
            span: tracing::info_span!("hypnos.consolidation", run_id = %run_id, scope = %scope),
        }
    }

    pub fn span(&self) -> tracing::Span {
        self.span.clone()
    }
}

/// Emit event: consolidation run started and claimed `claimed` events.
pub fn emit_consolidation_started(run_id: &str, scope: &str, claimed: usize) {
    info!(
        event = "consolidation.started",
        run_id = %run_id,
        scope = %scope,
        claimed = claimed,
    );
}

pub fn emit_phase(run_id: &str, from: &str, to: &str) {
    info!(event = "consolidation.phase", run_id = %run_id, from = %from, to = %to);
}

/// Emit event: run finished with its headline counters.
pub fn emit_consolidation_finished(
    run_id: &str,
    outcome: &str,
    events_processed: usize,
    patterns_accepted: usize,
    rejected: usize,
    duration_ms: u64,
) {
    info!(
        event = "consolidation.finished",
        run_id = %run_id,
        outcome = %outcome,
        events_processed = events_processed,
        patterns_accepted = patterns_accepted,
        rejected = rejected,
        duration_ms = duration_ms,
    );
}

/// Emit event: a single cluster failed and its events were released.
pub fn emit_cluster_failed(run_id: &str, cluster: &str, error: &dyn std::fmt::Display) {
    warn!(event = "consolidation.cluster_failed", run_id = %run_id, cluster = %cluster, error = %error);
}

pub fn emit_dedup_merged(canonical_id: &str, merged: usize, references_redirected: usize) {
    info!(
        event = "dedup.merged",
        canonical_id = %canonical_id,
        merged = merged,
        references_redirected = references_redirected,
    );
}

/// Emit event: a validator call timed out or the validator was down. Kept
/// apart from reasoned rejections so operators can tell the two apart.
pub fn emit_validator_degraded(pattern_id: &str, reason: &str) {
    warn!(event = "validator.degraded", pattern_id = %pattern_id, reason = %reason);
}

pub fn emit_drift_detected(scope: &str, stale: usize, total: usize, active_version: &str) {
    info!(
        event = "drift.detected",
        scope = %scope,
        stale = stale,
        total = total,
        active_version = %active_version,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_and_emitters_do_not_panic() {
        let span = ConsolidationSpan::new("run-1", "agent").span();
        let _guard = span.enter();
        emit_consolidation_started("run-1", "agent", 3);
        emit_phase("run-1", "idle", "selecting");
        emit_validator_degraded("pat-1", "timeout");
    }
}
