//! End-to-end consolidation runs.
//!
//! One run per scope at a time, enforced by a renewable lease. Events are
//! claimed with a conditional per-row update, so overlapping scopes can
//! never double-process an event. Each cluster is synthesised and then
//! finalised on its own, which makes cluster boundaries the checkpoints for
//! failure and cancellation.

mod phase;
mod report;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use hypnos_state::{ConsolidationStatus, EventId, MemoryBackend};
use tokio::sync::watch;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

pub use phase::{ConsolidationPhase, PhaseTracker};
pub use report::{ClusterFailure, ConsolidationReport, ConsolidationStrategy, RunOutcome};

use crate::cluster::{cluster_events, Cluster};
use crate::config::ConsolidationConfig;
use crate::error::{EngineError, EngineResult};
use crate::metrics::METRICS;
use crate::obs;
use crate::pattern::{
    extract_patterns, validate_patterns, PatternType, ValidatedPattern, ValidationSettings,
    ValidationStrategy,
};
use crate::providers::EmbeddingProvider;
use crate::scope::Scope;
use crate::synthesis::{MemorySynthesizer, SynthesisOutcome};

pub struct Orchestrator {
    store: Arc<dyn MemoryBackend>,
    synthesizer: MemorySynthesizer,
    validation: ValidationStrategy,
    config: ConsolidationConfig,
}

/// Mutable state of one run.
struct RunContext {
    run_id: String,
    lock_key: String,
    phases: PhaseTracker,
    report: ConsolidationReport,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn MemoryBackend>,
        embedder: Arc<dyn EmbeddingProvider>,
        validation: ValidationStrategy,
        config: ConsolidationConfig,
    ) -> Self {
        let synthesizer =
            MemorySynthesizer::new(Arc::clone(&store), embedder, config.acceptance_threshold);
        Self {
            store,
            synthesizer,
            validation,
            config,
        }
    }

    pub async fn run_consolidation(
        &self,
        scope: &Scope,
        strategy: &ConsolidationStrategy,
    ) -> EngineResult<ConsolidationReport> {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        self.run_consolidation_with_cancel(scope, strategy, cancel_rx)
            .await
    }

    /// Like [`Orchestrator::run_consolidation`], stopping at the next
    /// cluster boundary once `cancel` turns true.
    pub async fn run_consolidation_with_cancel(
        &self,
        scope: &Scope,
        strategy: &ConsolidationStrategy,
        cancel: watch::Receiver<bool>,
    ) -> EngineResult<ConsolidationReport> {
        scope.validate()?;
        if strategy.batch_limit == Some(0) {
            return Err(EngineError::validation("batch_limit must be >= 1"));
        }

        let run_id = format!("run-{}", Uuid::new_v4());
        let lock_key = scope.lock_key();
        let span = obs::ConsolidationSpan::new(&run_id, &lock_key);
        self.run(scope, strategy, cancel, run_id, lock_key)
            .instrument(span.span())
            .await
    }

    async fn run(
        &self,
        scope: &Scope,
        strategy: &ConsolidationStrategy,
        cancel: watch::Receiver<bool>,
        run_id: String,
        lock_key: String,
    ) -> EngineResult<ConsolidationReport> {
        let started = Instant::now();
        let ttl = self.config.lock_ttl();

        let acquisition = match self
            .store
            .try_acquire(&lock_key, &run_id, ttl)
            .await
            .map_err(EngineError::from_storage)?
        {
            Some(acquisition) => acquisition,
            None => {
                let holder = self
                    .store
                    .current(&lock_key)
                    .await
                    .ok()
                    .flatten()
                    .map(|lease| lease.owner)
                    .unwrap_or_else(|| "unknown".to_string());
                return Err(EngineError::ConsolidationInProgress {
                    scope: lock_key,
                    holder,
                });
            }
        };

        let mut ctx = RunContext {
            report: ConsolidationReport::empty(&run_id, &lock_key),
            run_id,
            lock_key,
            phases: PhaseTracker::new(),
        };

        if let Some(previous) = acquisition.reclaimed_from {
            match self.store.release_run_claims(&previous).await {
                Ok(n) => {
                    warn!(previous_owner = %previous, reverted = n, "reclaimed stale consolidation lock");
                    ctx.report.events_reverted += n;
                }
                Err(e) => {
                    self.release_lock(&ctx).await;
                    return Err(EngineError::from_storage(e));
                }
            }
        }

        let result = self.run_locked(&mut ctx, scope, strategy, &cancel).await;

        if let Err(e) = &result {
            warn!(error = %e, phase = %ctx.phases.current(), "consolidation run failed");
            let _ = ctx.phases.advance(ConsolidationPhase::Failed);
            // Claims of clusters that never reached a checkpoint go back.
            match self.store.release_run_claims(&ctx.run_id).await {
                Ok(n) => ctx.report.events_reverted += n,
                Err(release_err) => {
                    warn!(error = %release_err, "could not release claims of failed run")
                }
            }
            let _ = ctx.phases.advance(ConsolidationPhase::Idle);
        }
        self.release_lock(&ctx).await;
        result?;

        ctx.report.duration_ms = started.elapsed().as_millis() as u64;
        let r = &ctx.report;
        obs::emit_consolidation_finished(
            &r.run_id,
            r.outcome.as_str(),
            r.events_processed,
            r.patterns_extracted,
            r.rejected_count,
            r.duration_ms,
        );
        METRICS.flush();
        Ok(ctx.report)
    }

    async fn release_lock(&self, ctx: &RunContext) {
        match self.store.release(&ctx.lock_key, &ctx.run_id).await {
            Ok(true) => {}
            Ok(false) => warn!(run_id = %ctx.run_id, "consolidation lock was no longer held"),
            Err(e) => warn!(run_id = %ctx.run_id, error = %e, "failed to release consolidation lock"),
        }
    }

    /// Record a phase change and renew the lease.
    async fn advance(&self, ctx: &mut RunContext, next: ConsolidationPhase) -> EngineResult<()> {
        let previous = ctx.phases.advance(next)?;
        obs::emit_phase(&ctx.run_id, previous.as_str(), next.as_str());
        if next == ConsolidationPhase::Idle {
            return Ok(());
        }
        let renewed = self
            .store
            .renew(&ctx.lock_key, &ctx.run_id, self.config.lock_ttl())
            .await
            .map_err(EngineError::from_storage)?;
        if !renewed {
            return Err(EngineError::Consistency(format!(
                "consolidation lease on {} was lost",
                ctx.lock_key
            )));
        }
        Ok(())
    }

    async fn run_locked(
        &self,
        ctx: &mut RunContext,
        scope: &Scope,
        strategy: &ConsolidationStrategy,
        cancel: &watch::Receiver<bool>,
    ) -> EngineResult<()> {
        // -- Selecting ------------------------------------------------------
        self.advance(ctx, ConsolidationPhase::Selecting).await?;
        let mut pending = self
            .store
            .list_by_status(&scope.namespace, ConsolidationStatus::Unconsolidated)
            .await
            .map_err(EngineError::from_storage)?;
        if let Some(session) = &scope.session_id {
            pending.retain(|e| &e.session_id == session);
        }
        if let Some(limit) = strategy.batch_limit.or(self.config.default_batch_limit) {
            pending.truncate(limit);
        }

        let ids: Vec<EventId> = pending.iter().map(|e| e.id.clone()).collect();
        let claimed: HashSet<EventId> = self
            .store
            .claim_events(&ids, &ctx.run_id)
            .await
            .map_err(EngineError::from_storage)?
            .into_iter()
            .collect();
        pending.retain(|e| claimed.contains(&e.id));
        obs::emit_consolidation_started(&ctx.run_id, &ctx.lock_key, pending.len());

        if pending.is_empty() {
            return self.advance(ctx, ConsolidationPhase::Idle).await;
        }

        // -- Clustering -----------------------------------------------------
        self.advance(ctx, ConsolidationPhase::Clustering).await?;
        let clusters = cluster_events(pending, self.config.cluster_gap());
        if *cancel.borrow() {
            self.cancel_remaining(ctx, &clusters).await;
            return self.advance(ctx, ConsolidationPhase::Idle).await;
        }

        // -- Extracting -----------------------------------------------------
        self.advance(ctx, ConsolidationPhase::Extracting).await?;
        let now = Utc::now();
        let mut candidates = Vec::new();
        let mut owners = Vec::new();
        for (idx, cluster) in clusters.iter().enumerate() {
            for pattern in extract_patterns(cluster, now, &self.config) {
                owners.push(idx);
                candidates.push(pattern);
            }
        }
        ctx.report.candidates_extracted = candidates.len();

        // -- Validating -----------------------------------------------------
        self.advance(ctx, ConsolidationPhase::Validating).await?;
        let effective = if strategy.skip_validation {
            ValidationStrategy::HeuristicOnly
        } else {
            self.validation.clone()
        };
        let decided = validate_patterns(
            candidates,
            &effective,
            &ValidationSettings::from_config(&self.config),
        )
        .await;
        let mut per_cluster: Vec<Vec<ValidatedPattern>> = vec![Vec::new(); clusters.len()];
        for (idx, validated) in owners.into_iter().zip(decided) {
            per_cluster[idx].push(validated);
        }

        // -- Synthesizing / Finalizing, one cluster at a time ---------------
        for (idx, (cluster, decided)) in clusters.iter().zip(per_cluster).enumerate() {
            if *cancel.borrow() {
                info!(run_id = %ctx.run_id, remaining = clusters.len() - idx, "consolidation cancelled");
                self.cancel_remaining(ctx, &clusters[idx..]).await;
                return self.advance(ctx, ConsolidationPhase::Idle).await;
            }

            self.advance(ctx, ConsolidationPhase::Synthesizing).await?;
            let failure = self.synthesize_cluster(ctx, scope, &decided).await;

            self.advance(ctx, ConsolidationPhase::Finalizing).await?;
            let ids = cluster.event_ids();
            let failure = match failure {
                Some(reason) => Some(reason),
                None => match self.store.finalize_claims(&ids, &ctx.run_id).await {
                    Ok(n) => {
                        ctx.report.events_processed += n;
                        METRICS.add_events_consolidated(n as u64);
                        None
                    }
                    Err(e) => Some(format!("finalize failed: {e}")),
                },
            };
            if let Some(reason) = failure {
                self.fail_cluster(ctx, cluster, reason).await;
            }
        }

        let r = &mut ctx.report;
        r.outcome = if r.cluster_failures.is_empty() {
            RunOutcome::Completed
        } else if r.cluster_failures.len() == clusters.len() {
            RunOutcome::Failed
        } else {
            RunOutcome::Partial
        };
        self.advance(ctx, ConsolidationPhase::Idle).await
    }

    /// Write the accepted patterns of one cluster. Returns the first failure,
    /// after which the cluster's remaining patterns are skipped.
    async fn synthesize_cluster(
        &self,
        ctx: &mut RunContext,
        scope: &Scope,
        decided: &[ValidatedPattern],
    ) -> Option<String> {
        for v in decided {
            if v.pattern.validated {
                ctx.report.validated_count += 1;
            }
            if !v.decision.is_accepted() {
                ctx.report.rejected_count += 1;
                METRICS.inc_patterns_rejected();
                continue;
            }
            ctx.report.patterns_extracted += 1;
            METRICS.inc_patterns_accepted();
            if v.pattern.pattern_type == PatternType::Discovery {
                ctx.report.discoveries_found += 1;
            }

            match self
                .synthesizer
                .create_semantic_memory(&scope.namespace, &v.pattern)
                .await
            {
                SynthesisOutcome::Created(_) => ctx.report.memories_created += 1,
                SynthesisOutcome::Skipped(_) => ctx.report.memories_reused += 1,
                SynthesisOutcome::Failed(reason) => return Some(reason),
            }

            match self
                .synthesizer
                .create_procedure(&scope.namespace, &v.pattern)
                .await
            {
                Some(SynthesisOutcome::Created(_)) => ctx.report.procedures_created += 1,
                Some(SynthesisOutcome::Skipped(_)) => ctx.report.procedures_reused += 1,
                Some(SynthesisOutcome::Failed(reason)) => return Some(reason),
                None => {}
            }
        }
        None
    }

    async fn fail_cluster(&self, ctx: &mut RunContext, cluster: &Cluster, reason: String) {
        obs::emit_cluster_failed(&ctx.run_id, &cluster.label(), &reason);
        match self
            .store
            .release_claims(&cluster.event_ids(), &ctx.run_id)
            .await
        {
            Ok(n) => ctx.report.events_reverted += n,
            Err(e) => warn!(cluster = %cluster.label(), error = %e, "failed to release cluster claims"),
        }
        ctx.report.cluster_failures.push(ClusterFailure {
            cluster: cluster.label(),
            event_count: cluster.len(),
            reason,
        });
    }

    async fn cancel_remaining(&self, ctx: &mut RunContext, clusters: &[Cluster]) {
        let ids: Vec<EventId> = clusters.iter().flat_map(|c| c.event_ids()).collect();
        match self.store.release_claims(&ids, &ctx.run_id).await {
            Ok(n) => ctx.report.events_reverted += n,
            Err(e) => warn!(error = %e, "failed to release claims of cancelled clusters"),
        }
        ctx.report.outcome = RunOutcome::Cancelled;
    }
}
