//! System 2: selective validation of low-confidence patterns.
//!
//! Patterns at or above the acceptance threshold pass straight through.
//! The rest go to the configured [`PatternValidator`] with bounded
//! parallelism and a per-call timeout. A timeout or an unavailable
//! validator rejects the pattern; it never blocks or fails the batch.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::debug;

use super::Pattern;
use crate::config::ConsolidationConfig;
use crate::metrics::METRICS;
use crate::obs;
use crate::providers::{PatternValidator, ProviderError, ValidationVerdict};

/// How below-threshold patterns are handled, chosen when the orchestrator
/// is built.
#[derive(Clone)]
pub enum ValidationStrategy {
    /// Below-threshold patterns are rejected without a second opinion.
    HeuristicOnly,
    HeuristicPlusValidator(Arc<dyn PatternValidator>),
}

impl fmt::Debug for ValidationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationStrategy::HeuristicOnly => f.write_str("HeuristicOnly"),
            ValidationStrategy::HeuristicPlusValidator(_) => f.write_str("HeuristicPlusValidator"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationSettings {
    pub acceptance_threshold: f32,
    pub max_in_flight: usize,
    pub timeout: Duration,
    pub max_adjustment: f32,
}

impl ValidationSettings {
    pub fn from_config(config: &ConsolidationConfig) -> Self {
        Self {
            acceptance_threshold: config.acceptance_threshold,
            max_in_flight: config.max_in_flight,
            timeout: config.validator_timeout(),
            max_adjustment: config.max_validator_adjustment,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum RejectionReason {
    /// Below threshold and no validator configured for this run.
    NoValidator,
    /// The validator said no, or its adjusted confidence stayed below the
    /// threshold.
    ValidatorRejected,
    Timeout,
    Unavailable(String),
    Failed(String),
}

impl RejectionReason {
    /// Timeouts and outages, as opposed to reasoned rejections.
    pub fn is_degraded(&self) -> bool {
        matches!(
            self,
            RejectionReason::Timeout | RejectionReason::Unavailable(_) | RejectionReason::Failed(_)
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            RejectionReason::NoValidator => "no_validator",
            RejectionReason::ValidatorRejected => "validator_rejected",
            RejectionReason::Timeout => "timeout",
            RejectionReason::Unavailable(_) => "unavailable",
            RejectionReason::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ValidationDecision {
    /// System-1 confidence met the threshold.
    AcceptedDirect,
    /// Escalated and accepted by the validator.
    AcceptedValidated,
    Rejected(RejectionReason),
}

impl ValidationDecision {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, ValidationDecision::Rejected(_))
    }
}

#[derive(Debug, Clone)]
pub struct ValidatedPattern {
    pub pattern: Pattern,
    pub system1_confidence: f32,
    pub decision: ValidationDecision,
}

impl ValidatedPattern {
    /// Whether a validator was consulted, whatever it answered.
    pub fn escalated(&self) -> bool {
        match &self.decision {
            ValidationDecision::AcceptedDirect => false,
            ValidationDecision::AcceptedValidated => true,
            ValidationDecision::Rejected(reason) => !matches!(reason, RejectionReason::NoValidator),
        }
    }
}

/// Move `proposed` no further than `max_adjustment` from the System-1
/// value, and keep it in [0, 1].
pub fn adjust_confidence(system1: f32, proposed: f32, max_adjustment: f32) -> f32 {
    if !proposed.is_finite() {
        return system1.clamp(0.0, 1.0);
    }
    let lo = (system1 - max_adjustment).max(0.0);
    let hi = (system1 + max_adjustment).min(1.0);
    proposed.clamp(lo, hi)
}

type CallOutcome = Result<Result<ValidationVerdict, ProviderError>, tokio::time::error::Elapsed>;

enum Slot {
    Done(ValidatedPattern),
    Pending(Pattern, JoinHandle<CallOutcome>),
}

/// Decide every pattern. Output order matches input order.
pub async fn validate_patterns(
    patterns: Vec<Pattern>,
    strategy: &ValidationStrategy,
    settings: &ValidationSettings,
) -> Vec<ValidatedPattern> {
    let validator = match strategy {
        ValidationStrategy::HeuristicPlusValidator(v) => Some(Arc::clone(v)),
        ValidationStrategy::HeuristicOnly => None,
    };
    let sem = Arc::new(Semaphore::new(settings.max_in_flight.max(1)));

    let mut slots = Vec::with_capacity(patterns.len());
    for pattern in patterns {
        let system1 = pattern.confidence;
        if system1 >= settings.acceptance_threshold {
            slots.push(Slot::Done(ValidatedPattern {
                pattern,
                system1_confidence: system1,
                decision: ValidationDecision::AcceptedDirect,
            }));
            continue;
        }
        let Some(v) = validator.clone() else {
            slots.push(Slot::Done(ValidatedPattern {
                pattern,
                system1_confidence: system1,
                decision: ValidationDecision::Rejected(RejectionReason::NoValidator),
            }));
            continue;
        };

        let sem = Arc::clone(&sem);
        let candidate = pattern.clone();
        let timeout = settings.timeout;
        let handle = tokio::spawn(async move {
            let _permit = sem.acquire_owned().await.ok();
            tokio::time::timeout(timeout, v.validate(&candidate)).await
        });
        slots.push(Slot::Pending(pattern, handle));
    }

    let mut out = Vec::with_capacity(slots.len());
    for slot in slots {
        let validated = match slot {
            Slot::Done(done) => done,
            Slot::Pending(pattern, handle) => resolve(pattern, handle.await, settings),
        };
        debug!(
            pattern_id = %validated.pattern.id,
            pattern_type = %validated.pattern.pattern_type,
            system1 = validated.system1_confidence,
            confidence = validated.pattern.confidence,
            accepted = validated.decision.is_accepted(),
            "pattern decided"
        );
        out.push(validated);
    }
    out
}

fn resolve(
    mut pattern: Pattern,
    joined: Result<CallOutcome, tokio::task::JoinError>,
    settings: &ValidationSettings,
) -> ValidatedPattern {
    let system1 = pattern.confidence;
    let decision = match joined {
        Ok(Ok(Ok(verdict))) => {
            let adjusted = adjust_confidence(system1, verdict.confidence, settings.max_adjustment);
            pattern.confidence = adjusted;
            pattern.validated = true;
            if verdict.accept && adjusted >= settings.acceptance_threshold {
                ValidationDecision::AcceptedValidated
            } else {
                ValidationDecision::Rejected(RejectionReason::ValidatorRejected)
            }
        }
        Ok(Ok(Err(ProviderError::Unavailable(detail)))) => {
            ValidationDecision::Rejected(RejectionReason::Unavailable(detail))
        }
        Ok(Ok(Err(ProviderError::Failed(detail)))) => {
            ValidationDecision::Rejected(RejectionReason::Failed(detail))
        }
        Ok(Err(_elapsed)) => {
            METRICS.inc_validator_timeouts();
            ValidationDecision::Rejected(RejectionReason::Timeout)
        }
        Err(join) => ValidationDecision::Rejected(RejectionReason::Failed(join.to_string())),
    };

    if let ValidationDecision::Rejected(reason) = &decision {
        if reason.is_degraded() {
            obs::emit_validator_degraded(pattern.id.as_str(), reason.label());
        }
    }

    ValidatedPattern {
        pattern,
        system1_confidence: system1,
        decision,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::PatternType;
    use async_trait::async_trait;
    use chrono::Utc;
    use hypnos_state::EventId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pattern(confidence: f32) -> Pattern {
        let sources = vec![EventId::new()];
        Pattern {
            id: Pattern::derive_id(PatternType::Frequency, &sources),
            pattern_type: PatternType::Frequency,
            event_type: "tool_call".into(),
            source_event_ids: sources,
            confidence,
            content: "c".into(),
            steps: Vec::new(),
            validated: false,
            created_at: Utc::now(),
        }
    }

    fn settings() -> ValidationSettings {
        ValidationSettings::from_config(&ConsolidationConfig::default())
    }

    struct Fixed(ValidationVerdict);

    #[async_trait]
    impl PatternValidator for Fixed {
        async fn validate(&self, _: &Pattern) -> Result<ValidationVerdict, ProviderError> {
            Ok(self.0)
        }
    }

    struct Down;

    #[async_trait]
    impl PatternValidator for Down {
        async fn validate(&self, _: &Pattern) -> Result<ValidationVerdict, ProviderError> {
            Err(ProviderError::Unavailable("connection refused".into()))
        }
    }

    struct Slow {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PatternValidator for Slow {
        async fn validate(&self, _: &Pattern) -> Result<ValidationVerdict, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(ValidationVerdict {
                confidence: 1.0,
                accept: true,
            })
        }
    }

    #[test]
    fn adjustment_is_bounded() {
        assert!((adjust_confidence(0.5, 1.0, 0.3) - 0.8).abs() < 1e-6);
        assert!((adjust_confidence(0.5, 0.0, 0.3) - 0.2).abs() < 1e-6);
        assert!((adjust_confidence(0.9, 1.0, 0.3) - 1.0).abs() < 1e-6);
        assert!((adjust_confidence(0.6, f32::NAN, 0.3) - 0.6).abs() < 1e-6);
    }

    #[tokio::test]
    async fn heuristic_only_rejects_low_confidence() {
        let out = validate_patterns(
            vec![pattern(0.9), pattern(0.4)],
            &ValidationStrategy::HeuristicOnly,
            &settings(),
        )
        .await;
        assert_eq!(out[0].decision, ValidationDecision::AcceptedDirect);
        assert_eq!(
            out[1].decision,
            ValidationDecision::Rejected(RejectionReason::NoValidator)
        );
        assert!(!out[1].escalated());
    }

    #[tokio::test]
    async fn validator_can_lift_a_borderline_pattern() {
        let v = Arc::new(Fixed(ValidationVerdict {
            confidence: 0.95,
            accept: true,
        }));
        let out = validate_patterns(
            vec![pattern(0.6)],
            &ValidationStrategy::HeuristicPlusValidator(v),
            &settings(),
        )
        .await;
        assert_eq!(out[0].decision, ValidationDecision::AcceptedValidated);
        assert!(out[0].pattern.validated);
        // 0.6 + 0.3 cap
        assert!((out[0].pattern.confidence - 0.9).abs() < 1e-6);
    }

    #[tokio::test]
    async fn accept_below_threshold_is_still_rejected() {
        let v = Arc::new(Fixed(ValidationVerdict {
            confidence: 0.1,
            accept: true,
        }));
        let out = validate_patterns(
            vec![pattern(0.5)],
            &ValidationStrategy::HeuristicPlusValidator(v),
            &settings(),
        )
        .await;
        assert_eq!(
            out[0].decision,
            ValidationDecision::Rejected(RejectionReason::ValidatorRejected)
        );
        assert!((out[0].pattern.confidence - 0.2).abs() < 1e-6);
    }

    #[tokio::test]
    async fn unavailable_is_distinct_from_rejection() {
        let out = validate_patterns(
            vec![pattern(0.5)],
            &ValidationStrategy::HeuristicPlusValidator(Arc::new(Down)),
            &settings(),
        )
        .await;
        assert!(matches!(
            out[0].decision,
            ValidationDecision::Rejected(RejectionReason::Unavailable(_))
        ));
        assert!(!out[0].pattern.validated);
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_reject_without_blocking() {
        let slow = Arc::new(Slow {
            calls: AtomicUsize::new(0),
        });
        let patterns = (0..6).map(|_| pattern(0.5)).collect();
        let out = validate_patterns(
            patterns,
            &ValidationStrategy::HeuristicPlusValidator(slow.clone()),
            &settings(),
        )
        .await;
        assert_eq!(out.len(), 6);
        assert!(out
            .iter()
            .all(|p| p.decision == ValidationDecision::Rejected(RejectionReason::Timeout)));
        assert_eq!(slow.calls.load(Ordering::SeqCst), 6);
    }
}
