//! Engine configuration.
//!
//! Every section is `#[serde(default)]`, so a partial TOML file only needs
//! the keys it overrides:
//!
//! ```toml
//! [similarity]
//! content = 0.8
//!
//! [consolidation]
//! acceptance_threshold = 0.75
//! validator_timeout_ms = 2000
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Longest window, gap or lease the engine accepts (100 years).
pub const MAX_SPAN_SECS: i64 = 100 * 365 * 86_400;
const MAX_SPAN_DAYS: i64 = MAX_SPAN_SECS / 86_400;

/// Caller-supplied seconds as a duration in `1..=MAX_SPAN_SECS`.
pub fn span_from_secs(name: &str, secs: i64) -> EngineResult<chrono::Duration> {
    if !(1..=MAX_SPAN_SECS).contains(&secs) {
        return Err(EngineError::validation(format!(
            "{name} must be between 1 and {MAX_SPAN_SECS} seconds, got {secs}"
        )));
    }
    chrono::Duration::try_seconds(secs)
        .ok_or_else(|| EngineError::validation(format!("{name} out of range: {secs}")))
}

fn bounded_secs(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_SPAN_SECS as u64) as i64)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub similarity: SimilarityWeights,
    pub dedup: DedupConfig,
    pub consolidation: ConsolidationConfig,
    pub drift: DriftConfig,
}

/// Weights of the composite similarity signals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityWeights {
    /// Cosine similarity of embeddings (primary signal)
    pub content: f32,
    /// Linear decay from 1 at gap 0 to 0 at the comparison window
    pub temporal: f32,
    pub event_type: f32,
    pub resource: f32,
    pub outcome: f32,
}

impl Default for SimilarityWeights {
    fn default() -> Self {
        Self {
            content: 0.70,
            temporal: 0.15,
            event_type: 0.05,
            resource: 0.05,
            outcome: 0.05,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub default_threshold: f32,
    pub default_window_secs: u64,
    /// Compare and merge events across session boundaries.
    pub allow_cross_session: bool,
    /// Optimistic merge retries before surfacing a consistency error.
    pub max_merge_attempts: u32,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            default_threshold: 0.85,
            default_window_secs: 600,
            allow_cross_session: false,
            max_merge_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationConfig {
    /// Patterns at or above this confidence are accepted without validation.
    pub acceptance_threshold: f32,
    /// Max gap between consecutive events of one cluster.
    pub cluster_gap_secs: u64,
    /// Cosine at which two contents count as the same for frequency patterns.
    pub near_identical_similarity: f32,
    pub min_frequency: usize,
    pub min_sequence_events: usize,
    pub discovery_tags: Vec<String>,
    /// Cluster size at which the size component of confidence saturates.
    pub size_saturation: usize,
    pub recency_half_life_days: f64,
    /// Concurrent validator calls.
    pub max_in_flight: usize,
    pub validator_timeout_ms: u64,
    /// Bound on how far the validator may move a System-1 confidence.
    pub max_validator_adjustment: f32,
    pub lock_ttl_secs: u64,
    /// Max events claimed per run; `None` claims everything pending.
    pub default_batch_limit: Option<usize>,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            acceptance_threshold: 0.7,
            cluster_gap_secs: 300,
            near_identical_similarity: 0.92,
            min_frequency: 3,
            min_sequence_events: 3,
            discovery_tags: ["high-impact", "discovery", "breakthrough", "insight"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            size_saturation: 10,
            recency_half_life_days: 7.0,
            max_in_flight: 4,
            validator_timeout_ms: 5_000,
            max_validator_adjustment: 0.3,
            lock_ttl_secs: 15 * 60,
            default_batch_limit: None,
        }
    }
}

impl DedupConfig {
    pub fn default_window(&self) -> chrono::Duration {
        bounded_secs(self.default_window_secs)
    }
}

impl ConsolidationConfig {
    pub fn cluster_gap(&self) -> chrono::Duration {
        bounded_secs(self.cluster_gap_secs)
    }

    pub fn validator_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.validator_timeout_ms)
    }

    pub fn lock_ttl(&self) -> chrono::Duration {
        bounded_secs(self.lock_ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftConfig {
    /// Overrides the embedding provider's own version tag when set.
    pub active_model_version: Option<String>,
    pub staleness_window_days: i64,
    /// Estimated cost of re-embedding one record (provider units).
    pub refresh_cost_per_item: f64,
    pub refresh_batch_size: usize,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            active_model_version: None,
            staleness_window_days: 30,
            refresh_cost_per_item: 0.0001,
            refresh_batch_size: 32,
        }
    }
}

impl DriftConfig {
    pub fn staleness_window(&self) -> chrono::Duration {
        chrono::Duration::days(self.staleness_window_days.clamp(0, MAX_SPAN_DAYS))
    }
}

fn within_span(name: &str, secs: u64) -> EngineResult<()> {
    if secs == 0 || secs > MAX_SPAN_SECS as u64 {
        Err(EngineError::Config(format!(
            "{name} must be between 1 and {MAX_SPAN_SECS}, got {secs}"
        )))
    } else {
        Ok(())
    }
}

fn unit_interval(name: &str, v: f32) -> EngineResult<()> {
    if v > 0.0 && v <= 1.0 {
        Ok(())
    } else {
        Err(EngineError::Config(format!("{name} must be in (0, 1], got {v}")))
    }
}

impl EngineConfig {
    /// Load from a TOML file. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let config = match std::fs::read_to_string(path) {
            Ok(raw) => Self::from_toml_str(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                return Err(EngineError::Config(format!(
                    "failed to read {}: {e}",
                    path.display()
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> EngineResult<Self> {
        toml::from_str(raw).map_err(|e| EngineError::Config(e.to_string()))
    }

    pub fn to_toml_string(&self) -> EngineResult<String> {
        toml::to_string_pretty(self).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Reject settings no run could honour.
    pub fn validate(&self) -> EngineResult<()> {
        let w = &self.similarity;
        let weights = [w.content, w.temporal, w.event_type, w.resource, w.outcome];
        if weights.iter().any(|x| *x < 0.0 || !x.is_finite()) {
            return Err(EngineError::Config(
                "similarity weights must be finite and non-negative".into(),
            ));
        }
        if w.content <= 0.0 {
            return Err(EngineError::Config(
                "similarity.content must be positive".into(),
            ));
        }

        unit_interval("dedup.default_threshold", self.dedup.default_threshold)?;
        within_span("dedup.default_window_secs", self.dedup.default_window_secs)?;
        if self.dedup.max_merge_attempts == 0 {
            return Err(EngineError::Config("dedup.max_merge_attempts must be >= 1".into()));
        }

        let c = &self.consolidation;
        unit_interval("consolidation.acceptance_threshold", c.acceptance_threshold)?;
        unit_interval(
            "consolidation.near_identical_similarity",
            c.near_identical_similarity,
        )?;
        if c.min_frequency < 2 {
            return Err(EngineError::Config("consolidation.min_frequency must be >= 2".into()));
        }
        if c.min_sequence_events < 2 {
            return Err(EngineError::Config(
                "consolidation.min_sequence_events must be >= 2".into(),
            ));
        }
        if c.size_saturation == 0 || c.max_in_flight == 0 {
            return Err(EngineError::Config(
                "consolidation.size_saturation and max_in_flight must be >= 1".into(),
            ));
        }
        if c.recency_half_life_days <= 0.0 {
            return Err(EngineError::Config(
                "consolidation.recency_half_life_days must be > 0".into(),
            ));
        }
        if c.validator_timeout_ms == 0 {
            return Err(EngineError::Config(
                "consolidation.validator_timeout_ms must be > 0".into(),
            ));
        }
        within_span("consolidation.cluster_gap_secs", c.cluster_gap_secs)?;
        within_span("consolidation.lock_ttl_secs", c.lock_ttl_secs)?;
        if !(0.0..=1.0).contains(&c.max_validator_adjustment) {
            return Err(EngineError::Config(
                "consolidation.max_validator_adjustment must be in [0, 1]".into(),
            ));
        }
        if c.default_batch_limit == Some(0) {
            return Err(EngineError::Config(
                "consolidation.default_batch_limit must be >= 1 when set".into(),
            ));
        }

        let d = &self.drift;
        if !(1..=MAX_SPAN_DAYS).contains(&d.staleness_window_days) {
            return Err(EngineError::Config(format!(
                "drift.staleness_window_days must be between 1 and {MAX_SPAN_DAYS}, got {}",
                d.staleness_window_days
            )));
        }
        if d.refresh_batch_size == 0 {
            return Err(EngineError::Config(
                "drift.refresh_batch_size must be >= 1".into(),
            ));
        }
        if d.refresh_cost_per_item < 0.0 {
            return Err(EngineError::Config(
                "drift.refresh_cost_per_item must be non-negative".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg = EngineConfig::from_toml_str(
            r#"
            [consolidation]
            acceptance_threshold = 0.8

            [dedup]
            allow_cross_session = true
            "#,
        )
        .unwrap();
        assert_eq!(cfg.consolidation.acceptance_threshold, 0.8);
        assert_eq!(cfg.consolidation.min_frequency, 3);
        assert!(cfg.dedup.allow_cross_session);
        assert_eq!(cfg.similarity, SimilarityWeights::default());
    }

    #[test]
    fn out_of_range_threshold_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.consolidation.acceptance_threshold = 1.5;
        assert!(matches!(cfg.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn negative_weight_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.similarity.outcome = -0.1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn spans_past_a_century_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.consolidation.lock_ttl_secs = u64::MAX;
        assert!(matches!(cfg.validate(), Err(EngineError::Config(_))));

        let mut cfg = EngineConfig::default();
        cfg.dedup.default_window_secs = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.drift.staleness_window_days = i64::MAX;
        assert!(cfg.validate().is_err());
        // Accessors never panic even on a config that skipped validation.
        assert_eq!(cfg.drift.staleness_window().num_days(), MAX_SPAN_DAYS);
    }

    #[test]
    fn caller_spans_are_validated() {
        assert_eq!(span_from_secs("w", 600).unwrap(), chrono::Duration::minutes(10));
        assert!(matches!(span_from_secs("w", i64::MAX), Err(EngineError::Validation(_))));
        assert!(matches!(span_from_secs("w", -5), Err(EngineError::Validation(_))));
    }

    #[test]
    fn toml_round_trip() {
        let cfg = EngineConfig::default();
        let text = cfg.to_toml_string().unwrap();
        assert_eq!(EngineConfig::from_toml_str(&text).unwrap(), cfg);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = EngineConfig::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg, EngineConfig::default());
    }
}
