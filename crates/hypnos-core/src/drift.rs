//! Embedding drift: which stored vectors are stale, and re-embedding them.
//!
//! A vector is stale when its model version differs from the active one or
//! when it is older than the staleness window. Refresh writes a new
//! vector/version pair through `replace_embedding`, which archives the old
//! pair, so a reader holding the previous snapshot is never torn.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use hypnos_state::{EmbeddingEntry, EmbeddingOwner, EmbeddingRecord, MemoryBackend};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::config::DriftConfig;
use crate::error::{EngineError, EngineResult};
use crate::metrics::METRICS;
use crate::obs;
use crate::providers::EmbeddingProvider;
use crate::scope::Scope;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub stale_count: usize,
    pub total_count: usize,
    /// Stale share in percent, 0 when nothing is stored.
    pub drift_percentage: f64,
    pub estimated_refresh_cost: f64,
    pub recommendation: String,
    pub active_version: String,
    pub version_mismatch_count: usize,
    /// Current-version records older than the window.
    pub aged_out_count: usize,
}

/// What to refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshTarget {
    Owners(Vec<EmbeddingOwner>),
    AllStale(Scope),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshFailure {
    pub owner: EmbeddingOwner,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshResult {
    pub refreshed_count: usize,
    pub new_version: String,
    pub failed: Vec<RefreshFailure>,
}

pub fn recommendation(drift_percentage: f64) -> &'static str {
    if drift_percentage <= 0.0 {
        "No drift detected; embeddings are current."
    } else if drift_percentage < 10.0 {
        "Low drift: refresh stale embeddings opportunistically."
    } else if drift_percentage < 50.0 {
        "Moderate drift: schedule a refresh of stale embeddings."
    } else {
        "High drift: refresh embeddings before relying on similarity search."
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Staleness {
    Current,
    VersionMismatch,
    AgedOut,
}

fn classify(record: &EmbeddingRecord, active: &str, window: chrono::Duration, now: DateTime<Utc>) -> Staleness {
    if record.model_version != active {
        Staleness::VersionMismatch
    } else if record.age(now) > window {
        Staleness::AgedOut
    } else {
        Staleness::Current
    }
}

pub struct DriftMonitor {
    store: Arc<dyn MemoryBackend>,
    embedder: Arc<dyn EmbeddingProvider>,
    config: DriftConfig,
}

impl DriftMonitor {
    pub fn new(
        store: Arc<dyn MemoryBackend>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: DriftConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            config,
        }
    }

    /// The configured override, or the provider's own tag.
    pub fn active_version(&self) -> String {
        self.config
            .active_model_version
            .clone()
            .unwrap_or_else(|| self.embedder.model_version())
    }

    /// Vector-bearing records in scope. A session scope covers that
    /// session's live events only; memories belong to the namespace.
    async fn entries_in(&self, scope: &Scope) -> EngineResult<Vec<EmbeddingEntry>> {
        let entries = self
            .store
            .list_embeddings(&scope.namespace)
            .await
            .map_err(EngineError::from_storage)?;
        let Some(session) = scope.session_id.as_deref() else {
            return Ok(entries);
        };
        let in_session: HashSet<String> = self
            .store
            .list_live_events(&scope.namespace, Some(session))
            .await
            .map_err(EngineError::from_storage)?
            .into_iter()
            .map(|e| e.id.0)
            .collect();
        Ok(entries
            .into_iter()
            .filter(|entry| match &entry.owner {
                EmbeddingOwner::Event(id) => in_session.contains(id.as_str()),
                EmbeddingOwner::Memory(_) => false,
            })
            .collect())
    }

    #[instrument(skip(self), fields(scope = %scope))]
    pub async fn detect_drift(&self, scope: &Scope) -> EngineResult<DriftReport> {
        scope.validate()?;
        let active = self.active_version();
        let window = self.config.staleness_window();
        let now = Utc::now();

        let entries = self.entries_in(scope).await?;
        let mut mismatched = 0;
        let mut aged = 0;
        for entry in &entries {
            match classify(&entry.embedding, &active, window, now) {
                Staleness::VersionMismatch => mismatched += 1,
                Staleness::AgedOut => aged += 1,
                Staleness::Current => {}
            }
        }

        let total = entries.len();
        let stale = mismatched + aged;
        let pct = if total == 0 {
            0.0
        } else {
            stale as f64 * 100.0 / total as f64
        };
        obs::emit_drift_detected(&scope.to_string(), stale, total, &active);

        Ok(DriftReport {
            stale_count: stale,
            total_count: total,
            drift_percentage: pct,
            estimated_refresh_cost: stale as f64 * self.config.refresh_cost_per_item,
            recommendation: recommendation(pct).to_string(),
            active_version: active,
            version_mismatch_count: mismatched,
            aged_out_count: aged,
        })
    }

    async fn stale_owners(&self, scope: &Scope) -> EngineResult<Vec<EmbeddingOwner>> {
        scope.validate()?;
        let active = self.active_version();
        let window = self.config.staleness_window();
        let now = Utc::now();
        Ok(self
            .entries_in(scope)
            .await?
            .into_iter()
            .filter(|e| classify(&e.embedding, &active, window, now) != Staleness::Current)
            .map(|e| e.owner)
            .collect())
    }

    /// Re-embed `target` in batches. Per-record failures are collected in
    /// the result; only a failure to enumerate the target is an error.
    #[instrument(skip(self, target))]
    pub async fn refresh_embeddings(&self, target: &RefreshTarget) -> EngineResult<RefreshResult> {
        let owners = match target {
            RefreshTarget::Owners(owners) => {
                let mut owners = owners.clone();
                owners.sort();
                owners.dedup();
                owners
            }
            RefreshTarget::AllStale(scope) => self.stale_owners(scope).await?,
        };

        let mut result = RefreshResult {
            refreshed_count: 0,
            new_version: self.embedder.model_version(),
            failed: Vec::new(),
        };

        for batch in owners.chunks(self.config.refresh_batch_size.max(1)) {
            let entries = match self.store.get_embeddings(batch).await {
                Ok(entries) => entries,
                // One missing owner fails the batch read; fall back to
                // fetching one by one so the rest still refresh.
                Err(_) => {
                    let mut found = Vec::with_capacity(batch.len());
                    for owner in batch {
                        match self.store.get_embeddings(std::slice::from_ref(owner)).await {
                            Ok(mut one) => found.append(&mut one),
                            Err(e) => result.failed.push(RefreshFailure {
                                owner: owner.clone(),
                                reason: e.to_string(),
                            }),
                        }
                    }
                    found
                }
            };

            for entry in entries {
                match self.embedder.embed(&entry.content).await {
                    Ok(embedding) => {
                        let version = embedding.model_version.clone();
                        let record = EmbeddingRecord::new(embedding.vector, embedding.model_version);
                        match self.store.replace_embedding(&entry.owner, record).await {
                            Ok(_) => {
                                result.refreshed_count += 1;
                                result.new_version = version;
                            }
                            Err(e) => result.failed.push(RefreshFailure {
                                owner: entry.owner,
                                reason: e.to_string(),
                            }),
                        }
                    }
                    Err(e) => {
                        warn!(owner = %entry.owner, error = %e, "re-embedding failed");
                        result.failed.push(RefreshFailure {
                            owner: entry.owner,
                            reason: e.to_string(),
                        });
                    }
                }
            }
            debug!(batch = batch.len(), refreshed = result.refreshed_count, "refresh batch done");
        }

        METRICS.add_embeddings_refreshed(result.refreshed_count as u64);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn recommendation_bands() {
        assert!(recommendation(0.0).starts_with("No drift"));
        assert!(recommendation(5.0).starts_with("Low"));
        assert!(recommendation(10.0).starts_with("Moderate"));
        assert!(recommendation(49.9).starts_with("Moderate"));
        assert!(recommendation(50.0).starts_with("High"));
    }

    #[test]
    fn version_mismatch_is_stale_regardless_of_age() {
        let now = Utc::now();
        let fresh_v1 = EmbeddingRecord::new(vec![1.0], "v1").created_at(now);
        assert_eq!(
            classify(&fresh_v1, "v2", Duration::days(30), now),
            Staleness::VersionMismatch
        );
        let fresh_v2 = EmbeddingRecord::new(vec![1.0], "v2").created_at(now - Duration::days(29));
        assert_eq!(classify(&fresh_v2, "v2", Duration::days(30), now), Staleness::Current);
        let old_v2 = EmbeddingRecord::new(vec![1.0], "v2").created_at(now - Duration::days(31));
        assert_eq!(classify(&old_v2, "v2", Duration::days(30), now), Staleness::AgedOut);
    }
}
