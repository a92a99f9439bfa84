//! The engine facade: one handle over deduplication, consolidation and
//! drift, sharing a backend, providers and configuration.

use std::sync::Arc;

use chrono::Duration;
use hypnos_state::{EmbeddingRecord, EpisodicEvent, EventId, MemoryBackend};
use tokio::sync::watch;
use tracing::instrument;

use crate::config::EngineConfig;
use crate::dedup::{DedupManager, DuplicateGroup, KeepPolicy, MergeResult};
use crate::drift::{DriftMonitor, DriftReport, RefreshResult, RefreshTarget};
use crate::error::{EngineError, EngineResult};
use crate::orchestrator::{ConsolidationReport, ConsolidationStrategy, Orchestrator};
use crate::pattern::ValidationStrategy;
use crate::providers::{EmbeddingProvider, ProviderError};
use crate::scope::Scope;

/// Fields of an event to record; the engine computes the embedding.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct NewEvent {
    #[serde(default)]
    pub id: Option<String>,
    pub namespace: String,
    pub session_id: String,
    pub event_type: String,
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub importance_score: Option<f32>,
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub outcome: Option<String>,
}

pub struct HypnosEngine {
    store: Arc<dyn MemoryBackend>,
    embedder: Arc<dyn EmbeddingProvider>,
    config: EngineConfig,
    dedup: DedupManager,
    orchestrator: Orchestrator,
    drift: DriftMonitor,
}

impl HypnosEngine {
    /// Build an engine. Fails on a configuration no run could honour.
    pub fn new(
        store: Arc<dyn MemoryBackend>,
        embedder: Arc<dyn EmbeddingProvider>,
        validation: ValidationStrategy,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        config.validate()?;
        let dedup = DedupManager::new(
            Arc::clone(&store),
            config.similarity.clone(),
            config.dedup.clone(),
        );
        let orchestrator = Orchestrator::new(
            Arc::clone(&store),
            Arc::clone(&embedder),
            validation,
            config.consolidation.clone(),
        );
        let drift = DriftMonitor::new(Arc::clone(&store), Arc::clone(&embedder), config.drift.clone());
        Ok(Self {
            store,
            embedder,
            config,
            dedup,
            orchestrator,
            drift,
        })
    }

    /// Embed and store a raw event.
    #[instrument(skip(self, event), fields(namespace = %event.namespace, event_type = %event.event_type))]
    pub async fn record_event(&self, event: NewEvent) -> EngineResult<EventId> {
        if event.namespace.trim().is_empty() || event.session_id.trim().is_empty() {
            return Err(EngineError::validation("event namespace and session_id are required"));
        }
        if event.event_type.trim().is_empty() {
            return Err(EngineError::validation("event_type is required"));
        }
        let embedding = self.embedder.embed(&event.content).await.map_err(|e| match e {
            ProviderError::Unavailable(detail) | ProviderError::Failed(detail) => {
                EngineError::ResourceUnavailable {
                    resource: "embedding provider".into(),
                    detail,
                }
            }
        })?;

        let mut record = EpisodicEvent::new(
            event.namespace,
            event.session_id,
            event.event_type,
            event.content,
            EmbeddingRecord::new(embedding.vector, embedding.model_version),
        )
        .with_tags(event.tags);
        if let Some(id) = event.id {
            record = record.with_id(id);
        }
        if let Some(at) = event.timestamp {
            record = record.at(at);
        }
        if let Some(importance) = event.importance_score {
            record = record.with_importance(importance);
        }
        if let Some(resource) = event.resource {
            record = record.with_resource(resource);
        }
        if let Some(outcome) = event.outcome {
            record = record.with_outcome(outcome);
        }

        self.store
            .insert_event(record)
            .await
            .map_err(EngineError::from_storage)
    }

    /// Threshold and window fall back to the configured defaults.
    pub async fn find_duplicate_events(
        &self,
        scope: &Scope,
        threshold: Option<f32>,
        window: Option<Duration>,
    ) -> EngineResult<Vec<DuplicateGroup>> {
        let threshold = threshold.unwrap_or(self.config.dedup.default_threshold);
        let window = window.unwrap_or_else(|| self.config.dedup.default_window());
        self.dedup.find_duplicates(scope, threshold, window).await
    }

    pub async fn merge_duplicate_events(
        &self,
        group_ids: &[EventId],
        keep_policy: &KeepPolicy,
    ) -> EngineResult<MergeResult> {
        self.dedup.merge(group_ids, keep_policy).await
    }

    pub async fn run_consolidation(
        &self,
        scope: &Scope,
        strategy: &ConsolidationStrategy,
    ) -> EngineResult<ConsolidationReport> {
        self.orchestrator.run_consolidation(scope, strategy).await
    }

    pub async fn run_consolidation_with_cancel(
        &self,
        scope: &Scope,
        strategy: &ConsolidationStrategy,
        cancel: watch::Receiver<bool>,
    ) -> EngineResult<ConsolidationReport> {
        self.orchestrator
            .run_consolidation_with_cancel(scope, strategy, cancel)
            .await
    }

    pub async fn detect_embedding_drift(&self, scope: &Scope) -> EngineResult<DriftReport> {
        self.drift.detect_drift(scope).await
    }

    pub async fn refresh_embeddings(&self, target: &RefreshTarget) -> EngineResult<RefreshResult> {
        self.drift.refresh_embeddings(target).await
    }
}
