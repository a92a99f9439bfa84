//! Memory synthesis: accepted patterns become durable semantic memories and
//! procedures.
//!
//! Both create paths are create-or-skip on a content digest, and both
//! report what actually happened through [`SynthesisOutcome`]. A record is
//! written together with its first pattern link in one insert, so a record
//! without its links is never visible.

use std::sync::Arc;

use chrono::Utc;
use hypnos_state::{
    ContentDigest, EmbeddingRecord, InsertOutcome, MemoryBackend, MemoryId, Procedure,
    ProcedureId, SemanticMemory,
};
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::metrics::METRICS;
use crate::pattern::{Pattern, PatternType};
use crate::providers::EmbeddingProvider;

const NAME_STEP_CHARS: usize = 40;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum SynthesisOutcome<Id> {
    Created(Id),
    /// A record with the same digest already existed; the pattern was linked
    /// to it.
    Skipped(Id),
    Failed(String),
}

impl<Id> SynthesisOutcome<Id> {
    pub fn id(&self) -> Option<&Id> {
        match self {
            SynthesisOutcome::Created(id) | SynthesisOutcome::Skipped(id) => Some(id),
            SynthesisOutcome::Failed(_) => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, SynthesisOutcome::Failed(_))
    }
}

/// Trim, lowercase and collapse internal whitespace.
pub fn normalize_content(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn content_hash(text: &str) -> ContentDigest {
    ContentDigest::from_bytes(normalize_content(text).as_bytes())
}

/// Digest over the normalised steps in order. Each step is length-prefixed,
/// so no step text can forge a boundary.
pub fn step_signature(steps: &[String]) -> ContentDigest {
    let mut input = String::new();
    for step in steps {
        let step = normalize_content(step);
        input.push_str(&step.len().to_string());
        input.push(':');
        input.push_str(&step);
    }
    ContentDigest::from_bytes(input.as_bytes())
}

/// Initial usefulness of a memory. Direct accepts land in [0.8, 0.9] scaled
/// by how far they cleared the threshold; validated accepts stay below 0.8.
pub fn usefulness(confidence: f32, threshold: f32, validated: bool) -> f32 {
    let c = confidence.clamp(0.0, 1.0);
    if validated {
        return (0.5 + 0.3 * c).min(0.79);
    }
    if threshold >= 1.0 {
        return 0.9;
    }
    (0.8 + 0.1 * (c - threshold) / (1.0 - threshold)).clamp(0.8, 0.9)
}

/// Steps for a procedure, or `None` when the pattern cannot yield one.
pub fn procedure_steps(pattern: &Pattern) -> Option<Vec<String>> {
    if pattern.pattern_type == PatternType::Discovery {
        return None;
    }
    let mut steps: Vec<String> = Vec::new();
    for step in &pattern.steps {
        let norm = normalize_content(step);
        if norm.is_empty() {
            continue;
        }
        if steps.last().map(|s| normalize_content(s)) == Some(norm) {
            continue;
        }
        steps.push(step.trim().to_string());
    }
    (steps.len() >= 2).then_some(steps)
}

fn procedure_name(event_type: &str, steps: &[String]) -> String {
    let clip = |s: &str| -> String {
        if s.chars().count() > NAME_STEP_CHARS {
            let head: String = s.chars().take(NAME_STEP_CHARS).collect();
            format!("{head}...")
        } else {
            s.to_string()
        }
    };
    match (steps.first(), steps.last()) {
        (Some(first), Some(last)) => format!("{event_type}: {} -> {}", clip(first), clip(last)),
        _ => event_type.to_string(),
    }
}

pub struct MemorySynthesizer {
    store: Arc<dyn MemoryBackend>,
    embedder: Arc<dyn EmbeddingProvider>,
    acceptance_threshold: f32,
}

impl MemorySynthesizer {
    pub fn new(
        store: Arc<dyn MemoryBackend>,
        embedder: Arc<dyn EmbeddingProvider>,
        acceptance_threshold: f32,
    ) -> Self {
        Self {
            store,
            embedder,
            acceptance_threshold,
        }
    }

    #[instrument(skip(self, pattern), fields(pattern_id = %pattern.id))]
    pub async fn create_semantic_memory(
        &self,
        namespace: &str,
        pattern: &Pattern,
    ) -> SynthesisOutcome<MemoryId> {
        let hash = content_hash(&pattern.content);

        match self.store.find_memory_by_hash(namespace, &hash).await {
            Ok(Some(existing)) => return self.link_existing_memory(existing.id, pattern).await,
            Ok(None) => {}
            Err(e) => return SynthesisOutcome::Failed(format!("memory lookup failed: {e}")),
        }

        let embedding = match self.embedder.embed(&pattern.content).await {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "embedding provider failed during synthesis");
                return SynthesisOutcome::Failed(format!("embedding failed: {e}"));
            }
        };

        let memory = SemanticMemory {
            id: MemoryId::new(),
            namespace: namespace.to_string(),
            content: pattern.content.clone(),
            content_hash: hash,
            embedding: EmbeddingRecord::new(embedding.vector, embedding.model_version),
            usefulness_score: usefulness(
                pattern.confidence,
                self.acceptance_threshold,
                pattern.validated,
            ),
            source_pattern_ids: vec![pattern.id.clone()],
            created_at: Utc::now(),
        };

        match self.store.insert_semantic_memory(memory).await {
            Ok(InsertOutcome::Inserted(id)) => {
                METRICS.inc_memories_created();
                debug!(memory_id = %id, "semantic memory created");
                SynthesisOutcome::Created(id)
            }
            // Lost a race against a concurrent writer of the same content.
            Ok(InsertOutcome::Existing(id)) => self.link_existing_memory(id, pattern).await,
            Err(e) => SynthesisOutcome::Failed(format!("memory insert failed: {e}")),
        }
    }

    async fn link_existing_memory(
        &self,
        id: MemoryId,
        pattern: &Pattern,
    ) -> SynthesisOutcome<MemoryId> {
        match self.store.link_memory_pattern(&id, &pattern.id).await {
            Ok(()) => {
                debug!(memory_id = %id, "semantic memory already present, linked");
                SynthesisOutcome::Skipped(id)
            }
            Err(e) => SynthesisOutcome::Failed(format!("memory link failed: {e}")),
        }
    }

    /// `None` when the pattern has no orderable sequence of at least two
    /// steps.
    #[instrument(skip(self, pattern), fields(pattern_id = %pattern.id))]
    pub async fn create_procedure(
        &self,
        namespace: &str,
        pattern: &Pattern,
    ) -> Option<SynthesisOutcome<ProcedureId>> {
        let steps = procedure_steps(pattern)?;
        let signature = step_signature(&steps);

        let outcome = match self
            .store
            .find_procedure_by_signature(namespace, &signature)
            .await
        {
            Ok(Some(existing)) => self.link_existing_procedure(existing.id, pattern).await,
            Ok(None) => {
                let procedure = Procedure {
                    id: ProcedureId::new(),
                    namespace: namespace.to_string(),
                    name: procedure_name(&pattern.event_type, &steps),
                    ordered_steps: steps,
                    step_signature_hash: signature,
                    source_pattern_ids: vec![pattern.id.clone()],
                    effectiveness_score: pattern.confidence.clamp(0.0, 1.0),
                    created_at: Utc::now(),
                };
                match self.store.insert_procedure(procedure).await {
                    Ok(InsertOutcome::Inserted(id)) => SynthesisOutcome::Created(id),
                    Ok(InsertOutcome::Existing(id)) => {
                        self.link_existing_procedure(id, pattern).await
                    }
                    Err(e) => SynthesisOutcome::Failed(format!("procedure insert failed: {e}")),
                }
            }
            Err(e) => SynthesisOutcome::Failed(format!("procedure lookup failed: {e}")),
        };
        Some(outcome)
    }

    async fn link_existing_procedure(
        &self,
        id: ProcedureId,
        pattern: &Pattern,
    ) -> SynthesisOutcome<ProcedureId> {
        match self.store.link_procedure_pattern(&id, &pattern.id).await {
            Ok(()) => SynthesisOutcome::Skipped(id),
            Err(e) => SynthesisOutcome::Failed(format!("procedure link failed: {e}")),
        }
    }
}
