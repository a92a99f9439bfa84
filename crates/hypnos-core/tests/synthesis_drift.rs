//! Synthesis create-or-skip behaviour and embedding drift refresh.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use hypnos_core::{
    DriftConfig, Embedding, EmbeddingProvider, EngineConfig, HashingEmbedder, HypnosEngine,
    MemorySynthesizer, Pattern, PatternType, ProviderError, RefreshTarget, Scope,
    SynthesisOutcome, ValidationStrategy,
};
use hypnos_state::fakes::InMemoryStore;
use hypnos_state::{
    EmbeddingOwner, EmbeddingRecord, EmbeddingStore, EpisodicEvent, EventId, EventStore,
    KnowledgeStore, PatternId,
};

struct DownEmbedder;

#[async_trait]
impl EmbeddingProvider for DownEmbedder {
    async fn embed(&self, _text: &str) -> Result<Embedding, ProviderError> {
        Err(ProviderError::Unavailable("connection refused".into()))
    }

    fn model_version(&self) -> String {
        "down-v0".into()
    }
}

fn pattern(id: &str, pattern_type: PatternType, content: &str, steps: &[&str]) -> Pattern {
    Pattern {
        id: PatternId::from(id),
        pattern_type,
        event_type: "tool_call".into(),
        source_event_ids: vec![EventId::from("e1"), EventId::from("e2")],
        confidence: 0.9,
        content: content.into(),
        steps: steps.iter().map(|s| s.to_string()).collect(),
        validated: false,
        created_at: Utc::now(),
    }
}

fn synthesizer(store: &Arc<InMemoryStore>) -> MemorySynthesizer {
    MemorySynthesizer::new(store.clone(), Arc::new(HashingEmbedder::default()), 0.7)
}

// ---------------------------------------------------------------------------
// Synthesis
// ---------------------------------------------------------------------------

#[tokio::test]
async fn equal_content_reuses_one_memory() {
    let store = Arc::new(InMemoryStore::new());
    let synth = synthesizer(&store);

    let first = synth
        .create_semantic_memory("agent", &pattern("p1", PatternType::Frequency, "Run  cargo fmt", &[]))
        .await;
    let second = synth
        .create_semantic_memory("agent", &pattern("p2", PatternType::Frequency, "run cargo FMT ", &[]))
        .await;

    let SynthesisOutcome::Created(id) = first else {
        panic!("expected a new memory, got {first:?}");
    };
    assert_eq!(second, SynthesisOutcome::Skipped(id.clone()));

    let memory = store.get_memory(&id).await.unwrap();
    assert_eq!(
        memory.source_pattern_ids,
        vec![PatternId::from("p1"), PatternId::from("p2")]
    );
    assert!((0.8..=0.9).contains(&memory.usefulness_score));
    assert_eq!(store.list_memories("agent").await.unwrap().len(), 1);
}

#[tokio::test]
async fn equal_content_in_another_namespace_gets_its_own_records() {
    let store = Arc::new(InMemoryStore::new());
    let synth = synthesizer(&store);
    let steps = ["git pull", "cargo test"];

    let a = synth
        .create_semantic_memory("tenant-a", &pattern("p1", PatternType::Frequency, "run cargo fmt", &[]))
        .await;
    let b = synth
        .create_semantic_memory("tenant-b", &pattern("p2", PatternType::Frequency, "run cargo fmt", &[]))
        .await;
    assert!(matches!(a, SynthesisOutcome::Created(_)));
    assert!(matches!(b, SynthesisOutcome::Created(_)));
    assert_ne!(a.id(), b.id());

    let pa = synth
        .create_procedure("tenant-a", &pattern("p1", PatternType::Temporal, "seq", &steps))
        .await
        .unwrap();
    let pb = synth
        .create_procedure("tenant-b", &pattern("p2", PatternType::Temporal, "seq", &steps))
        .await
        .unwrap();
    assert!(matches!(pa, SynthesisOutcome::Created(_)));
    assert!(matches!(pb, SynthesisOutcome::Created(_)));

    let b_memories = store.list_memories("tenant-b").await.unwrap();
    assert_eq!(b_memories.len(), 1);
    assert_eq!(b_memories[0].source_pattern_ids, vec![PatternId::from("p2")]);
    assert_eq!(store.list_procedures("tenant-b").await.unwrap().len(), 1);
}

#[tokio::test]
async fn procedures_dedupe_on_normalised_steps() {
    let store = Arc::new(InMemoryStore::new());
    let synth = synthesizer(&store);
    let steps = ["git pull", "cargo build", "cargo test"];

    let created = synth
        .create_procedure("agent", &pattern("p1", PatternType::Temporal, "seq", &steps))
        .await
        .unwrap();
    let SynthesisOutcome::Created(id) = created else {
        panic!("expected a new procedure, got {created:?}");
    };
    let procedure = store.get_procedure(&id).await.unwrap();
    assert_eq!(procedure.ordered_steps, steps.to_vec());
    assert_eq!(procedure.name, "tool_call: git pull -> cargo test");

    let shouting = ["GIT PULL", "cargo  build", "cargo test"];
    let again = synth
        .create_procedure("agent", &pattern("p2", PatternType::Frequency, "freq", &shouting))
        .await
        .unwrap();
    assert_eq!(again, SynthesisOutcome::Skipped(id));

    // Order matters.
    let reversed = ["cargo test", "cargo build", "git pull"];
    let other = synth
        .create_procedure("agent", &pattern("p3", PatternType::Temporal, "rev", &reversed))
        .await
        .unwrap();
    assert!(matches!(other, SynthesisOutcome::Created(_)));
}

#[tokio::test]
async fn discoveries_and_single_steps_make_no_procedure() {
    let store = Arc::new(InMemoryStore::new());
    let synth = synthesizer(&store);

    let discovery = pattern("p1", PatternType::Discovery, "found it", &["a", "b"]);
    assert!(synth.create_procedure("agent", &discovery).await.is_none());

    let single = pattern("p2", PatternType::Frequency, "again", &["a", "A"]);
    assert!(synth.create_procedure("agent", &single).await.is_none());
    assert!(store.list_procedures("agent").await.unwrap().is_empty());
}

#[tokio::test]
async fn embedder_outage_writes_nothing() {
    let store = Arc::new(InMemoryStore::new());
    let synth = MemorySynthesizer::new(store.clone(), Arc::new(DownEmbedder), 0.7);

    let outcome = synth
        .create_semantic_memory("agent", &pattern("p1", PatternType::Frequency, "note", &[]))
        .await;
    assert!(outcome.is_failed());
    assert!(store.list_memories("agent").await.unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Drift
// ---------------------------------------------------------------------------

fn engine_with_version(store: &Arc<InMemoryStore>, version: &str, drift: DriftConfig) -> HypnosEngine {
    let config = EngineConfig {
        drift,
        ..EngineConfig::default()
    };
    HypnosEngine::new(
        store.clone(),
        Arc::new(HashingEmbedder::default().with_version(version)),
        ValidationStrategy::HeuristicOnly,
        config,
    )
    .unwrap()
}

async fn seed(store: &InMemoryStore, id: &str, session: &str, record: EmbeddingRecord) {
    let e = EpisodicEvent::new("agent", session, "note", format!("content of {id}"), record)
        .with_id(id);
    store.insert_event(e).await.unwrap();
}

#[tokio::test]
async fn version_change_marks_everything_stale() {
    let store = Arc::new(InMemoryStore::new());
    for i in 0..4 {
        seed(&store, &format!("e{i}"), "s1", EmbeddingRecord::new(vec![1.0], "v1")).await;
    }
    let engine = engine_with_version(&store, "v2", DriftConfig::default());

    let report = engine
        .detect_embedding_drift(&Scope::namespace("agent"))
        .await
        .unwrap();
    assert_eq!(report.total_count, 4);
    assert_eq!(report.stale_count, 4);
    assert_eq!(report.version_mismatch_count, 4);
    assert_eq!(report.active_version, "v2");
    assert!((report.drift_percentage - 100.0).abs() < 1e-9);
    assert!(report.recommendation.starts_with("High"));
}

#[tokio::test]
async fn age_counts_only_past_the_window() {
    let store = Arc::new(InMemoryStore::new());
    let now = Utc::now();
    seed(&store, "young", "s1", EmbeddingRecord::new(vec![1.0], "v2").created_at(now - Duration::days(3))).await;
    seed(&store, "old", "s1", EmbeddingRecord::new(vec![1.0], "v2").created_at(now - Duration::days(45))).await;
    let drift = DriftConfig {
        staleness_window_days: 30,
        ..DriftConfig::default()
    };
    let engine = engine_with_version(&store, "v2", drift);

    let report = engine
        .detect_embedding_drift(&Scope::namespace("agent"))
        .await
        .unwrap();
    assert_eq!(report.stale_count, 1);
    assert_eq!(report.aged_out_count, 1);
    assert_eq!(report.version_mismatch_count, 0);
    assert!((report.drift_percentage - 50.0).abs() < 1e-9);
    assert!(report.estimated_refresh_cost > 0.0);
}

#[tokio::test]
async fn session_scope_only_counts_that_session() {
    let store = Arc::new(InMemoryStore::new());
    seed(&store, "a", "s1", EmbeddingRecord::new(vec![1.0], "v1")).await;
    seed(&store, "b", "s2", EmbeddingRecord::new(vec![1.0], "v1")).await;
    let engine = engine_with_version(&store, "v2", DriftConfig::default());

    let report = engine
        .detect_embedding_drift(&Scope::session("agent", "s1"))
        .await
        .unwrap();
    assert_eq!(report.total_count, 1);
    assert_eq!(report.stale_count, 1);
}

#[tokio::test]
async fn refresh_all_stale_clears_drift_and_keeps_history() {
    let store = Arc::new(InMemoryStore::new());
    for i in 0..5 {
        seed(&store, &format!("e{i}"), "s1", EmbeddingRecord::new(vec![1.0, 0.0], "v1")).await;
    }
    let drift = DriftConfig {
        refresh_batch_size: 2,
        ..DriftConfig::default()
    };
    let engine = engine_with_version(&store, "v2", drift);
    let scope = Scope::namespace("agent");

    let result = engine
        .refresh_embeddings(&RefreshTarget::AllStale(scope.clone()))
        .await
        .unwrap();
    assert_eq!(result.refreshed_count, 5);
    assert_eq!(result.new_version, "v2");
    assert!(result.failed.is_empty());

    let report = engine.detect_embedding_drift(&scope).await.unwrap();
    assert_eq!(report.stale_count, 0);
    assert!(report.recommendation.starts_with("No drift"));

    let owner = EmbeddingOwner::Event(EventId::from("e0"));
    let history = store.embedding_history(&owner).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].model_version, "v1");
    let event = store.get_event(&EventId::from("e0")).await.unwrap();
    assert_eq!(event.embedding.model_version, "v2");
}

#[tokio::test]
async fn refresh_reports_missing_owners_and_continues() {
    let store = Arc::new(InMemoryStore::new());
    seed(&store, "e1", "s1", EmbeddingRecord::new(vec![1.0], "v1")).await;
    seed(&store, "e2", "s1", EmbeddingRecord::new(vec![1.0], "v1")).await;
    let engine = engine_with_version(&store, "v2", DriftConfig::default());

    let target = RefreshTarget::Owners(vec![
        EmbeddingOwner::Event(EventId::from("e1")),
        EmbeddingOwner::Event(EventId::from("ghost")),
        EmbeddingOwner::Event(EventId::from("e2")),
    ]);
    let result = engine.refresh_embeddings(&target).await.unwrap();

    assert_eq!(result.refreshed_count, 2);
    assert_eq!(result.failed.len(), 1);
    assert_eq!(result.failed[0].owner, EmbeddingOwner::Event(EventId::from("ghost")));
}
