//! The named operation table, driven with JSON arguments.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use hypnos_core::dispatch::FindDuplicateEvents;
use hypnos_core::{
    EngineConfig, EngineError, EngineResult, HashingEmbedder, HypnosEngine, Operation,
    OperationTable, OperationTableBuilder, ValidationStrategy,
};
use hypnos_state::fakes::InMemoryStore;
use hypnos_state::{EmbeddingRecord, EpisodicEvent, EventStore};
use serde_json::{json, Value};

fn engine(store: &Arc<InMemoryStore>) -> Arc<HypnosEngine> {
    Arc::new(
        HypnosEngine::new(
            store.clone(),
            Arc::new(HashingEmbedder::default()),
            ValidationStrategy::HeuristicOnly,
            EngineConfig::default(),
        )
        .unwrap(),
    )
}

async fn seed_duplicates(store: &InMemoryStore) {
    let base = Utc::now() - Duration::minutes(20);
    for (id, minutes) in [("d1", 0), ("d2", 1), ("d3", 2)] {
        let e = EpisodicEvent::new(
            "agent",
            "s1",
            "tool_call",
            "ran the formatter",
            EmbeddingRecord::new(vec![1.0, 0.0], "hashing-v1-256"),
        )
        .with_id(id)
        .with_tags([id])
        .at(base + Duration::minutes(minutes));
        store.insert_event(e).await.unwrap();
    }
}

#[tokio::test]
async fn standard_table_lists_every_operation() {
    let store = Arc::new(InMemoryStore::new());
    let table = OperationTable::standard(engine(&store)).unwrap();
    assert_eq!(
        table.names(),
        vec![
            "detect_embedding_drift",
            "find_duplicate_events",
            "merge_duplicate_events",
            "refresh_embeddings",
            "run_consolidation",
        ]
    );
}

#[tokio::test]
async fn registering_a_name_twice_fails() {
    let store = Arc::new(InMemoryStore::new());
    let err = OperationTableBuilder::new()
        .with_standard_operations()
        .register(Arc::new(FindDuplicateEvents))
        .build(engine(&store))
        .err()
        .unwrap();
    assert!(matches!(err, EngineError::DuplicateOperation { ref name } if name == "find_duplicate_events"));
}

struct Ping;

#[async_trait]
impl Operation for Ping {
    fn name(&self) -> &'static str {
        "ping"
    }

    async fn call(&self, _engine: &HypnosEngine, args: Value) -> EngineResult<Value> {
        Ok(json!({ "pong": args }))
    }
}

#[tokio::test]
async fn custom_operations_sit_beside_the_standard_ones() {
    let store = Arc::new(InMemoryStore::new());
    let table = OperationTableBuilder::new()
        .with_standard_operations()
        .register(Arc::new(Ping))
        .build(engine(&store))
        .unwrap();

    assert_eq!(table.names().len(), 6);
    let out = table.call("ping", json!(1)).await.unwrap();
    assert_eq!(out, json!({ "pong": 1 }));
}

#[tokio::test]
async fn unknown_operation_is_not_found() {
    let store = Arc::new(InMemoryStore::new());
    let table = OperationTable::standard(engine(&store)).unwrap();
    let err = table.call("compact_everything", json!({})).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound { ref kind, .. } if kind == "operation"));
}

#[tokio::test]
async fn malformed_arguments_are_validation_errors() {
    let store = Arc::new(InMemoryStore::new());
    let table = OperationTable::standard(engine(&store)).unwrap();
    let err = table
        .call("find_duplicate_events", json!({ "threshold": 0.9 }))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn find_then_merge_through_json() {
    let store = Arc::new(InMemoryStore::new());
    seed_duplicates(&store).await;
    let table = OperationTable::standard(engine(&store)).unwrap();

    let groups = table
        .call(
            "find_duplicate_events",
            json!({ "namespace": "agent", "threshold": 0.9, "window_secs": 600 }),
        )
        .await
        .unwrap();
    let groups = groups.as_array().unwrap();
    assert_eq!(groups.len(), 1);
    let ids = groups[0]["event_ids"].clone();
    assert_eq!(ids, json!(["d1", "d2", "d3"]));

    let merged = table
        .call(
            "merge_duplicate_events",
            json!({ "group_ids": ids, "keep_policy": { "policy": "latest" } }),
        )
        .await
        .unwrap();
    assert_eq!(merged["canonical_id"], json!("d3"));
    assert_eq!(merged["merged_count"], json!(2));
    assert_eq!(merged["tags"], json!(["d1", "d2", "d3"]));
}

#[tokio::test]
async fn consolidation_and_drift_through_json() {
    let store = Arc::new(InMemoryStore::new());
    seed_duplicates(&store).await;
    let table = OperationTable::standard(engine(&store)).unwrap();

    let report = table
        .call(
            "run_consolidation",
            json!({ "namespace": "agent", "session_id": "s1", "skip_validation": true }),
        )
        .await
        .unwrap();
    assert_eq!(report["events_processed"], json!(3));
    assert_eq!(report["outcome"], json!("completed"));

    let drift = table
        .call("detect_embedding_drift", json!({ "namespace": "agent" }))
        .await
        .unwrap();
    // Three events plus the memory synthesised from them, all current.
    assert_eq!(drift["total_count"], json!(4));
    assert_eq!(drift["stale_count"], json!(0));

    let refreshed = table
        .call("refresh_embeddings", json!({ "all_stale": { "namespace": "agent" } }))
        .await
        .unwrap();
    assert_eq!(refreshed["refreshed_count"], json!(0));
}

#[tokio::test]
async fn unrepresentable_windows_are_validation_errors() {
    let store = Arc::new(InMemoryStore::new());
    seed_duplicates(&store).await;
    let table = OperationTable::standard(engine(&store)).unwrap();

    for window_secs in [i64::MAX, i64::MIN, 0, -60] {
        let err = table
            .call(
                "find_duplicate_events",
                json!({ "namespace": "agent", "window_secs": window_secs }),
            )
            .await
            .unwrap_err();
        assert!(
            matches!(err, EngineError::Validation(_)),
            "window_secs {window_secs} gave {err:?}"
        );
    }

    // The table still serves requests afterwards.
    let groups = table
        .call("find_duplicate_events", json!({ "namespace": "agent", "window_secs": 600 }))
        .await
        .unwrap();
    assert_eq!(groups.as_array().unwrap().len(), 1);
}
