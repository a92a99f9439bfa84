//! Trait contract tests for EventStore, KnowledgeStore, EmbeddingStore,
//! ConsolidationLocks and ReferenceIndex.
//!
//! Every contract runs against both the in-memory fake and the SurrealDB
//! backend (`mem://`). Any conforming implementation must pass these.

use chrono::{Duration, Utc};
use hypnos_state::fakes::InMemoryStore;
use hypnos_state::storage_traits::*;
use hypnos_state::{StorageError, SurrealStore};

fn event(id: &str, session: &str, content: &str, offset_secs: i64) -> EpisodicEvent {
    EpisodicEvent::new(
        "ns",
        session,
        "tool_call",
        content,
        EmbeddingRecord::new(vec![1.0, 0.0, 0.0], "embed-v1"),
    )
    .with_id(id)
    .at(Utc::now() - Duration::seconds(600) + Duration::seconds(offset_secs))
}

fn memory(content: &str) -> SemanticMemory {
    SemanticMemory {
        id: MemoryId::new(),
        namespace: "ns".into(),
        content: content.into(),
        content_hash: ContentDigest::from_bytes(content.as_bytes()),
        embedding: EmbeddingRecord::new(vec![0.5, 0.5], "embed-v1"),
        usefulness_score: 0.8,
        source_pattern_ids: vec![PatternId::from("p1")],
        created_at: Utc::now(),
    }
}

fn procedure(steps: &[&str]) -> Procedure {
    let steps: Vec<String> = steps.iter().map(|s| s.to_string()).collect();
    Procedure {
        id: ProcedureId::new(),
        namespace: "ns".into(),
        name: "deploy".into(),
        step_signature_hash: ContentDigest::from_bytes(steps.join("\u{1f}").as_bytes()),
        ordered_steps: steps,
        source_pattern_ids: vec![PatternId::from("p1")],
        effectiveness_score: 0.7,
        created_at: Utc::now(),
    }
}

async fn surreal() -> SurrealStore {
    SurrealStore::in_memory().await.unwrap()
}

// ===========================================================================
// Contracts (generic over the backend)
// ===========================================================================

async fn insert_and_list_orders_by_timestamp<S: MemoryBackend>(store: &S) {
    store.insert_event(event("b", "s1", "second", 20)).await.unwrap();
    store.insert_event(event("a", "s1", "first", 10)).await.unwrap();
    store.insert_event(event("c", "s2", "other session", 30)).await.unwrap();

    let all = store.list_live_events("ns", None).await.unwrap();
    let ids: Vec<_> = all.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "c"]);

    let s1 = store.list_live_events("ns", Some("s1")).await.unwrap();
    assert_eq!(s1.len(), 2);

    assert!(store.list_live_events("other", None).await.unwrap().is_empty());
}

async fn duplicate_event_id_rejected<S: MemoryBackend>(store: &S) {
    store.insert_event(event("dup", "s1", "x", 0)).await.unwrap();
    let err = store
        .insert_event(event("dup", "s1", "y", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::UniqueViolation { .. }));
}

async fn get_events_reports_missing<S: MemoryBackend>(store: &S) {
    store.insert_event(event("a", "s1", "x", 0)).await.unwrap();
    let err = store
        .get_events(&[EventId::from("a"), EventId::from("ghost")])
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::NotFound { .. }));
}

async fn claims_are_exclusive<S: MemoryBackend>(store: &S) {
    for id in ["a", "b", "c"] {
        store.insert_event(event(id, "s1", id, 0)).await.unwrap();
    }
    let ids = vec![EventId::from("a"), EventId::from("b")];

    let first = store.claim_events(&ids, "run-1").await.unwrap();
    assert_eq!(first.len(), 2);

    let all: Vec<_> = ["a", "b", "c"].iter().map(|s| EventId::from(*s)).collect();
    let second = store.claim_events(&all, "run-2").await.unwrap();
    assert_eq!(second, vec![EventId::from("c")]);

    // A run can only finalize its own claims.
    assert_eq!(store.finalize_claims(&ids, "run-2").await.unwrap(), 0);
    assert_eq!(store.finalize_claims(&ids, "run-1").await.unwrap(), 2);

    let consolidated = store
        .list_by_status("ns", ConsolidationStatus::Consolidated)
        .await
        .unwrap();
    assert_eq!(consolidated.len(), 2);
    assert!(consolidated.iter().all(|e| e.claimed_by.is_none()));

    // Consolidated events cannot be claimed again.
    assert!(store.claim_events(&ids, "run-3").await.unwrap().is_empty());
}

async fn released_claims_become_claimable<S: MemoryBackend>(store: &S) {
    for id in ["a", "b"] {
        store.insert_event(event(id, "s1", id, 0)).await.unwrap();
    }
    let ids = vec![EventId::from("a"), EventId::from("b")];
    store.claim_events(&ids, "dead-run").await.unwrap();

    assert_eq!(store.release_run_claims("dead-run").await.unwrap(), 2);
    let pending = store
        .list_by_status("ns", ConsolidationStatus::Unconsolidated)
        .await
        .unwrap();
    assert_eq!(pending.len(), 2);

    assert_eq!(store.claim_events(&ids, "run-2").await.unwrap().len(), 2);
    assert_eq!(
        store.release_claims(&ids[..1], "run-2").await.unwrap(),
        1
    );
}

async fn merge_commit_is_version_guarded<S: MemoryBackend>(store: &S) {
    store.insert_event(event("canon", "s1", "x", 0)).await.unwrap();
    store.insert_event(event("dupe", "s1", "x", 1)).await.unwrap();
    let canon = store.get_event(&EventId::from("canon")).await.unwrap();
    let dupe = store.get_event(&EventId::from("dupe")).await.unwrap();

    let commit = MergeCommit {
        canonical: VersionedId {
            event_id: canon.id.clone(),
            version: canon.version,
        },
        tags: ["a".to_string(), "b".to_string()].into_iter().collect(),
        importance_score: 0.9,
        merged: vec![VersionedId {
            event_id: dupe.id.clone(),
            version: dupe.version,
        }],
    };
    store.commit_merge(commit.clone()).await.unwrap();

    let dupe_after = store.get_event(&dupe.id).await.unwrap();
    assert_eq!(dupe_after.canonical_id, Some(canon.id.clone()));
    let canon_after = store.get_event(&canon.id).await.unwrap();
    assert_eq!(canon_after.tags.len(), 2);
    assert!((canon_after.importance_score - 0.9).abs() < 1e-6);

    let merged = store.list_merged_into(&canon.id).await.unwrap();
    assert_eq!(merged.len(), 1);
    assert_eq!(store.list_live_events("ns", None).await.unwrap().len(), 1);

    // Replaying the stale commit must fail and change nothing.
    let err = store.commit_merge(commit).await.unwrap_err();
    assert!(matches!(err, StorageError::VersionConflict { .. }));
    let canon_again = store.get_event(&canon.id).await.unwrap();
    assert_eq!(canon_again.version, canon_after.version);
}

async fn merge_commit_repoints_children_of_demoted_canonical<S: MemoryBackend>(store: &S) {
    for (id, offset) in [("a", 0), ("a-child", 1), ("b", 2)] {
        store.insert_event(event(id, "s1", "x", offset)).await.unwrap();
    }
    let guard = |e: &EpisodicEvent| VersionedId {
        event_id: e.id.clone(),
        version: e.version,
    };

    let a = store.get_event(&EventId::from("a")).await.unwrap();
    let child = store.get_event(&EventId::from("a-child")).await.unwrap();
    store
        .commit_merge(MergeCommit {
            canonical: guard(&a),
            tags: Default::default(),
            importance_score: 0.5,
            merged: vec![guard(&child)],
        })
        .await
        .unwrap();

    // Demote "a" under "b" and carry its child along.
    let a = store.get_event(&EventId::from("a")).await.unwrap();
    let child = store.get_event(&EventId::from("a-child")).await.unwrap();
    let b = store.get_event(&EventId::from("b")).await.unwrap();
    store
        .commit_merge(MergeCommit {
            canonical: guard(&b),
            tags: Default::default(),
            importance_score: 0.5,
            merged: vec![guard(&a), guard(&child)],
        })
        .await
        .unwrap();

    let under_b = store.list_merged_into(&b.id).await.unwrap();
    assert_eq!(under_b.len(), 2);
    assert!(store.list_merged_into(&a.id).await.unwrap().is_empty());
    let live = store.list_live_events("ns", None).await.unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].id, b.id);
}

async fn memory_hash_is_unique<S: MemoryBackend>(store: &S) {
    let first = store
        .insert_semantic_memory(memory("use rustfmt before commit"))
        .await
        .unwrap();
    assert!(first.is_inserted());

    let second = store
        .insert_semantic_memory(memory("use rustfmt before commit"))
        .await
        .unwrap();
    assert_eq!(second, InsertOutcome::Existing(first.id().clone()));

    store
        .link_memory_pattern(first.id(), &PatternId::from("p2"))
        .await
        .unwrap();
    store
        .link_memory_pattern(first.id(), &PatternId::from("p2"))
        .await
        .unwrap();
    let stored = store.get_memory(first.id()).await.unwrap();
    assert_eq!(stored.source_pattern_ids.len(), 2);
    assert_eq!(store.list_memories("ns").await.unwrap().len(), 1);
}

async fn procedure_signature_is_unique<S: MemoryBackend>(store: &S) {
    let first = store
        .insert_procedure(procedure(&["build", "test", "deploy"]))
        .await
        .unwrap();
    let again = store
        .insert_procedure(procedure(&["build", "test", "deploy"]))
        .await
        .unwrap();
    assert_eq!(again.id(), first.id());
    assert!(!again.is_inserted());

    let reordered = store
        .insert_procedure(procedure(&["test", "build", "deploy"]))
        .await
        .unwrap();
    assert!(reordered.is_inserted());
    assert_eq!(store.list_procedures("ns").await.unwrap().len(), 2);
}

async fn knowledge_uniqueness_is_per_namespace<S: MemoryBackend>(store: &S) {
    let a = store
        .insert_semantic_memory(memory("run cargo fmt"))
        .await
        .unwrap();
    let b = store
        .insert_semantic_memory(SemanticMemory {
            namespace: "tenant-b".into(),
            ..memory("run cargo fmt")
        })
        .await
        .unwrap();
    assert!(a.is_inserted());
    assert!(b.is_inserted());
    assert_ne!(a.id(), b.id());

    let hash = ContentDigest::from_bytes(b"run cargo fmt");
    let found = store.find_memory_by_hash("tenant-b", &hash).await.unwrap().unwrap();
    assert_eq!(&found.id, b.id());
    assert_eq!(found.namespace, "tenant-b");
    assert!(store.find_memory_by_hash("tenant-c", &hash).await.unwrap().is_none());
    assert_eq!(store.list_memories("tenant-b").await.unwrap().len(), 1);

    let p = procedure(&["build", "test"]);
    let signature = p.step_signature_hash.clone();
    let pa = store.insert_procedure(p).await.unwrap();
    let pb = store
        .insert_procedure(Procedure {
            namespace: "tenant-b".into(),
            ..procedure(&["build", "test"])
        })
        .await
        .unwrap();
    assert!(pa.is_inserted());
    assert!(pb.is_inserted());
    let found = store
        .find_procedure_by_signature("ns", &signature)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&found.id, pa.id());
}

async fn embedding_replacement_archives_previous<S: MemoryBackend>(store: &S) {
    store.insert_event(event("a", "s1", "x", 0)).await.unwrap();
    let owner = EmbeddingOwner::Event(EventId::from("a"));

    let previous = store
        .replace_embedding(&owner, EmbeddingRecord::new(vec![0.0, 1.0, 0.0], "embed-v2"))
        .await
        .unwrap();
    assert_eq!(previous.model_version, "embed-v1");

    let current = store.get_event(&EventId::from("a")).await.unwrap();
    assert_eq!(current.embedding.model_version, "embed-v2");

    let history = store.embedding_history(&owner).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].vector, vec![1.0, 0.0, 0.0]);

    let missing = EmbeddingOwner::Memory(MemoryId::from("ghost"));
    let err = store
        .replace_embedding(&missing, EmbeddingRecord::new(vec![], "embed-v2"))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::NotFound { .. }));
}

async fn list_embeddings_covers_events_and_memories<S: MemoryBackend>(store: &S) {
    store.insert_event(event("a", "s1", "x", 0)).await.unwrap();
    store
        .insert_semantic_memory(memory("fact"))
        .await
        .unwrap();
    let entries = store.list_embeddings("ns").await.unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries
        .iter()
        .any(|e| matches!(e.owner, EmbeddingOwner::Memory(_))));
}

async fn lock_is_exclusive_until_expiry<S: MemoryBackend>(store: &S) {
    let got = store
        .try_acquire("ns", "run-1", Duration::minutes(15))
        .await
        .unwrap()
        .unwrap();
    assert!(got.reclaimed_from.is_none());

    assert!(store
        .try_acquire("ns", "run-2", Duration::minutes(15))
        .await
        .unwrap()
        .is_none());
    assert!(!store.release("ns", "run-2").await.unwrap());
    assert!(store.renew("ns", "run-1", Duration::minutes(15)).await.unwrap());

    assert!(store.release("ns", "run-1").await.unwrap());
    assert!(store.current("ns").await.unwrap().is_none());
}

async fn expired_lock_is_reclaimed<S: MemoryBackend>(store: &S) {
    store
        .try_acquire("ns", "crashed", Duration::milliseconds(-1))
        .await
        .unwrap()
        .unwrap();

    let got = store
        .try_acquire("ns", "run-2", Duration::minutes(15))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got.reclaimed_from.as_deref(), Some("crashed"));
    assert_eq!(store.current("ns").await.unwrap().unwrap().owner, "run-2");
}

async fn references_follow_redirects<S: MemoryBackend>(store: &S) {
    let from = EventId::from("dupe");
    let to = EventId::from("canon");
    store.add_reference("graph:edge-1", &from).await.unwrap();
    store.add_reference("graph:edge-2", &from).await.unwrap();
    store.add_reference("graph:edge-2", &to).await.unwrap();

    assert_eq!(store.redirect_references(&from, &to).await.unwrap(), 2);
    assert!(store.references_to(&from).await.unwrap().is_empty());
    assert_eq!(
        store.references_to(&to).await.unwrap(),
        vec!["graph:edge-1".to_string(), "graph:edge-2".to_string()]
    );
}

// ===========================================================================
// Instantiations
// ===========================================================================

macro_rules! contract {
    ($name:ident) => {
        mod $name {
            use super::*;

            #[tokio::test]
            async fn in_memory() {
                super::$name(&InMemoryStore::new()).await;
            }

            #[tokio::test]
            async fn surreal_mem() {
                super::$name(&surreal().await).await;
            }
        }
    };
}

contract!(insert_and_list_orders_by_timestamp);
contract!(duplicate_event_id_rejected);
contract!(get_events_reports_missing);
contract!(claims_are_exclusive);
contract!(released_claims_become_claimable);
contract!(merge_commit_is_version_guarded);
contract!(merge_commit_repoints_children_of_demoted_canonical);
contract!(memory_hash_is_unique);
contract!(procedure_signature_is_unique);
contract!(knowledge_uniqueness_is_per_namespace);
contract!(embedding_replacement_archives_previous);
contract!(list_embeddings_covers_events_and_memories);
contract!(lock_is_exclusive_until_expiry);
contract!(expired_lock_is_reclaimed);
contract!(references_follow_redirects);
