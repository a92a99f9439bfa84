//! In-memory fakes for storage traits (testing only)
//!
//! Provides `InMemoryStore`, which satisfies every storage trait without any
//! external dependencies. All tables sit behind one mutex, so each trait
//! call is trivially atomic.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{Duration, Utc};

use crate::error::StorageError;
use crate::storage_traits::*;

#[derive(Debug, Default)]
struct Tables {
    events: HashMap<EventId, EpisodicEvent>,
    memories: HashMap<MemoryId, SemanticMemory>,
    memory_by_hash: HashMap<(String, ContentDigest), MemoryId>,
    procedures: HashMap<ProcedureId, Procedure>,
    procedure_by_signature: HashMap<(String, ContentDigest), ProcedureId>,
    embedding_history: HashMap<EmbeddingOwner, Vec<EmbeddingRecord>>,
    locks: HashMap<String, LockLease>,
    references: HashMap<EventId, BTreeSet<String>>,
}

/// In-memory backend implementing every storage trait.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
    redirect_failures: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls to `redirect_references` fail with a backend
    /// error before touching any state.
    pub fn fail_next_redirects(&self, n: usize) {
        self.redirect_failures.store(n, Ordering::SeqCst);
    }

    fn tables(&self) -> StorageResult<MutexGuard<'_, Tables>> {
        self.tables.lock().map_err(|_| StorageError::LockPoisoned)
    }
}

fn by_timestamp(mut events: Vec<EpisodicEvent>) -> Vec<EpisodicEvent> {
    events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
    events
}

// ---------------------------------------------------------------------------
// EventStore
// ---------------------------------------------------------------------------

#[async_trait]
impl EventStore for InMemoryStore {
    async fn insert_event(&self, event: EpisodicEvent) -> StorageResult<EventId> {
        let mut t = self.tables()?;
        if t.events.contains_key(&event.id) {
            return Err(StorageError::UniqueViolation {
                key: format!("event:{}", event.id),
            });
        }
        let id = event.id.clone();
        t.events.insert(id.clone(), event);
        Ok(id)
    }

    async fn get_event(&self, id: &EventId) -> StorageResult<EpisodicEvent> {
        let t = self.tables()?;
        t.events
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("event", id.as_str()))
    }

    async fn get_events(&self, ids: &[EventId]) -> StorageResult<Vec<EpisodicEvent>> {
        let t = self.tables()?;
        ids.iter()
            .map(|id| {
                t.events
                    .get(id)
                    .cloned()
                    .ok_or_else(|| StorageError::not_found("event", id.as_str()))
            })
            .collect()
    }

    async fn list_live_events(
        &self,
        namespace: &str,
        session_id: Option<&str>,
    ) -> StorageResult<Vec<EpisodicEvent>> {
        let t = self.tables()?;
        let events = t
            .events
            .values()
            .filter(|e| e.namespace == namespace && !e.is_merged())
            .filter(|e| session_id.map_or(true, |s| e.session_id == s))
            .cloned()
            .collect();
        Ok(by_timestamp(events))
    }

    async fn list_by_status(
        &self,
        namespace: &str,
        status: ConsolidationStatus,
    ) -> StorageResult<Vec<EpisodicEvent>> {
        let t = self.tables()?;
        let events = t
            .events
            .values()
            .filter(|e| {
                e.namespace == namespace && !e.is_merged() && e.consolidation_status == status
            })
            .cloned()
            .collect();
        Ok(by_timestamp(events))
    }

    async fn list_merged_into(&self, canonical: &EventId) -> StorageResult<Vec<EpisodicEvent>> {
        let t = self.tables()?;
        let events = t
            .events
            .values()
            .filter(|e| e.canonical_id.as_ref() == Some(canonical))
            .cloned()
            .collect();
        Ok(by_timestamp(events))
    }

    async fn claim_events(&self, ids: &[EventId], run_id: &str) -> StorageResult<Vec<EventId>> {
        let mut t = self.tables()?;
        let mut claimed = Vec::new();
        for id in ids {
            if let Some(e) = t.events.get_mut(id) {
                if e.consolidation_status == ConsolidationStatus::Unconsolidated && !e.is_merged()
                {
                    e.consolidation_status = ConsolidationStatus::Consolidating;
                    e.claimed_by = Some(run_id.to_string());
                    e.version += 1;
                    claimed.push(id.clone());
                }
            }
        }
        Ok(claimed)
    }

    async fn finalize_claims(&self, ids: &[EventId], run_id: &str) -> StorageResult<usize> {
        let mut t = self.tables()?;
        let mut n = 0;
        for id in ids {
            if let Some(e) = t.events.get_mut(id) {
                if e.consolidation_status == ConsolidationStatus::Consolidating
                    && e.claimed_by.as_deref() == Some(run_id)
                {
                    e.consolidation_status = ConsolidationStatus::Consolidated;
                    e.claimed_by = None;
                    e.version += 1;
                    n += 1;
                }
            }
        }
        Ok(n)
    }

    async fn release_claims(&self, ids: &[EventId], run_id: &str) -> StorageResult<usize> {
        let mut t = self.tables()?;
        let mut n = 0;
        for id in ids {
            if let Some(e) = t.events.get_mut(id) {
                if e.consolidation_status == ConsolidationStatus::Consolidating
                    && e.claimed_by.as_deref() == Some(run_id)
                {
                    e.consolidation_status = ConsolidationStatus::Unconsolidated;
                    e.claimed_by = None;
                    e.version += 1;
                    n += 1;
                }
            }
        }
        Ok(n)
    }

    async fn release_run_claims(&self, run_id: &str) -> StorageResult<usize> {
        let mut t = self.tables()?;
        let mut n = 0;
        for e in t.events.values_mut() {
            if e.consolidation_status == ConsolidationStatus::Consolidating
                && e.claimed_by.as_deref() == Some(run_id)
            {
                e.consolidation_status = ConsolidationStatus::Unconsolidated;
                e.claimed_by = None;
                e.version += 1;
                n += 1;
            }
        }
        Ok(n)
    }

    async fn commit_merge(&self, commit: MergeCommit) -> StorageResult<()> {
        let mut t = self.tables()?;

        // Check every guard before writing anything.
        for guard in std::iter::once(&commit.canonical).chain(commit.merged.iter()) {
            let e = t
                .events
                .get(&guard.event_id)
                .ok_or_else(|| StorageError::not_found("event", guard.event_id.as_str()))?;
            let is_canonical = guard.event_id == commit.canonical.event_id;
            if e.version != guard.version || (is_canonical && e.is_merged()) {
                return Err(StorageError::VersionConflict {
                    id: guard.event_id.to_string(),
                });
            }
        }

        let canonical_id = commit.canonical.event_id.clone();
        for guard in &commit.merged {
            if let Some(e) = t.events.get_mut(&guard.event_id) {
                e.canonical_id = Some(canonical_id.clone());
                e.version += 1;
            }
        }
        if let Some(c) = t.events.get_mut(&canonical_id) {
            c.tags = commit.tags;
            c.importance_score = commit.importance_score;
            c.version += 1;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// KnowledgeStore
// ---------------------------------------------------------------------------

#[async_trait]
impl KnowledgeStore for InMemoryStore {
    async fn insert_semantic_memory(
        &self,
        memory: SemanticMemory,
    ) -> StorageResult<InsertOutcome<MemoryId>> {
        let mut t = self.tables()?;
        let key = (memory.namespace.clone(), memory.content_hash.clone());
        if let Some(existing) = t.memory_by_hash.get(&key) {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }
        let id = memory.id.clone();
        t.memory_by_hash.insert(key, id.clone());
        t.memories.insert(id.clone(), memory);
        Ok(InsertOutcome::Inserted(id))
    }

    async fn find_memory_by_hash(
        &self,
        namespace: &str,
        content_hash: &ContentDigest,
    ) -> StorageResult<Option<SemanticMemory>> {
        let t = self.tables()?;
        Ok(t
            .memory_by_hash
            .get(&(namespace.to_string(), content_hash.clone()))
            .and_then(|id| t.memories.get(id))
            .cloned())
    }

    async fn get_memory(&self, id: &MemoryId) -> StorageResult<SemanticMemory> {
        let t = self.tables()?;
        t.memories
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("memory", id.as_str()))
    }

    async fn list_memories(&self, namespace: &str) -> StorageResult<Vec<SemanticMemory>> {
        let t = self.tables()?;
        let mut out: Vec<_> = t
            .memories
            .values()
            .filter(|m| m.namespace == namespace)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn link_memory_pattern(&self, id: &MemoryId, pattern: &PatternId) -> StorageResult<()> {
        let mut t = self.tables()?;
        let m = t
            .memories
            .get_mut(id)
            .ok_or_else(|| StorageError::not_found("memory", id.as_str()))?;
        if !m.source_pattern_ids.contains(pattern) {
            m.source_pattern_ids.push(pattern.clone());
        }
        Ok(())
    }

    async fn insert_procedure(
        &self,
        procedure: Procedure,
    ) -> StorageResult<InsertOutcome<ProcedureId>> {
        let mut t = self.tables()?;
        let key = (procedure.namespace.clone(), procedure.step_signature_hash.clone());
        if let Some(existing) = t.procedure_by_signature.get(&key) {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }
        let id = procedure.id.clone();
        t.procedure_by_signature.insert(key, id.clone());
        t.procedures.insert(id.clone(), procedure);
        Ok(InsertOutcome::Inserted(id))
    }

    async fn find_procedure_by_signature(
        &self,
        namespace: &str,
        signature: &ContentDigest,
    ) -> StorageResult<Option<Procedure>> {
        let t = self.tables()?;
        Ok(t
            .procedure_by_signature
            .get(&(namespace.to_string(), signature.clone()))
            .and_then(|id| t.procedures.get(id))
            .cloned())
    }

    async fn get_procedure(&self, id: &ProcedureId) -> StorageResult<Procedure> {
        let t = self.tables()?;
        t.procedures
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("procedure", id.as_str()))
    }

    async fn list_procedures(&self, namespace: &str) -> StorageResult<Vec<Procedure>> {
        let t = self.tables()?;
        let mut out: Vec<_> = t
            .procedures
            .values()
            .filter(|p| p.namespace == namespace)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn link_procedure_pattern(
        &self,
        id: &ProcedureId,
        pattern: &PatternId,
    ) -> StorageResult<()> {
        let mut t = self.tables()?;
        let p = t
            .procedures
            .get_mut(id)
            .ok_or_else(|| StorageError::not_found("procedure", id.as_str()))?;
        if !p.source_pattern_ids.contains(pattern) {
            p.source_pattern_ids.push(pattern.clone());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// EmbeddingStore
// ---------------------------------------------------------------------------

#[async_trait]
impl EmbeddingStore for InMemoryStore {
    async fn replace_embedding(
        &self,
        owner: &EmbeddingOwner,
        record: EmbeddingRecord,
    ) -> StorageResult<EmbeddingRecord> {
        let mut t = self.tables()?;
        let slot = match owner {
            EmbeddingOwner::Event(id) => t
                .events
                .get_mut(id)
                .map(|e| {
                    e.version += 1;
                    &mut e.embedding
                })
                .ok_or_else(|| StorageError::not_found("event", id.as_str()))?,
            EmbeddingOwner::Memory(id) => t
                .memories
                .get_mut(id)
                .map(|m| &mut m.embedding)
                .ok_or_else(|| StorageError::not_found("memory", id.as_str()))?,
        };
        let previous = std::mem::replace(slot, record);
        t.embedding_history
            .entry(owner.clone())
            .or_default()
            .push(previous.clone());
        Ok(previous)
    }

    async fn embedding_history(
        &self,
        owner: &EmbeddingOwner,
    ) -> StorageResult<Vec<EmbeddingRecord>> {
        let t = self.tables()?;
        Ok(t.embedding_history.get(owner).cloned().unwrap_or_default())
    }

    async fn list_embeddings(&self, namespace: &str) -> StorageResult<Vec<EmbeddingEntry>> {
        let t = self.tables()?;
        let mut out: Vec<EmbeddingEntry> = t
            .events
            .values()
            .filter(|e| e.namespace == namespace && !e.is_merged())
            .map(|e| EmbeddingEntry {
                owner: EmbeddingOwner::Event(e.id.clone()),
                content: e.content.clone(),
                embedding: e.embedding.clone(),
            })
            .chain(
                t.memories
                    .values()
                    .filter(|m| m.namespace == namespace)
                    .map(|m| EmbeddingEntry {
                        owner: EmbeddingOwner::Memory(m.id.clone()),
                        content: m.content.clone(),
                        embedding: m.embedding.clone(),
                    }),
            )
            .collect();
        out.sort_by(|a, b| a.owner.cmp(&b.owner));
        Ok(out)
    }

    async fn get_embeddings(
        &self,
        owners: &[EmbeddingOwner],
    ) -> StorageResult<Vec<EmbeddingEntry>> {
        let t = self.tables()?;
        owners
            .iter()
            .map(|owner| match owner {
                EmbeddingOwner::Event(id) => t
                    .events
                    .get(id)
                    .map(|e| EmbeddingEntry {
                        owner: owner.clone(),
                        content: e.content.clone(),
                        embedding: e.embedding.clone(),
                    })
                    .ok_or_else(|| StorageError::not_found("event", id.as_str())),
                EmbeddingOwner::Memory(id) => t
                    .memories
                    .get(id)
                    .map(|m| EmbeddingEntry {
                        owner: owner.clone(),
                        content: m.content.clone(),
                        embedding: m.embedding.clone(),
                    })
                    .ok_or_else(|| StorageError::not_found("memory", id.as_str())),
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// ConsolidationLocks
// ---------------------------------------------------------------------------

#[async_trait]
impl ConsolidationLocks for InMemoryStore {
    async fn try_acquire(
        &self,
        scope_key: &str,
        owner: &str,
        ttl: Duration,
    ) -> StorageResult<Option<LockAcquisition>> {
        let mut t = self.tables()?;
        let now = Utc::now();
        let reclaimed_from = match t.locks.get(scope_key) {
            Some(lease) if !lease.is_expired(now) => return Ok(None),
            Some(lease) => Some(lease.owner.clone()),
            None => None,
        };
        let lease = LockLease::new(scope_key, owner, ttl);
        t.locks.insert(scope_key.to_string(), lease.clone());
        Ok(Some(LockAcquisition {
            lease,
            reclaimed_from,
        }))
    }

    async fn renew(&self, scope_key: &str, owner: &str, ttl: Duration) -> StorageResult<bool> {
        let mut t = self.tables()?;
        match t.locks.get_mut(scope_key) {
            Some(lease) if lease.owner == owner => {
                lease.expires_at = Utc::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, scope_key: &str, owner: &str) -> StorageResult<bool> {
        let mut t = self.tables()?;
        let held = matches!(t.locks.get(scope_key), Some(lease) if lease.owner == owner);
        if held {
            t.locks.remove(scope_key);
        }
        Ok(held)
    }

    async fn current(&self, scope_key: &str) -> StorageResult<Option<LockLease>> {
        let t = self.tables()?;
        Ok(t.locks.get(scope_key).cloned())
    }
}

// ---------------------------------------------------------------------------
// ReferenceIndex
// ---------------------------------------------------------------------------

#[async_trait]
impl ReferenceIndex for InMemoryStore {
    async fn add_reference(&self, holder: &str, event: &EventId) -> StorageResult<()> {
        let mut t = self.tables()?;
        t.references
            .entry(event.clone())
            .or_default()
            .insert(holder.to_string());
        Ok(())
    }

    async fn references_to(&self, event: &EventId) -> StorageResult<Vec<String>> {
        let t = self.tables()?;
        Ok(t
            .references
            .get(event)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn redirect_references(&self, from: &EventId, to: &EventId) -> StorageResult<usize> {
        let injected = self
            .redirect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StorageError::Backend("injected redirect failure".into()));
        }
        let mut t = self.tables()?;
        let Some(holders) = t.references.remove(from) else {
            return Ok(0);
        };
        let moved = holders.len();
        t.references.entry(to.clone()).or_default().extend(holders);
        Ok(moved)
    }
}
