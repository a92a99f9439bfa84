//! SurrealDB-backed implementation of every storage trait
//!
//! Uses `schema` row types for persistence, converting to and from
//! `storage_traits` types at the boundary. Conditional lifecycle updates
//! are single `UPDATE ... WHERE` statements; merges and embedding
//! replacement run inside one transaction each.

use std::collections::HashMap;
use std::fmt::Write as _;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use surrealdb::engine::any::Any;
use surrealdb::sql::Datetime as SurrealDatetime;
use surrealdb::Surreal;
use tracing::{debug, info, instrument};

use crate::error::StorageError;
use crate::handle::StoreConfig;
use crate::schema::{
    DbEmbedding, EmbeddingHistoryRow, EventRow, LockRow, MemoryRow, ProcedureRow, ReferenceRow,
};
use crate::storage_traits::*;

const VERSION_CONFLICT: &str = "version_conflict";
const OWNER_MISSING: &str = "owner_missing";

fn db_err(e: surrealdb::Error) -> StorageError {
    let msg = e.to_string();
    if msg.contains("already contains") {
        StorageError::UniqueViolation { key: msg }
    } else {
        StorageError::Backend(msg)
    }
}

fn rows_to_events(rows: Vec<EventRow>) -> StorageResult<Vec<EpisodicEvent>> {
    let mut events = rows
        .into_iter()
        .map(EpisodicEvent::try_from)
        .collect::<StorageResult<Vec<_>>>()?;
    events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
    Ok(events)
}

/// SurrealDB-backed [`MemoryBackend`].
#[derive(Clone)]
pub struct SurrealStore {
    db: Surreal<Any>,
}

impl SurrealStore {
    /// Wrap an already-initialized connection.
    pub fn new(db: Surreal<Any>) -> Self {
        Self { db }
    }

    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> crate::Result<Self> {
        Self::connect(&StoreConfig::Memory).await
    }

    pub async fn connect(config: &StoreConfig) -> crate::Result<Self> {
        let db = config.connect().await?;
        info!("SurrealStore connected");
        Ok(Self { db })
    }

    /// Create from environment variables (see [`StoreConfig::from_env`]).
    pub async fn from_env() -> crate::Result<Self> {
        Self::connect(&StoreConfig::from_env()).await
    }

    // -- private helpers -----------------------------------------------------

    async fn fetch_event(&self, id: &str) -> StorageResult<Option<EventRow>> {
        let mut res = self
            .db
            .query("SELECT * FROM events WHERE event_id = $eid")
            .bind(("eid", id.to_string()))
            .await
            .map_err(db_err)?;
        let rows: Vec<EventRow> = res.take(0).map_err(db_err)?;
        Ok(rows.into_iter().next())
    }

    async fn fetch_memory(&self, field: &'static str, value: &str) -> StorageResult<Option<MemoryRow>> {
        let sql = format!("SELECT * FROM memories WHERE {field} = $v");
        let mut res = self
            .db
            .query(sql)
            .bind(("v", value.to_string()))
            .await
            .map_err(db_err)?;
        let rows: Vec<MemoryRow> = res.take(0).map_err(db_err)?;
        Ok(rows.into_iter().next())
    }

    async fn fetch_memory_by_hash(
        &self,
        namespace: &str,
        hash: &ContentDigest,
    ) -> StorageResult<Option<MemoryRow>> {
        let mut res = self
            .db
            .query("SELECT * FROM memories WHERE namespace = $ns AND content_hash = $v")
            .bind(("ns", namespace.to_string()))
            .bind(("v", hash.as_str().to_string()))
            .await
            .map_err(db_err)?;
        let rows: Vec<MemoryRow> = res.take(0).map_err(db_err)?;
        Ok(rows.into_iter().next())
    }

    async fn fetch_procedure_by_signature(
        &self,
        namespace: &str,
        signature: &ContentDigest,
    ) -> StorageResult<Option<ProcedureRow>> {
        let mut res = self
            .db
            .query("SELECT * FROM procedures WHERE namespace = $ns AND step_signature_hash = $v")
            .bind(("ns", namespace.to_string()))
            .bind(("v", signature.as_str().to_string()))
            .await
            .map_err(db_err)?;
        let rows: Vec<ProcedureRow> = res.take(0).map_err(db_err)?;
        Ok(rows.into_iter().next())
    }

    async fn fetch_procedure(
        &self,
        field: &'static str,
        value: &str,
    ) -> StorageResult<Option<ProcedureRow>> {
        let sql = format!("SELECT * FROM procedures WHERE {field} = $v");
        let mut res = self
            .db
            .query(sql)
            .bind(("v", value.to_string()))
            .await
            .map_err(db_err)?;
        let rows: Vec<ProcedureRow> = res.take(0).map_err(db_err)?;
        Ok(rows.into_iter().next())
    }

    /// Conditional status transition for claimed rows; returns rows touched.
    async fn transition_claims(
        &self,
        ids: Option<&[EventId]>,
        run_id: &str,
        to: ConsolidationStatus,
    ) -> StorageResult<usize> {
        let id_filter = if ids.is_some() {
            "event_id INSIDE $ids AND "
        } else {
            ""
        };
        let sql = format!(
            "UPDATE events SET consolidation_status = $to, claimed_by = NONE, version += 1 \
             WHERE {id_filter}claimed_by = $run AND consolidation_status = 'consolidating' \
             RETURN AFTER"
        );
        let ids: Vec<String> = ids
            .unwrap_or_default()
            .iter()
            .map(|id| id.0.clone())
            .collect();
        let mut res = self
            .db
            .query(sql)
            .bind(("ids", ids))
            .bind(("run", run_id.to_string()))
            .bind(("to", to.as_str().to_string()))
            .await
            .map_err(db_err)?;
        let rows: Vec<EventRow> = res.take(0).map_err(db_err)?;
        Ok(rows.len())
    }

    fn owner_table(owner: &EmbeddingOwner) -> (&'static str, &'static str) {
        match owner {
            EmbeddingOwner::Event(_) => ("events", "event_id"),
            EmbeddingOwner::Memory(_) => ("memories", "memory_id"),
        }
    }
}

// ---------------------------------------------------------------------------
// EventStore
// ---------------------------------------------------------------------------

#[async_trait]
impl EventStore for SurrealStore {
    #[instrument(skip(self, event), fields(event_id = %event.id))]
    async fn insert_event(&self, event: EpisodicEvent) -> StorageResult<EventId> {
        let id = event.id.clone();
        let created: Result<Option<EventRow>, _> =
            self.db.create("events").content(EventRow::from(event)).await;
        match created {
            Ok(_) => Ok(id),
            Err(e) => match db_err(e) {
                StorageError::UniqueViolation { .. } => Err(StorageError::UniqueViolation {
                    key: format!("event:{id}"),
                }),
                other => Err(other),
            },
        }
    }

    async fn get_event(&self, id: &EventId) -> StorageResult<EpisodicEvent> {
        self.fetch_event(id.as_str())
            .await?
            .ok_or_else(|| StorageError::not_found("event", id.as_str()))
            .and_then(EpisodicEvent::try_from)
    }

    async fn get_events(&self, ids: &[EventId]) -> StorageResult<Vec<EpisodicEvent>> {
        let wanted: Vec<String> = ids.iter().map(|id| id.0.clone()).collect();
        let mut res = self
            .db
            .query("SELECT * FROM events WHERE event_id INSIDE $ids")
            .bind(("ids", wanted))
            .await
            .map_err(db_err)?;
        let rows: Vec<EventRow> = res.take(0).map_err(db_err)?;
        let mut by_id: HashMap<String, EventRow> =
            rows.into_iter().map(|r| (r.event_id.clone(), r)).collect();

        ids.iter()
            .map(|id| {
                by_id
                    .remove(id.as_str())
                    .ok_or_else(|| StorageError::not_found("event", id.as_str()))
                    .and_then(EpisodicEvent::try_from)
            })
            .collect()
    }

    async fn list_live_events(
        &self,
        namespace: &str,
        session_id: Option<&str>,
    ) -> StorageResult<Vec<EpisodicEvent>> {
        let rows: Vec<EventRow> = match session_id {
            Some(session) => {
                let mut res = self
                    .db
                    .query(
                        "SELECT * FROM events WHERE namespace = $ns AND merged = false \
                         AND session_id = $sid",
                    )
                    .bind(("ns", namespace.to_string()))
                    .bind(("sid", session.to_string()))
                    .await
                    .map_err(db_err)?;
                res.take(0).map_err(db_err)?
            }
            None => {
                let mut res = self
                    .db
                    .query("SELECT * FROM events WHERE namespace = $ns AND merged = false")
                    .bind(("ns", namespace.to_string()))
                    .await
                    .map_err(db_err)?;
                res.take(0).map_err(db_err)?
            }
        };
        rows_to_events(rows)
    }

    async fn list_by_status(
        &self,
        namespace: &str,
        status: ConsolidationStatus,
    ) -> StorageResult<Vec<EpisodicEvent>> {
        let mut res = self
            .db
            .query(
                "SELECT * FROM events WHERE namespace = $ns AND merged = false \
                 AND consolidation_status = $st",
            )
            .bind(("ns", namespace.to_string()))
            .bind(("st", status.as_str().to_string()))
            .await
            .map_err(db_err)?;
        rows_to_events(res.take(0).map_err(db_err)?)
    }

    async fn list_merged_into(&self, canonical: &EventId) -> StorageResult<Vec<EpisodicEvent>> {
        let mut res = self
            .db
            .query("SELECT * FROM events WHERE merged = true AND canonical_id = $cid")
            .bind(("cid", canonical.0.clone()))
            .await
            .map_err(db_err)?;
        rows_to_events(res.take(0).map_err(db_err)?)
    }

    #[instrument(skip(self, ids), fields(requested = ids.len()))]
    async fn claim_events(&self, ids: &[EventId], run_id: &str) -> StorageResult<Vec<EventId>> {
        let wanted: Vec<String> = ids.iter().map(|id| id.0.clone()).collect();
        let mut res = self
            .db
            .query(
                "UPDATE events SET consolidation_status = 'consolidating', claimed_by = $run, \
                 version += 1 \
                 WHERE event_id INSIDE $ids AND merged = false \
                 AND consolidation_status = 'unconsolidated' \
                 RETURN AFTER",
            )
            .bind(("ids", wanted))
            .bind(("run", run_id.to_string()))
            .await
            .map_err(db_err)?;
        let rows: Vec<EventRow> = res.take(0).map_err(db_err)?;
        debug!(claimed = rows.len(), "events claimed");
        Ok(rows.into_iter().map(|r| EventId(r.event_id)).collect())
    }

    async fn finalize_claims(&self, ids: &[EventId], run_id: &str) -> StorageResult<usize> {
        self.transition_claims(Some(ids), run_id, ConsolidationStatus::Consolidated)
            .await
    }

    async fn release_claims(&self, ids: &[EventId], run_id: &str) -> StorageResult<usize> {
        self.transition_claims(Some(ids), run_id, ConsolidationStatus::Unconsolidated)
            .await
    }

    async fn release_run_claims(&self, run_id: &str) -> StorageResult<usize> {
        self.transition_claims(None, run_id, ConsolidationStatus::Unconsolidated)
            .await
    }

    #[instrument(skip(self, commit), fields(canonical = %commit.canonical.event_id, merged = commit.merged.len()))]
    async fn commit_merge(&self, commit: MergeCommit) -> StorageResult<()> {
        let mut sql = String::from("BEGIN TRANSACTION;\n");
        sql.push_str(
            "LET $c = (UPDATE events SET tags = $tags, importance_score = $importance, \
             version += 1 WHERE event_id = $cid AND version = $cv AND merged = false \
             RETURN AFTER);\n",
        );
        let _ = writeln!(sql, "IF array::len($c) = 0 {{ THROW \"{VERSION_CONFLICT}\" }};");
        for i in 0..commit.merged.len() {
            let _ = writeln!(
                sql,
                "LET $m{i} = (UPDATE events SET canonical_id = $cid, merged = true, \
                 version += 1 WHERE event_id = $m{i}_id AND version = $m{i}_v \
                 RETURN AFTER);\n\
                 IF array::len($m{i}) = 0 {{ THROW \"{VERSION_CONFLICT}\" }};"
            );
        }
        sql.push_str("COMMIT TRANSACTION;");

        let canonical = commit.canonical.event_id.0.clone();
        let mut query = self
            .db
            .query(sql)
            .bind(("tags", commit.tags.into_iter().collect::<Vec<_>>()))
            .bind(("importance", commit.importance_score))
            .bind(("cid", canonical.clone()))
            .bind(("cv", commit.canonical.version));
        for (i, guard) in commit.merged.iter().enumerate() {
            query = query
                .bind((format!("m{i}_id"), guard.event_id.0.clone()))
                .bind((format!("m{i}_v"), guard.version));
        }

        let res = query.await.map_err(db_err)?;
        res.check().map_err(|e| {
            if e.to_string().contains(VERSION_CONFLICT) {
                StorageError::VersionConflict { id: canonical }
            } else {
                db_err(e)
            }
        })?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// KnowledgeStore
// ---------------------------------------------------------------------------

#[async_trait]
impl KnowledgeStore for SurrealStore {
    #[instrument(skip(self, memory), fields(hash = %memory.content_hash.short()))]
    async fn insert_semantic_memory(
        &self,
        memory: SemanticMemory,
    ) -> StorageResult<InsertOutcome<MemoryId>> {
        let id = memory.id.clone();
        let namespace = memory.namespace.clone();
        let hash = memory.content_hash.clone();
        let created: Result<Option<MemoryRow>, _> =
            self.db.create("memories").content(MemoryRow::from(memory)).await;
        match created.map_err(db_err) {
            Ok(_) => Ok(InsertOutcome::Inserted(id)),
            Err(StorageError::UniqueViolation { key }) => {
                match self.fetch_memory_by_hash(&namespace, &hash).await? {
                    Some(existing) => Ok(InsertOutcome::Existing(MemoryId(existing.memory_id))),
                    None => Err(StorageError::UniqueViolation { key }),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn find_memory_by_hash(
        &self,
        namespace: &str,
        content_hash: &ContentDigest,
    ) -> StorageResult<Option<SemanticMemory>> {
        self.fetch_memory_by_hash(namespace, content_hash)
            .await?
            .map(SemanticMemory::try_from)
            .transpose()
    }

    async fn get_memory(&self, id: &MemoryId) -> StorageResult<SemanticMemory> {
        self.fetch_memory("memory_id", id.as_str())
            .await?
            .ok_or_else(|| StorageError::not_found("memory", id.as_str()))
            .and_then(SemanticMemory::try_from)
    }

    async fn list_memories(&self, namespace: &str) -> StorageResult<Vec<SemanticMemory>> {
        let mut res = self
            .db
            .query("SELECT * FROM memories WHERE namespace = $ns ORDER BY created_at ASC")
            .bind(("ns", namespace.to_string()))
            .await
            .map_err(db_err)?;
        let rows: Vec<MemoryRow> = res.take(0).map_err(db_err)?;
        rows.into_iter().map(SemanticMemory::try_from).collect()
    }

    async fn link_memory_pattern(&self, id: &MemoryId, pattern: &PatternId) -> StorageResult<()> {
        let mut res = self
            .db
            .query(
                "UPDATE memories SET source_pattern_ids = array::union(source_pattern_ids, [$pid]) \
                 WHERE memory_id = $mid RETURN AFTER",
            )
            .bind(("pid", pattern.0.clone()))
            .bind(("mid", id.0.clone()))
            .await
            .map_err(db_err)?;
        let rows: Vec<MemoryRow> = res.take(0).map_err(db_err)?;
        if rows.is_empty() {
            return Err(StorageError::not_found("memory", id.as_str()));
        }
        Ok(())
    }

    #[instrument(skip(self, procedure), fields(signature = %procedure.step_signature_hash.short()))]
    async fn insert_procedure(
        &self,
        procedure: Procedure,
    ) -> StorageResult<InsertOutcome<ProcedureId>> {
        let id = procedure.id.clone();
        let namespace = procedure.namespace.clone();
        let signature = procedure.step_signature_hash.clone();
        let created: Result<Option<ProcedureRow>, _> = self
            .db
            .create("procedures")
            .content(ProcedureRow::from(procedure))
            .await;
        match created.map_err(db_err) {
            Ok(_) => Ok(InsertOutcome::Inserted(id)),
            Err(StorageError::UniqueViolation { key }) => {
                match self.fetch_procedure_by_signature(&namespace, &signature).await? {
                    Some(existing) => {
                        Ok(InsertOutcome::Existing(ProcedureId(existing.procedure_id)))
                    }
                    None => Err(StorageError::UniqueViolation { key }),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn find_procedure_by_signature(
        &self,
        namespace: &str,
        signature: &ContentDigest,
    ) -> StorageResult<Option<Procedure>> {
        self.fetch_procedure_by_signature(namespace, signature)
            .await?
            .map(Procedure::try_from)
            .transpose()
    }

    async fn get_procedure(&self, id: &ProcedureId) -> StorageResult<Procedure> {
        self.fetch_procedure("procedure_id", id.as_str())
            .await?
            .ok_or_else(|| StorageError::not_found("procedure", id.as_str()))
            .and_then(Procedure::try_from)
    }

    async fn list_procedures(&self, namespace: &str) -> StorageResult<Vec<Procedure>> {
        let mut res = self
            .db
            .query("SELECT * FROM procedures WHERE namespace = $ns ORDER BY created_at ASC")
            .bind(("ns", namespace.to_string()))
            .await
            .map_err(db_err)?;
        let rows: Vec<ProcedureRow> = res.take(0).map_err(db_err)?;
        rows.into_iter().map(Procedure::try_from).collect()
    }

    async fn link_procedure_pattern(
        &self,
        id: &ProcedureId,
        pattern: &PatternId,
    ) -> StorageResult<()> {
        let mut res = self
            .db
            .query(
                "UPDATE procedures SET source_pattern_ids = array::union(source_pattern_ids, [$pid]) \
                 WHERE procedure_id = $prid RETURN AFTER",
            )
            .bind(("pid", pattern.0.clone()))
            .bind(("prid", id.0.clone()))
            .await
            .map_err(db_err)?;
        let rows: Vec<ProcedureRow> = res.take(0).map_err(db_err)?;
        if rows.is_empty() {
            return Err(StorageError::not_found("procedure", id.as_str()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// EmbeddingStore
// ---------------------------------------------------------------------------

#[async_trait]
impl EmbeddingStore for SurrealStore {
    #[instrument(skip(self, record), fields(owner = %owner, model = %record.model_version))]
    async fn replace_embedding(
        &self,
        owner: &EmbeddingOwner,
        record: EmbeddingRecord,
    ) -> StorageResult<EmbeddingRecord> {
        let (table, id_field) = Self::owner_table(owner);
        let bump = match owner {
            EmbeddingOwner::Event(_) => ", version += 1",
            EmbeddingOwner::Memory(_) => "",
        };
        let sql = format!(
            "BEGIN TRANSACTION;\n\
             LET $prev = (SELECT VALUE embedding FROM {table} WHERE {id_field} = $oid);\n\
             IF array::len($prev) = 0 {{ THROW \"{OWNER_MISSING}\" }};\n\
             CREATE embedding_history CONTENT {{ owner_kind: $kind, owner_id: $oid, \
             embedding: $prev[0], archived_at: time::now() }};\n\
             UPDATE {table} SET embedding = $emb{bump} WHERE {id_field} = $oid;\n\
             COMMIT TRANSACTION;"
        );

        let res = self
            .db
            .query(sql)
            .bind(("oid", owner.id_str().to_string()))
            .bind(("kind", owner.kind().to_string()))
            .bind(("emb", DbEmbedding::from(record)))
            .await
            .map_err(db_err)?;
        res.check().map_err(|e| {
            if e.to_string().contains(OWNER_MISSING) {
                StorageError::not_found(owner.kind(), owner.id_str())
            } else {
                db_err(e)
            }
        })?;

        let mut res = self
            .db
            .query(
                "SELECT * FROM embedding_history WHERE owner_kind = $kind AND owner_id = $oid \
                 ORDER BY archived_at DESC LIMIT 1",
            )
            .bind(("kind", owner.kind().to_string()))
            .bind(("oid", owner.id_str().to_string()))
            .await
            .map_err(db_err)?;
        let rows: Vec<EmbeddingHistoryRow> = res.take(0).map_err(db_err)?;
        rows.into_iter()
            .next()
            .map(|r| r.embedding.into())
            .ok_or_else(|| StorageError::Backend(format!("history row missing for {owner}")))
    }

    async fn embedding_history(
        &self,
        owner: &EmbeddingOwner,
    ) -> StorageResult<Vec<EmbeddingRecord>> {
        let mut res = self
            .db
            .query(
                "SELECT * FROM embedding_history WHERE owner_kind = $kind AND owner_id = $oid \
                 ORDER BY archived_at ASC",
            )
            .bind(("kind", owner.kind().to_string()))
            .bind(("oid", owner.id_str().to_string()))
            .await
            .map_err(db_err)?;
        let rows: Vec<EmbeddingHistoryRow> = res.take(0).map_err(db_err)?;
        Ok(rows.into_iter().map(|r| r.embedding.into()).collect())
    }

    async fn list_embeddings(&self, namespace: &str) -> StorageResult<Vec<EmbeddingEntry>> {
        let events = self.list_live_events(namespace, None).await?;
        let memories = self.list_memories(namespace).await?;

        let mut out: Vec<EmbeddingEntry> = events
            .into_iter()
            .map(|e| EmbeddingEntry {
                owner: EmbeddingOwner::Event(e.id),
                content: e.content,
                embedding: e.embedding,
            })
            .chain(memories.into_iter().map(|m| EmbeddingEntry {
                owner: EmbeddingOwner::Memory(m.id),
                content: m.content,
                embedding: m.embedding,
            }))
            .collect();
        out.sort_by(|a, b| a.owner.cmp(&b.owner));
        Ok(out)
    }

    async fn get_embeddings(
        &self,
        owners: &[EmbeddingOwner],
    ) -> StorageResult<Vec<EmbeddingEntry>> {
        let mut out = Vec::with_capacity(owners.len());
        for owner in owners {
            let entry = match owner {
                EmbeddingOwner::Event(id) => {
                    let e = self.get_event(id).await?;
                    EmbeddingEntry {
                        owner: owner.clone(),
                        content: e.content,
                        embedding: e.embedding,
                    }
                }
                EmbeddingOwner::Memory(id) => {
                    let m = self.get_memory(id).await?;
                    EmbeddingEntry {
                        owner: owner.clone(),
                        content: m.content,
                        embedding: m.embedding,
                    }
                }
            };
            out.push(entry);
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// ConsolidationLocks
// ---------------------------------------------------------------------------

#[async_trait]
impl ConsolidationLocks for SurrealStore {
    #[instrument(skip(self))]
    async fn try_acquire(
        &self,
        scope_key: &str,
        owner: &str,
        ttl: Duration,
    ) -> StorageResult<Option<LockAcquisition>> {
        let mut res = self
            .db
            .query(
                "DELETE consolidation_locks WHERE scope_key = $k AND expires_at <= time::now() \
                 RETURN BEFORE",
            )
            .bind(("k", scope_key.to_string()))
            .await
            .map_err(db_err)?;
        let stale: Vec<LockRow> = res.take(0).map_err(db_err)?;

        let lease = LockLease::new(scope_key, owner, ttl);
        let created: Result<Option<LockRow>, _> = self
            .db
            .create("consolidation_locks")
            .content(LockRow::from(lease.clone()))
            .await;

        match created.map_err(db_err) {
            Ok(_) => Ok(Some(LockAcquisition {
                lease,
                reclaimed_from: stale.into_iter().next().map(|r| r.owner),
            })),
            Err(StorageError::UniqueViolation { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn renew(&self, scope_key: &str, owner: &str, ttl: Duration) -> StorageResult<bool> {
        let expires = SurrealDatetime::from(Utc::now() + ttl);
        let mut res = self
            .db
            .query(
                "UPDATE consolidation_locks SET expires_at = $exp \
                 WHERE scope_key = $k AND owner = $o RETURN AFTER",
            )
            .bind(("exp", expires))
            .bind(("k", scope_key.to_string()))
            .bind(("o", owner.to_string()))
            .await
            .map_err(db_err)?;
        let rows: Vec<LockRow> = res.take(0).map_err(db_err)?;
        Ok(!rows.is_empty())
    }

    async fn release(&self, scope_key: &str, owner: &str) -> StorageResult<bool> {
        let mut res = self
            .db
            .query("DELETE consolidation_locks WHERE scope_key = $k AND owner = $o RETURN BEFORE")
            .bind(("k", scope_key.to_string()))
            .bind(("o", owner.to_string()))
            .await
            .map_err(db_err)?;
        let rows: Vec<LockRow> = res.take(0).map_err(db_err)?;
        Ok(!rows.is_empty())
    }

    async fn current(&self, scope_key: &str) -> StorageResult<Option<LockLease>> {
        let mut res = self
            .db
            .query("SELECT * FROM consolidation_locks WHERE scope_key = $k")
            .bind(("k", scope_key.to_string()))
            .await
            .map_err(db_err)?;
        let rows: Vec<LockRow> = res.take(0).map_err(db_err)?;
        Ok(rows.into_iter().next().map(LockLease::from))
    }
}

// ---------------------------------------------------------------------------
// ReferenceIndex
// ---------------------------------------------------------------------------

#[async_trait]
impl ReferenceIndex for SurrealStore {
    async fn add_reference(&self, holder: &str, event: &EventId) -> StorageResult<()> {
        let row = ReferenceRow {
            id: None,
            holder: holder.to_string(),
            event_id: event.0.clone(),
        };
        let created: Result<Option<ReferenceRow>, _> =
            self.db.create("event_references").content(row).await;
        match created.map_err(db_err) {
            Ok(_) | Err(StorageError::UniqueViolation { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn references_to(&self, event: &EventId) -> StorageResult<Vec<String>> {
        let mut res = self
            .db
            .query("SELECT * FROM event_references WHERE event_id = $eid")
            .bind(("eid", event.0.clone()))
            .await
            .map_err(db_err)?;
        let rows: Vec<ReferenceRow> = res.take(0).map_err(db_err)?;
        let mut holders: Vec<String> = rows.into_iter().map(|r| r.holder).collect();
        holders.sort();
        Ok(holders)
    }

    async fn redirect_references(&self, from: &EventId, to: &EventId) -> StorageResult<usize> {
        let holders = self.references_to(from).await?;
        for holder in &holders {
            self.db
                .query("DELETE event_references WHERE holder = $h AND event_id = $eid")
                .bind(("h", holder.clone()))
                .bind(("eid", from.0.clone()))
                .await
                .map_err(db_err)?;
            self.add_reference(holder, to).await?;
        }
        Ok(holders.len())
    }
}
