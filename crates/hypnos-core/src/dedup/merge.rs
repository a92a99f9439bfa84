use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use hypnos_state::{EpisodicEvent, EventId, MergeCommit, StorageError, VersionedId};
use tracing::{debug, instrument, warn};

use super::{DedupManager, KeepPolicy, MergeResult};
use crate::error::{EngineError, EngineResult};
use crate::metrics::METRICS;
use crate::obs;

const FIELDS_UNIONED: [&str; 2] = ["importance_score", "tags"];

/// Pick the survivor among `candidates` under `policy`. `None` only when
/// `candidates` is empty or an explicit id is not among them.
pub(crate) fn choose_survivor<'a>(
    candidates: &[&'a EpisodicEvent],
    policy: &KeepPolicy,
) -> Option<&'a EpisodicEvent> {
    if let KeepPolicy::Explicit(id) = policy {
        return candidates.iter().copied().find(|e| &e.id == id);
    }
    candidates
        .iter()
        .copied()
        .min_by(|a, b| survivor_order(policy, a, b))
}

/// `Less` means `a` is the better survivor.
fn survivor_order(policy: &KeepPolicy, a: &EpisodicEvent, b: &EpisodicEvent) -> Ordering {
    let by_time = a.timestamp.cmp(&b.timestamp);
    let by_importance = b.importance_score.total_cmp(&a.importance_score);
    let by_id = a.id.cmp(&b.id);
    match policy {
        KeepPolicy::Earliest | KeepPolicy::Explicit(_) => {
            by_time.then(by_importance).then(by_id)
        }
        KeepPolicy::MostImportant => by_importance.then(by_time).then(by_id),
        KeepPolicy::Latest => by_time.reverse().then(by_importance).then(by_id),
    }
}

/// What a fresh read of a merge group calls for.
enum MergePlan {
    /// Every member already resolves to this canonical.
    Settled(EventId),
    /// A canonical was demoted between our reads; read again.
    Stale(EventId),
    Commit {
        survivor: EventId,
        commit: MergeCommit,
        demoted: Vec<EventId>,
    },
}

impl DedupManager {
    /// Merge the events named in `group_ids` into one canonical event.
    ///
    /// Members that were merged before are resolved to their canonical
    /// first. Re-running a completed merge writes no events and returns the
    /// same result; it does re-point any references still held by merged
    /// members, so a merge whose redirect step failed is finished by a retry.
    #[instrument(skip(self, group_ids, keep_policy), fields(members = group_ids.len(), policy = %keep_policy))]
    pub async fn merge(&self, group_ids: &[EventId], keep_policy: &KeepPolicy) -> EngineResult<MergeResult> {
        if group_ids.is_empty() {
            return Err(EngineError::validation("merge group must not be empty"));
        }
        let mut unique: Vec<EventId> = group_ids.to_vec();
        unique.sort();
        unique.dedup();

        let attempts = self.config.max_merge_attempts.max(1);
        for attempt in 1..=attempts {
            let (survivor, commit, demoted) = match self.plan(&unique, keep_policy).await? {
                MergePlan::Commit {
                    survivor,
                    commit,
                    demoted,
                } => (survivor, commit, demoted),
                MergePlan::Stale(id) => {
                    debug!(attempt, demoted = %id, "canonical moved while planning, re-reading");
                    continue;
                }
                MergePlan::Settled(root) => {
                    let children: Vec<EventId> = self
                        .store
                        .list_merged_into(&root)
                        .await
                        .map_err(EngineError::from_storage)?
                        .into_iter()
                        .map(|e| e.id)
                        .collect();
                    let stranded = self.redirect_all(&children, &root).await?;
                    if stranded > 0 {
                        warn!(canonical = %root, stranded, "re-pointed references left by an earlier merge");
                    }
                    return self.result_for(&root).await;
                }
            };

            match self.store.commit_merge(commit).await {
                Ok(()) => {
                    let redirected = self.redirect_all(&demoted, &survivor).await?;
                    METRICS.inc_merges();
                    let result = self.result_for(&survivor).await?;
                    obs::emit_dedup_merged(survivor.as_str(), result.merged_count, redirected);
                    return Ok(result);
                }
                Err(StorageError::VersionConflict { id }) => {
                    debug!(attempt, conflicting = %id, "merge raced a concurrent writer, re-reading");
                }
                Err(e) => return Err(EngineError::from_storage(e)),
            }
        }

        warn!(attempts, "merge did not converge");
        Err(EngineError::Consistency(format!(
            "merge of {} events did not converge after {attempts} attempts",
            unique.len()
        )))
    }

    /// Read the group fresh and build the commit.
    async fn plan(&self, ids: &[EventId], keep_policy: &KeepPolicy) -> EngineResult<MergePlan> {
        let members = self
            .store
            .get_events(ids)
            .await
            .map_err(EngineError::from_storage)?;

        let root_ids: BTreeSet<EventId> = members
            .iter()
            .map(|e| e.canonical_id.clone().unwrap_or_else(|| e.id.clone()))
            .collect();
        let root_ids: Vec<EventId> = root_ids.into_iter().collect();
        let roots = self
            .store
            .get_events(&root_ids)
            .await
            .map_err(EngineError::from_storage)?;

        if let Some(moved) = roots.iter().find(|r| r.is_merged()) {
            return Ok(MergePlan::Stale(moved.id.clone()));
        }

        let namespaces: BTreeSet<&str> = roots.iter().map(|r| r.namespace.as_str()).collect();
        if namespaces.len() > 1 {
            return Err(EngineError::validation("merge group spans several namespaces"));
        }
        let sessions: BTreeSet<&str> = roots.iter().map(|r| r.session_id.as_str()).collect();
        if sessions.len() > 1 && !self.config.allow_cross_session {
            return Err(EngineError::validation(
                "merge group spans several sessions; enable dedup.allow_cross_session to allow it",
            ));
        }

        let policy = match keep_policy {
            KeepPolicy::Explicit(id) => {
                let chosen = members
                    .iter()
                    .chain(roots.iter())
                    .find(|e| &e.id == id)
                    .ok_or_else(|| {
                        EngineError::validation(format!("explicit survivor {id} is not in the group"))
                    })?;
                KeepPolicy::Explicit(chosen.canonical_id.clone().unwrap_or_else(|| chosen.id.clone()))
            }
            other => other.clone(),
        };

        if roots.len() == 1 {
            if let KeepPolicy::Explicit(id) = &policy {
                if id != &roots[0].id {
                    return Err(EngineError::validation(format!(
                        "group is already merged into {}",
                        roots[0].id
                    )));
                }
            }
            return Ok(MergePlan::Settled(roots[0].id.clone()));
        }

        let candidates: Vec<&EpisodicEvent> = roots.iter().collect();
        let survivor = choose_survivor(&candidates, &policy)
            .ok_or_else(|| EngineError::Consistency("no survivor could be chosen".into()))?;

        let mut tags: BTreeSet<String> = BTreeSet::new();
        let mut importance = 0.0f32;
        for e in members.iter().chain(roots.iter()) {
            tags.extend(e.tags.iter().cloned());
            importance = importance.max(e.importance_score);
        }

        // Demoted canonicals and their children, keyed to dedup.
        let mut to_point: BTreeMap<EventId, u64> = BTreeMap::new();
        let mut demoted = Vec::new();
        for root in roots.iter().filter(|r| r.id != survivor.id) {
            to_point.insert(root.id.clone(), root.version);
            demoted.push(root.id.clone());
            let children = self
                .store
                .list_merged_into(&root.id)
                .await
                .map_err(EngineError::from_storage)?;
            for child in children {
                demoted.push(child.id.clone());
                to_point.insert(child.id, child.version);
            }
        }

        let commit = MergeCommit {
            canonical: VersionedId {
                event_id: survivor.id.clone(),
                version: survivor.version,
            },
            tags,
            importance_score: importance.clamp(0.0, 1.0),
            merged: to_point
                .into_iter()
                .map(|(event_id, version)| VersionedId { event_id, version })
                .collect(),
        };
        Ok(MergePlan::Commit {
            survivor: survivor.id.clone(),
            commit,
            demoted,
        })
    }

    async fn redirect_all(&self, from: &[EventId], to: &EventId) -> EngineResult<usize> {
        let mut moved = 0;
        for id in from {
            moved += self
                .store
                .redirect_references(id, to)
                .await
                .map_err(EngineError::from_storage)?;
        }
        Ok(moved)
    }

    async fn result_for(&self, canonical: &EventId) -> EngineResult<MergeResult> {
        let event = self
            .store
            .get_event(canonical)
            .await
            .map_err(EngineError::from_storage)?;
        let merged = self
            .store
            .list_merged_into(canonical)
            .await
            .map_err(EngineError::from_storage)?;
        Ok(MergeResult {
            canonical_id: event.id,
            merged_count: merged.len(),
            fields_unioned: FIELDS_UNIONED.iter().map(|s| s.to_string()).collect(),
            tags: event.tags,
            importance_score: event.importance_score,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use hypnos_state::EmbeddingRecord;

    fn ev(id: &str, minutes: i64, importance: f32) -> EpisodicEvent {
        let base = Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap();
        EpisodicEvent::new("ns", "s", "note", id, EmbeddingRecord::new(vec![1.0], "v1"))
            .with_id(id)
            .at(base + Duration::minutes(minutes))
            .with_importance(importance)
    }

    #[test]
    fn survivor_policies() {
        let a = ev("a", 0, 0.2);
        let b = ev("b", 0, 0.9);
        let c = ev("c", 5, 0.5);
        let all = [&a, &b, &c];
        // Tie on time goes to higher importance.
        assert_eq!(choose_survivor(&all, &KeepPolicy::Earliest).unwrap().id.as_str(), "b");
        assert_eq!(choose_survivor(&all, &KeepPolicy::MostImportant).unwrap().id.as_str(), "b");
        assert_eq!(choose_survivor(&all, &KeepPolicy::Latest).unwrap().id.as_str(), "c");
        assert_eq!(
            choose_survivor(&all, &KeepPolicy::Explicit(EventId::from("a"))).unwrap().id.as_str(),
            "a"
        );
        assert!(choose_survivor(&all, &KeepPolicy::Explicit(EventId::from("x"))).is_none());
    }
}
