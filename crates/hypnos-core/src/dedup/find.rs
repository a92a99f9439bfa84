use std::collections::BTreeMap;

use chrono::Duration;
use hypnos_state::EpisodicEvent;
use tracing::{debug, instrument};

use super::{DedupManager, DuplicateGroup, KeepPolicy, PairScore};
use crate::cluster::UnionFind;
use crate::config::MAX_SPAN_SECS;
use crate::error::{EngineError, EngineResult};
use crate::scope::Scope;
use crate::similarity::SimilarityScorer;

impl DedupManager {
    /// Group live events in `scope` whose composite similarity reaches
    /// `threshold` within `window` of each other.
    ///
    /// Groups come back ordered by their earliest member.
    #[instrument(skip(self), fields(scope = %scope))]
    pub async fn find_duplicates(
        &self,
        scope: &Scope,
        threshold: f32,
        window: Duration,
    ) -> EngineResult<Vec<DuplicateGroup>> {
        scope.validate()?;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(EngineError::validation(format!(
                "similarity threshold must be in (0, 1], got {threshold}"
            )));
        }
        if window <= Duration::zero() || window.num_seconds() > MAX_SPAN_SECS {
            return Err(EngineError::validation(format!(
                "time window must be between 1 and {MAX_SPAN_SECS} seconds"
            )));
        }

        let events = self
            .store
            .list_live_events(&scope.namespace, scope.session_id.as_deref())
            .await
            .map_err(EngineError::from_storage)?;

        let groups = group_duplicates(
            &events,
            &SimilarityScorer::new(self.weights.clone(), window),
            threshold,
            window,
            self.config.allow_cross_session,
        );
        debug!(events = events.len(), groups = groups.len(), "duplicate scan finished");
        Ok(groups)
    }
}

/// Pure grouping step, kept separate so it can be exercised without a store.
pub(crate) fn group_duplicates(
    events: &[EpisodicEvent],
    scorer: &SimilarityScorer,
    threshold: f32,
    window: Duration,
    cross_session: bool,
) -> Vec<DuplicateGroup> {
    let mut order: Vec<usize> = (0..events.len()).collect();
    order.sort_by(|&a, &b| {
        events[a]
            .timestamp
            .cmp(&events[b].timestamp)
            .then_with(|| events[a].id.cmp(&events[b].id))
    });

    // Partition by session unless cross-session matching is on.
    let mut partitions: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for &i in &order {
        let key = if cross_session { "" } else { events[i].session_id.as_str() };
        partitions.entry(key).or_default().push(i);
    }

    let mut uf = UnionFind::new(events.len());
    let mut pairs: Vec<(usize, usize, f32)> = Vec::new();
    for members in partitions.values() {
        for (pos, &i) in members.iter().enumerate() {
            for &j in &members[pos + 1..] {
                // Members are time-ordered, so nothing later can be in range.
                if events[j].timestamp - events[i].timestamp > window {
                    break;
                }
                let score = scorer.composite(&events[i], &events[j]);
                if score >= threshold {
                    uf.union(i, j);
                    pairs.push((i, j, score));
                }
            }
        }
    }

    let mut groups: Vec<DuplicateGroup> = uf
        .groups()
        .into_iter()
        .map(|mut members| {
            members.sort_by(|&a, &b| {
                events[a]
                    .timestamp
                    .cmp(&events[b].timestamp)
                    .then_with(|| events[a].id.cmp(&events[b].id))
            });
            let scores = pairs
                .iter()
                .filter(|(a, _, _)| members.contains(a))
                .map(|&(a, b, score)| PairScore {
                    a: events[a].id.clone(),
                    b: events[b].id.clone(),
                    score,
                })
                .collect();
            let member_events: Vec<&EpisodicEvent> = members.iter().map(|&i| &events[i]).collect();
            let canonical_id = super::merge::choose_survivor(&member_events, &KeepPolicy::Earliest)
                .map(|e| e.id.clone())
                .unwrap_or_else(|| events[members[0]].id.clone());
            DuplicateGroup {
                event_ids: members.iter().map(|&i| events[i].id.clone()).collect(),
                scores,
                canonical_id,
            }
        })
        .collect();

    groups.sort_by(|a, b| {
        let first = |g: &DuplicateGroup| {
            events
                .iter()
                .find(|e| g.event_ids.first() == Some(&e.id))
                .map(|e| e.timestamp)
        };
        first(a).cmp(&first(b)).then_with(|| a.event_ids.cmp(&b.event_ids))
    });
    groups
}
