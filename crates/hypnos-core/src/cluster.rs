//! Grouping primitives: union-find for transitive duplicate grouping, and
//! type-then-gap clustering for consolidation passes.

use std::collections::BTreeMap;

use chrono::Duration;
use hypnos_state::{EpisodicEvent, EventId};

/// Disjoint-set forest with path compression and union by size.
#[derive(Debug, Clone)]
pub struct UnionFind {
    parent: Vec<usize>,
    size: Vec<usize>,
}

impl UnionFind {
    pub fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            size: vec![1; n],
        }
    }

    pub fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut cur = x;
        while self.parent[cur] != root {
            let next = self.parent[cur];
            self.parent[cur] = root;
            cur = next;
        }
        root
    }

    pub fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        let (big, small) = if self.size[ra] >= self.size[rb] {
            (ra, rb)
        } else {
            (rb, ra)
        };
        self.parent[small] = big;
        self.size[big] += self.size[small];
    }

    /// Sets with more than one member, each as ascending indices, ordered by
    /// their smallest index.
    pub fn groups(&mut self) -> Vec<Vec<usize>> {
        let mut by_root: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for i in 0..self.parent.len() {
            let r = self.find(i);
            by_root.entry(r).or_default().push(i);
        }
        let mut groups: Vec<Vec<usize>> = by_root.into_values().filter(|g| g.len() > 1).collect();
        groups.sort_by_key(|g| g[0]);
        groups
    }
}

/// Events of one type that occurred close together.
#[derive(Debug, Clone)]
pub struct Cluster {
    pub event_type: String,
    /// Members in timestamp order.
    pub events: Vec<EpisodicEvent>,
}

impl Cluster {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn event_ids(&self) -> Vec<EventId> {
        self.events.iter().map(|e| e.id.clone()).collect()
    }

    /// Stable label for logs and failure reports.
    pub fn label(&self) -> String {
        match self.events.first() {
            Some(first) => format!("{}@{}", self.event_type, first.id),
            None => self.event_type.clone(),
        }
    }
}

/// Group by event type, then split each type's timeline wherever two
/// consecutive events are more than `gap` apart.
///
/// Output is ordered by event type, then by time.
pub fn cluster_events(events: Vec<EpisodicEvent>, gap: Duration) -> Vec<Cluster> {
    let mut by_type: BTreeMap<String, Vec<EpisodicEvent>> = BTreeMap::new();
    for e in events {
        by_type.entry(e.event_type.clone()).or_default().push(e);
    }

    let mut clusters = Vec::new();
    for (event_type, mut members) in by_type {
        members.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));

        let mut current: Vec<EpisodicEvent> = Vec::new();
        for e in members {
            let split = current
                .last()
                .map_or(false, |prev| e.timestamp - prev.timestamp > gap);
            if split {
                clusters.push(Cluster {
                    event_type: event_type.clone(),
                    events: std::mem::take(&mut current),
                });
            }
            current.push(e);
        }
        if !current.is_empty() {
            clusters.push(Cluster {
                event_type,
                events: current,
            });
        }
    }
    clusters
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use hypnos_state::EmbeddingRecord;

    fn ev(kind: &str, minutes: i64) -> EpisodicEvent {
        let base = Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap();
        EpisodicEvent::new("ns", "s", kind, "x", EmbeddingRecord::new(vec![1.0], "v1"))
            .at(base + Duration::minutes(minutes))
    }

    #[test]
    fn union_find_groups_transitively() {
        let mut uf = UnionFind::new(5);
        uf.union(0, 1);
        uf.union(3, 1);
        assert_eq!(uf.groups(), vec![vec![0, 1, 3]]);
        assert_eq!(uf.find(3), uf.find(0));
        assert_ne!(uf.find(2), uf.find(0));
    }

    #[test]
    fn splits_on_gap_and_type() {
        let events = vec![
            ev("edit", 0),
            ev("edit", 3),
            ev("edit", 20),
            ev("search", 1),
        ];
        let clusters = cluster_events(events, Duration::minutes(5));
        let shape: Vec<(String, usize)> = clusters
            .iter()
            .map(|c| (c.event_type.clone(), c.len()))
            .collect();
        assert_eq!(
            shape,
            vec![
                ("edit".to_string(), 2),
                ("edit".to_string(), 1),
                ("search".to_string(), 1)
            ]
        );
    }

    #[test]
    fn gap_exactly_at_threshold_stays_together() {
        let clusters = cluster_events(vec![ev("edit", 0), ev("edit", 5)], Duration::minutes(5));
        assert_eq!(clusters.len(), 1);
    }
}
