//! System 1: fast, deterministic pattern extraction over one cluster.
//!
//! Output depends only on `(cluster, now, config)`. Nothing here touches
//! the store or a provider.

use chrono::{DateTime, Utc};
use hypnos_state::EpisodicEvent;

use super::{Pattern, PatternType};
use crate::cluster::{Cluster, UnionFind};
use crate::config::ConsolidationConfig;
use crate::similarity::{consistency, cosine_similarity};
use crate::synthesis::normalize_content;

const W_SIZE: f32 = 0.4;
const W_CONSISTENCY: f32 = 0.4;
const W_RECENCY: f32 = 0.2;

/// Extract Frequency, Temporal and Discovery candidates from `cluster`, in
/// that order.
pub fn extract_patterns(
    cluster: &Cluster,
    now: DateTime<Utc>,
    config: &ConsolidationConfig,
) -> Vec<Pattern> {
    let mut out = Vec::new();
    let members: Vec<&EpisodicEvent> = cluster.events.iter().collect();
    if members.is_empty() {
        return out;
    }

    for group in frequency_groups(&members, config.near_identical_similarity) {
        if group.len() < config.min_frequency {
            continue;
        }
        let size = size_component(group.len(), config.size_saturation);
        let confidence = score(size, &group, now, config.recency_half_life_days);
        let content = format!("Recurring {}: {}", cluster.event_type, group[0].content.trim());
        out.push(build(PatternType::Frequency, cluster, &group, confidence, content, now));
    }

    if members.len() >= config.min_sequence_events {
        let steps = ordered_steps(&members);
        if distinct_steps(&steps) >= 2 {
            let size = size_component(members.len(), config.size_saturation);
            let confidence = score(size, &members, now, config.recency_half_life_days);
            let content = format!("Sequence {}: {}", cluster.event_type, steps.join(" -> "));
            out.push(build(PatternType::Temporal, cluster, &members, confidence, content, now));
        }
    }

    let tagged: Vec<&EpisodicEvent> = members
        .iter()
        .copied()
        .filter(|e| config.discovery_tags.iter().any(|t| e.tags.contains(t)))
        .collect();
    if !tagged.is_empty() {
        let lead = tagged
            .iter()
            .copied()
            .max_by(|a, b| a.importance_score.total_cmp(&b.importance_score))
            .unwrap_or(tagged[0]);
        let importance = lead.importance_score.clamp(0.0, 1.0);
        let confidence = score(importance, &tagged, now, config.recency_half_life_days);
        let content = format!("Discovery in {}: {}", cluster.event_type, lead.content.trim());
        let mut pattern = build(PatternType::Discovery, cluster, &tagged, confidence, content, now);
        pattern.steps.clear();
        out.push(pattern);
    }

    out
}

fn build(
    pattern_type: PatternType,
    cluster: &Cluster,
    sources: &[&EpisodicEvent],
    confidence: f32,
    content: String,
    now: DateTime<Utc>,
) -> Pattern {
    let source_event_ids: Vec<_> = sources.iter().map(|e| e.id.clone()).collect();
    Pattern {
        id: Pattern::derive_id(pattern_type, &source_event_ids),
        pattern_type,
        event_type: cluster.event_type.clone(),
        source_event_ids,
        confidence,
        content,
        steps: ordered_steps(sources),
        validated: false,
        created_at: now,
    }
}

/// Union members whose normalised text matches or whose embeddings are
/// near-identical. Groups keep timestamp order.
fn frequency_groups<'a>(members: &[&'a EpisodicEvent], near_identical: f32) -> Vec<Vec<&'a EpisodicEvent>> {
    let normalised: Vec<String> = members.iter().map(|e| normalize_content(&e.content)).collect();
    let mut uf = UnionFind::new(members.len());
    for i in 0..members.len() {
        for j in (i + 1)..members.len() {
            let same_text = !normalised[i].is_empty() && normalised[i] == normalised[j];
            if same_text
                || cosine_similarity(&members[i].embedding.vector, &members[j].embedding.vector)
                    >= near_identical
            {
                uf.union(i, j);
            }
        }
    }
    uf.groups()
        .into_iter()
        .map(|g| g.into_iter().map(|i| members[i]).collect())
        .collect()
}

/// Member contents in timestamp order with consecutive repeats collapsed.
pub(crate) fn ordered_steps(members: &[&EpisodicEvent]) -> Vec<String> {
    let mut steps: Vec<String> = Vec::new();
    let mut last: Option<String> = None;
    for e in members {
        let norm = normalize_content(&e.content);
        if norm.is_empty() || last.as_deref() == Some(norm.as_str()) {
            continue;
        }
        steps.push(e.content.trim().to_string());
        last = Some(norm);
    }
    steps
}

fn distinct_steps(steps: &[String]) -> usize {
    let mut seen: Vec<String> = steps.iter().map(|s| normalize_content(s)).collect();
    seen.sort_unstable();
    seen.dedup();
    seen.len()
}

fn size_component(n: usize, saturation: usize) -> f32 {
    (n as f32 / saturation.max(1) as f32).min(1.0)
}

fn score(first: f32, members: &[&EpisodicEvent], now: DateTime<Utc>, half_life_days: f64) -> f32 {
    let vectors: Vec<&[f32]> = members.iter().map(|e| e.embedding.vector.as_slice()).collect();
    let newest = members.iter().map(|e| e.timestamp).max().unwrap_or(now);
    let value =
        W_SIZE * first + W_CONSISTENCY * consistency(&vectors) + W_RECENCY * recency(newest, now, half_life_days);
    value.clamp(0.0, 1.0)
}

fn recency(newest: DateTime<Utc>, now: DateTime<Utc>, half_life_days: f64) -> f32 {
    let age_days = (now - newest).num_seconds().max(0) as f64 / 86_400.0;
    (-age_days / half_life_days).exp() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use hypnos_state::EmbeddingRecord;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn ev(content: &str, vector: Vec<f32>, secs_ago: i64) -> EpisodicEvent {
        EpisodicEvent::new("ns", "s", "tool_call", content, EmbeddingRecord::new(vector, "v1"))
            .at(now() - Duration::seconds(secs_ago))
    }

    fn cluster(events: Vec<EpisodicEvent>) -> Cluster {
        let mut events = events;
        events.sort_by_key(|e| e.timestamp);
        Cluster {
            event_type: "tool_call".into(),
            events,
        }
    }

    #[test]
    fn repeated_content_is_a_frequency_pattern() {
        let c = cluster(
            (0..5)
                .map(|i| ev("Run cargo fmt", vec![1.0, 0.0], 100 - i))
                .collect(),
        );
        let patterns = extract_patterns(&c, now(), &ConsolidationConfig::default());
        assert_eq!(patterns.len(), 1);
        let p = &patterns[0];
        assert_eq!(p.pattern_type, PatternType::Frequency);
        assert_eq!(p.source_event_ids.len(), 5);
        // size 0.5, consistency 1, recency ~1
        assert!((p.confidence - 0.8).abs() < 0.01, "got {}", p.confidence);
    }

    #[test]
    fn ordered_distinct_steps_form_a_temporal_pattern() {
        let c = cluster(vec![
            ev("git pull", vec![1.0, 0.0, 0.0], 30),
            ev("cargo build", vec![0.0, 1.0, 0.0], 20),
            ev("cargo test", vec![0.0, 0.0, 1.0], 10),
        ]);
        let patterns = extract_patterns(&c, now(), &ConsolidationConfig::default());
        assert_eq!(patterns.len(), 1);
        let p = &patterns[0];
        assert_eq!(p.pattern_type, PatternType::Temporal);
        assert_eq!(p.steps, vec!["git pull", "cargo build", "cargo test"]);
        assert!(p.content.contains("git pull -> cargo build -> cargo test"));
    }

    #[test]
    fn tagged_events_yield_one_discovery() {
        let c = cluster(vec![
            ev("found the leak", vec![1.0, 0.0], 20)
                .with_tags(["insight"])
                .with_importance(0.9),
            ev("found the leak again", vec![0.9, 0.1], 10).with_tags(["breakthrough"]),
        ]);
        let patterns = extract_patterns(&c, now(), &ConsolidationConfig::default());
        let discovery: Vec<_> = patterns
            .iter()
            .filter(|p| p.pattern_type == PatternType::Discovery)
            .collect();
        assert_eq!(discovery.len(), 1);
        assert!(discovery[0].content.ends_with("found the leak"));
        assert!(discovery[0].steps.is_empty());
    }

    #[test]
    fn old_clusters_lose_confidence() {
        let fresh = cluster((0..3).map(|i| ev("same", vec![1.0], i)).collect());
        let stale = cluster((0..3).map(|i| ev("same", vec![1.0], 30 * 86_400 + i)).collect());
        let cfg = ConsolidationConfig::default();
        let a = extract_patterns(&fresh, now(), &cfg)[0].confidence;
        let b = extract_patterns(&stale, now(), &cfg)[0].confidence;
        assert!(a > b);
    }

    #[test]
    fn extraction_is_deterministic() {
        let c = cluster(vec![
            ev("a", vec![1.0, 0.0], 3),
            ev("b", vec![0.0, 1.0], 2),
            ev("a", vec![1.0, 0.0], 1),
        ]);
        let cfg = ConsolidationConfig::default();
        assert_eq!(extract_patterns(&c, now(), &cfg), extract_patterns(&c, now(), &cfg));
    }
}
