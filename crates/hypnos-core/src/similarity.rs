//! Vector and composite event similarity.

use chrono::Duration;
use hypnos_state::EpisodicEvent;

use crate::config::SimilarityWeights;

/// Cosine similarity; 0 for mismatched lengths or zero vectors.
#[inline]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

/// Element-wise mean of equally sized vectors. Vectors of another length
/// than the first are skipped.
pub fn centroid<'a, I>(vectors: I) -> Vec<f32>
where
    I: IntoIterator<Item = &'a [f32]>,
{
    let mut iter = vectors.into_iter();
    let Some(first) = iter.next() else {
        return Vec::new();
    };
    let mut sum = first.to_vec();
    let mut n = 1usize;
    for v in iter {
        if v.len() != sum.len() {
            continue;
        }
        sum.iter_mut().zip(v).for_each(|(s, x)| *s += x);
        n += 1;
    }
    sum.iter_mut().for_each(|s| *s /= n as f32);
    sum
}

/// Mean cosine of each vector to the group centroid, clamped to [0, 1].
pub fn consistency(vectors: &[&[f32]]) -> f32 {
    if vectors.is_empty() {
        return 0.0;
    }
    let c = centroid(vectors.iter().copied());
    let mean = vectors
        .iter()
        .map(|v| cosine_similarity(v, &c).max(0.0))
        .sum::<f32>()
        / vectors.len() as f32;
    mean.clamp(0.0, 1.0)
}

/// 1 at gap 0, decaying linearly to 0 at `window`.
pub fn temporal_proximity(gap: Duration, window: Duration) -> f32 {
    let window_ms = window.num_milliseconds();
    if window_ms <= 0 {
        return 0.0;
    }
    let gap_ms = gap.num_milliseconds().abs();
    (1.0 - gap_ms as f64 / window_ms as f64).clamp(0.0, 1.0) as f32
}

/// Weighted composite of content, temporal and categorical signals.
#[derive(Debug, Clone)]
pub struct SimilarityScorer {
    weights: SimilarityWeights,
    window: Duration,
}

impl SimilarityScorer {
    pub fn new(weights: SimilarityWeights, window: Duration) -> Self {
        Self { weights, window }
    }

    /// Score in [0, 1]. A categorical signal only counts when both events
    /// carry a value, and the sum is normalised by the weights that applied.
    pub fn composite(&self, a: &EpisodicEvent, b: &EpisodicEvent) -> f32 {
        let w = &self.weights;
        let content = cosine_similarity(&a.embedding.vector, &b.embedding.vector).clamp(0.0, 1.0);
        let temporal = temporal_proximity(a.timestamp - b.timestamp, self.window);

        let mut total = w.content + w.temporal;
        let mut score = w.content * content + w.temporal * temporal;

        let mut categorical = |weight: f32, x: Option<&str>, y: Option<&str>| {
            if let (Some(x), Some(y)) = (x, y) {
                total += weight;
                if x == y {
                    score += weight;
                }
            }
        };
        categorical(
            w.event_type,
            non_empty(&a.event_type),
            non_empty(&b.event_type),
        );
        categorical(w.resource, a.resource.as_deref(), b.resource.as_deref());
        categorical(w.outcome, a.outcome.as_deref(), b.outcome.as_deref());

        if total <= 0.0 {
            return 0.0;
        }
        (score / total).clamp(0.0, 1.0)
    }
}

fn non_empty(s: &str) -> Option<&str> {
    (!s.is_empty()).then_some(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use hypnos_state::EmbeddingRecord;

    fn ev(vector: Vec<f32>, secs: i64) -> EpisodicEvent {
        let base = Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap();
        EpisodicEvent::new("ns", "s", "tool_call", "x", EmbeddingRecord::new(vector, "v1"))
            .at(base + Duration::seconds(secs))
    }

    #[test]
    fn cosine_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn temporal_decays_linearly() {
        let w = Duration::minutes(10);
        assert_eq!(temporal_proximity(Duration::zero(), w), 1.0);
        assert!((temporal_proximity(Duration::minutes(5), w) - 0.5).abs() < 1e-6);
        assert_eq!(temporal_proximity(Duration::minutes(20), w), 0.0);
        assert!((temporal_proximity(Duration::minutes(-5), w) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn consistency_of_identical_vectors_is_one() {
        let v: Vec<f32> = vec![0.3, 0.4];
        assert!((consistency(&[&v, &v, &v]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn categorical_signal_ignored_when_missing() {
        let scorer = SimilarityScorer::new(SimilarityWeights::default(), Duration::minutes(10));
        let a = ev(vec![1.0, 0.0], 0);
        let b = ev(vec![1.0, 0.0], 0);
        // Identical content, zero gap, same type, no resource/outcome on either.
        assert!((scorer.composite(&a, &b) - 1.0).abs() < 1e-6);

        let a = a.with_resource("src/main.rs");
        let b = b.with_resource("src/lib.rs");
        let s = scorer.composite(&a, &b);
        assert!(s < 1.0 && s > 0.9);
    }

    #[test]
    fn composite_stays_in_unit_interval() {
        let scorer = SimilarityScorer::new(SimilarityWeights::default(), Duration::minutes(10));
        let a = ev(vec![1.0, 0.0], 0).with_outcome("success");
        let b = ev(vec![-1.0, 0.0], 3600).with_outcome("failure");
        assert_eq!(scorer.composite(&a, &b), 0.0);
    }
}
