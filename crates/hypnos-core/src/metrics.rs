//! Global atomic counters for Hypnos.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (the orchestrator does so at the end of a run).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    events_consolidated: AtomicU64,
    patterns_accepted: AtomicU64,
    patterns_rejected: AtomicU64,
    validator_timeouts: AtomicU64,
    memories_created: AtomicU64,
    merges: AtomicU64,
    embeddings_refreshed: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            events_consolidated: AtomicU64::new(0),
            patterns_accepted: AtomicU64::new(0),
            patterns_rejected: AtomicU64::new(0),
            validator_timeouts: AtomicU64::new(0),
            memories_created: AtomicU64::new(0),
            merges: AtomicU64::new(0),
            embeddings_refreshed: AtomicU64::new(0),
        }
    }

    pub fn add_events_consolidated(&self, n: u64) {
        self.events_consolidated.fetch_add(n, Ordering::Relaxed);
        tracing::trace!(metric = "events_consolidated", n, "counter incremented");
    }

    pub fn inc_patterns_accepted(&self) {
        self.patterns_accepted.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "patterns_accepted", "counter incremented");
    }

    pub fn inc_patterns_rejected(&self) {
        self.patterns_rejected.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "patterns_rejected", "counter incremented");
    }

    pub fn inc_validator_timeouts(&self) {
        self.validator_timeouts.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "validator_timeouts", "counter incremented");
    }

    pub fn inc_memories_created(&self) {
        self.memories_created.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "memories_created", "counter incremented");
    }

    pub fn inc_merges(&self) {
        self.merges.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "merges", "counter incremented");
    }

    pub fn add_embeddings_refreshed(&self, n: u64) {
        self.embeddings_refreshed.fetch_add(n, Ordering::Relaxed);
        tracing::trace!(metric = "embeddings_refreshed", n, "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            events_consolidated = self.events_consolidated(),
            patterns_accepted = self.patterns_accepted(),
            patterns_rejected = self.patterns_rejected(),
            validator_timeouts = self.validator_timeouts(),
            memories_created = self.memories_created(),
            merges = self.merges(),
            embeddings_refreshed = self.embeddings_refreshed(),
        );
    }

    pub fn events_consolidated(&self) -> u64 {
        self.events_consolidated.load(Ordering::Relaxed)
    }

    pub fn patterns_accepted(&self) -> u64 {
        self.patterns_accepted.load(Ordering::Relaxed)
    }

    pub fn patterns_rejected(&self) -> u64 {
        self.patterns_rejected.load(Ordering::Relaxed)
    }

    pub fn validator_timeouts(&self) -> u64 {
        self.validator_timeouts.load(Ordering::Relaxed)
    }

    pub fn memories_created(&self) -> u64 {
        self.memories_created.load(Ordering::Relaxed)
    }

    pub fn merges(&self) -> u64 {
        self.merges.load(Ordering::Relaxed)
    }

    pub fn embeddings_refreshed(&self) -> u64 {
        self.embeddings_refreshed.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.events_consolidated,
            &self.patterns_accepted,
            &self.patterns_rejected,
            &self.validator_timeouts,
            &self.memories_created,
            &self.merges,
            &self.embeddings_refreshed,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        m.add_events_consolidated(40);
        m.add_events_consolidated(2);
        assert_eq!(m.events_consolidated(), 42);

        m.inc_patterns_accepted();
        m.inc_patterns_rejected();
        m.inc_patterns_rejected();
        assert_eq!(m.patterns_accepted(), 1);
        assert_eq!(m.patterns_rejected(), 2);

        m.inc_validator_timeouts();
        m.inc_merges();
        m.add_embeddings_refreshed(5);
        assert_eq!(m.validator_timeouts(), 1);
        assert_eq!(m.merges(), 1);
        assert_eq!(m.embeddings_refreshed(), 5);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.add_events_consolidated(3);
        m.inc_memories_created();
        m.inc_merges();
        m.reset();
        assert_eq!(m.events_consolidated(), 0);
        assert_eq!(m.memories_created(), 0);
        assert_eq!(m.merges(), 0);
    }
}
