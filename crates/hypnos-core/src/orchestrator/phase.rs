//! Consolidation state machine.

use std::fmt;

use serde::Serialize;

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsolidationPhase {
    Idle,
    Selecting,
    Clustering,
    Extracting,
    Validating,
    Synthesizing,
    Finalizing,
    Failed,
}

impl ConsolidationPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            ConsolidationPhase::Idle => "idle",
            ConsolidationPhase::Selecting => "selecting",
            ConsolidationPhase::Clustering => "clustering",
            ConsolidationPhase::Extracting => "extracting",
            ConsolidationPhase::Validating => "validating",
            ConsolidationPhase::Synthesizing => "synthesizing",
            ConsolidationPhase::Finalizing => "finalizing",
            ConsolidationPhase::Failed => "failed",
        }
    }

    /// Synthesizing and Finalizing alternate once per cluster, so finalised
    /// clusters are checkpointed before the next one starts.
    pub fn can_transition_to(self, next: ConsolidationPhase) -> bool {
        use ConsolidationPhase::*;
        match (self, next) {
            (Idle, Selecting)
            | (Selecting, Clustering)
            | (Clustering, Extracting)
            | (Extracting, Validating)
            | (Validating, Synthesizing)
            | (Synthesizing, Finalizing)
            | (Finalizing, Synthesizing)
            | (Finalizing, Idle)
            | (Failed, Idle) => true,
            // Nothing selected, or everything cancelled before synthesis.
            (Selecting, Idle) | (Validating, Idle) | (Clustering, Idle) => true,
            (from, Failed) => from != Idle && from != Failed,
            _ => false,
        }
    }
}

impl fmt::Display for ConsolidationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks the current phase of one run and refuses illegal moves.
#[derive(Debug)]
pub struct PhaseTracker {
    current: ConsolidationPhase,
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self {
            current: ConsolidationPhase::Idle,
        }
    }

    pub fn current(&self) -> ConsolidationPhase {
        self.current
    }

    /// Move to `next`, returning the phase left behind.
    pub fn advance(&mut self, next: ConsolidationPhase) -> EngineResult<ConsolidationPhase> {
        if !self.current.can_transition_to(next) {
            return Err(EngineError::Consistency(format!(
                "illegal consolidation transition {} -> {}",
                self.current, next
            )));
        }
        let previous = self.current;
        self.current = next;
        Ok(previous)
    }
}
