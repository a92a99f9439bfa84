//! Hypnos core: consolidation and synthesis engine for agent long-term
//! memory.
//!
//! Raw episodic events are deduplicated, clustered, mined for patterns by a
//! fast heuristic pass (System 1) with selective escalation to a validator
//! (System 2), and distilled into durable semantic memories and procedures.
//! A drift monitor keeps stored embeddings comparable as the embedding
//! model changes.
//!
//! Storage lives behind the `hypnos-state` traits; providers behind the
//! traits in [`providers`]. Every I/O boundary is async.

pub mod cluster;
pub mod config;
pub mod dedup;
pub mod dispatch;
pub mod drift;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod pattern;
pub mod providers;
pub mod scope;
pub mod similarity;
pub mod synthesis;
pub mod telemetry;

pub use config::{ConsolidationConfig, DedupConfig, DriftConfig, EngineConfig, SimilarityWeights};
pub use dedup::{DedupManager, DuplicateGroup, KeepPolicy, MergeResult, PairScore};
pub use dispatch::{Operation, OperationTable, OperationTableBuilder};
pub use drift::{DriftMonitor, DriftReport, RefreshFailure, RefreshResult, RefreshTarget};
pub use engine::{HypnosEngine, NewEvent};
pub use error::{EngineError, EngineResult};
pub use orchestrator::{
    ClusterFailure, ConsolidationPhase, ConsolidationReport, ConsolidationStrategy, Orchestrator,
    RunOutcome,
};
pub use pattern::{
    Pattern, PatternType, RejectionReason, ValidatedPattern, ValidationDecision, ValidationStrategy,
};
pub use providers::{
    Embedding, EmbeddingProvider, HashingEmbedder, PatternValidator, ProviderError,
    ValidationVerdict,
};
pub use scope::Scope;
pub use synthesis::{MemorySynthesizer, SynthesisOutcome};
pub use telemetry::init_tracing;
