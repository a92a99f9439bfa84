//! Named operation table for the request/response layer.
//!
//! Each public operation is one [`Operation`] registered once at startup.
//! Registering a name twice fails the build; calling an unknown name is
//! `NotFound`. Arguments and results are JSON so any transport can sit on
//! top.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use hypnos_state::EventId;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::config::span_from_secs;
use crate::dedup::KeepPolicy;
use crate::drift::RefreshTarget;
use crate::engine::HypnosEngine;
use crate::error::{EngineError, EngineResult};
use crate::orchestrator::ConsolidationStrategy;
use crate::scope::Scope;

#[async_trait]
pub trait Operation: Send + Sync {
    fn name(&self) -> &'static str;

    async fn call(&self, engine: &HypnosEngine, args: Value) -> EngineResult<Value>;
}

#[derive(Default)]
pub struct OperationTableBuilder {
    ops: Vec<Arc<dyn Operation>>,
}

impl OperationTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, op: Arc<dyn Operation>) -> Self {
        self.ops.push(op);
        self
    }

    /// The five engine operations.
    pub fn with_standard_operations(self) -> Self {
        self.register(Arc::new(FindDuplicateEvents))
            .register(Arc::new(MergeDuplicateEvents))
            .register(Arc::new(RunConsolidation))
            .register(Arc::new(DetectEmbeddingDrift))
            .register(Arc::new(RefreshEmbeddings))
    }

    pub fn build(self, engine: Arc<HypnosEngine>) -> EngineResult<OperationTable> {
        let mut ops: BTreeMap<&'static str, Arc<dyn Operation>> = BTreeMap::new();
        for op in self.ops {
            let name = op.name();
            if ops.insert(name, op).is_some() {
                return Err(EngineError::DuplicateOperation {
                    name: name.to_string(),
                });
            }
        }
        Ok(OperationTable { engine, ops })
    }
}

pub struct OperationTable {
    engine: Arc<HypnosEngine>,
    ops: BTreeMap<&'static str, Arc<dyn Operation>>,
}

impl OperationTable {
    pub fn standard(engine: Arc<HypnosEngine>) -> EngineResult<Self> {
        OperationTableBuilder::new()
            .with_standard_operations()
            .build(engine)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<&'static str> {
        self.ops.keys().copied().collect()
    }

    #[instrument(skip(self, args))]
    pub async fn call(&self, name: &str, args: Value) -> EngineResult<Value> {
        let op = self
            .ops
            .get(name)
            .ok_or_else(|| EngineError::not_found("operation", name))?;
        debug!(operation = name, "dispatching");
        op.call(&self.engine, args).await
    }
}

fn parse<T: for<'de> Deserialize<'de>>(args: Value) -> EngineResult<T> {
    serde_json::from_value(args).map_err(|e| EngineError::validation(format!("invalid arguments: {e}")))
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ScopeArgs {
    namespace: String,
    #[serde(default)]
    session_id: Option<String>,
}

impl From<ScopeArgs> for Scope {
    fn from(a: ScopeArgs) -> Self {
        Scope {
            namespace: a.namespace,
            session_id: a.session_id,
        }
    }
}

pub struct FindDuplicateEvents;

#[derive(Debug, Deserialize)]
struct FindArgs {
    #[serde(flatten)]
    scope: ScopeArgs,
    #[serde(default)]
    threshold: Option<f32>,
    #[serde(default)]
    window_secs: Option<i64>,
}

#[async_trait]
impl Operation for FindDuplicateEvents {
    fn name(&self) -> &'static str {
        "find_duplicate_events"
    }

    async fn call(&self, engine: &HypnosEngine, args: Value) -> EngineResult<Value> {
        let args: FindArgs = parse(args)?;
        let window = args
            .window_secs
            .map(|secs| span_from_secs("window_secs", secs))
            .transpose()?;
        let groups = engine
            .find_duplicate_events(&args.scope.into(), args.threshold, window)
            .await?;
        Ok(serde_json::to_value(groups)?)
    }
}

pub struct MergeDuplicateEvents;

#[derive(Debug, Deserialize)]
struct MergeArgs {
    group_ids: Vec<EventId>,
    #[serde(default)]
    keep_policy: KeepPolicy,
}

#[async_trait]
impl Operation for MergeDuplicateEvents {
    fn name(&self) -> &'static str {
        "merge_duplicate_events"
    }

    async fn call(&self, engine: &HypnosEngine, args: Value) -> EngineResult<Value> {
        let args: MergeArgs = parse(args)?;
        let result = engine
            .merge_duplicate_events(&args.group_ids, &args.keep_policy)
            .await?;
        Ok(serde_json::to_value(result)?)
    }
}

pub struct RunConsolidation;

#[derive(Debug, Deserialize)]
struct ConsolidateArgs {
    #[serde(flatten)]
    scope: ScopeArgs,
    #[serde(default)]
    batch_limit: Option<usize>,
    #[serde(default)]
    skip_validation: bool,
}

#[async_trait]
impl Operation for RunConsolidation {
    fn name(&self) -> &'static str {
        "run_consolidation"
    }

    async fn call(&self, engine: &HypnosEngine, args: Value) -> EngineResult<Value> {
        let args: ConsolidateArgs = parse(args)?;
        let strategy = ConsolidationStrategy {
            batch_limit: args.batch_limit,
            skip_validation: args.skip_validation,
        };
        let report = engine
            .run_consolidation(&args.scope.into(), &strategy)
            .await?;
        Ok(serde_json::to_value(report)?)
    }
}

pub struct DetectEmbeddingDrift;

#[async_trait]
impl Operation for DetectEmbeddingDrift {
    fn name(&self) -> &'static str {
        "detect_embedding_drift"
    }

    async fn call(&self, engine: &HypnosEngine, args: Value) -> EngineResult<Value> {
        let scope: ScopeArgs = parse(args)?;
        let report = engine.detect_embedding_drift(&scope.into()).await?;
        Ok(serde_json::to_value(report)?)
    }
}

pub struct RefreshEmbeddings;

#[async_trait]
impl Operation for RefreshEmbeddings {
    fn name(&self) -> &'static str {
        "refresh_embeddings"
    }

    /// Accepts `{"owners": [...]}` or `{"all_stale": {"namespace": ...}}`.
    async fn call(&self, engine: &HypnosEngine, args: Value) -> EngineResult<Value> {
        let target: RefreshTarget = parse(args)?;
        let result = engine.refresh_embeddings(&target).await?;
        Ok(serde_json::to_value(result)?)
    }
}
