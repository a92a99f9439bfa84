//! Hypnos CLI - one-shot access to the consolidation engine
//!
//! The `hypnos` command drives the engine's operation table from a shell.
//!
//! ## Commands
//!
//! - `ingest`: Record episodic events from a JSONL file
//! - `duplicates`: Find near-duplicate events in a scope
//! - `merge`: Merge a duplicate group into one canonical event
//! - `consolidate`: Run one consolidation pass over a scope
//! - `drift`: Report stale embeddings
//! - `refresh`: Re-embed stale or named records
//! - `ops` / `call`: List or invoke operations by name

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use hypnos_core::{
    ConsolidationReport, DriftReport, EngineConfig, HashingEmbedder, HypnosEngine, KeepPolicy,
    NewEvent, OperationTable, ValidationStrategy,
};
use hypnos_state::fakes::InMemoryStore;
use hypnos_state::{EmbeddingOwner, EventId, MemoryBackend, MemoryId, SurrealStore};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "hypnos")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Memory consolidation engine for long-lived agents", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines and raw JSON results
    #[arg(long, global = true)]
    json: bool,

    /// Engine configuration file (TOML); defaults apply when absent
    #[arg(short, long, global = true, env = "HYPNOS_CONFIG", default_value = "hypnos.toml")]
    config: PathBuf,

    /// Use a throwaway in-memory store instead of the configured database
    #[arg(long, global = true)]
    memory: bool,

    /// JSONL events to ingest before running the command
    #[arg(long, global = true)]
    seed: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct ScopeArgs {
    /// Namespace (agent, project or tenant key)
    #[arg(short, long)]
    namespace: String,

    /// Narrow the scope to one session
    #[arg(short, long)]
    session: Option<String>,
}

impl ScopeArgs {
    fn to_json(&self) -> Value {
        let mut v = json!({ "namespace": self.namespace });
        if let Some(session) = &self.session {
            v["session_id"] = json!(session);
        }
        v
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Record events from a JSONL file (one event object per line)
    Ingest {
        /// Path to the JSONL file
        path: PathBuf,
    },

    /// Find groups of near-duplicate events
    Duplicates {
        #[command(flatten)]
        scope: ScopeArgs,

        /// Similarity threshold in (0, 1]
        #[arg(short, long)]
        threshold: Option<f32>,

        /// Comparison window in seconds
        #[arg(short, long)]
        window_secs: Option<i64>,
    },

    /// Merge a duplicate group into one canonical event
    Merge {
        /// Event ids of the group
        #[arg(required = true)]
        ids: Vec<String>,

        /// Survivor: earliest, most_important, latest or explicit:<id>
        #[arg(short, long, default_value = "earliest")]
        keep: String,
    },

    /// Run one consolidation pass
    Consolidate {
        #[command(flatten)]
        scope: ScopeArgs,

        /// Maximum number of events to claim
        #[arg(short, long)]
        batch_limit: Option<usize>,

        /// Accept or reject on the heuristic pass alone
        #[arg(long)]
        skip_validation: bool,
    },

    /// Report embedding drift
    Drift {
        #[command(flatten)]
        scope: ScopeArgs,
    },

    /// Re-embed records
    Refresh {
        /// Refresh every stale record in this namespace
        #[arg(short, long, conflicts_with = "owners")]
        namespace: Option<String>,

        /// Narrow the namespace to one session
        #[arg(short, long, requires = "namespace")]
        session: Option<String>,

        /// Specific records, as event:<id> or memory:<id>
        #[arg(long = "owner")]
        owners: Vec<String>,
    },

    /// List registered operations
    Ops,

    /// Invoke an operation by name with JSON arguments
    Call {
        /// Operation name
        name: String,

        /// Arguments as a JSON object
        #[arg(default_value = "{}")]
        args: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    hypnos_core::init_tracing(cli.json, level);

    let config = EngineConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;
    let store = open_store(cli.memory).await?;
    let engine = Arc::new(
        HypnosEngine::new(
            store,
            Arc::new(HashingEmbedder::default()),
            ValidationStrategy::HeuristicOnly,
            config,
        )
        .context("Failed to build engine")?,
    );
    let table = OperationTable::standard(Arc::clone(&engine))?;

    if let Some(seed) = &cli.seed {
        let ids = cmd_ingest(&engine, seed).await?;
        info!(count = ids.len(), path = %seed.display(), "seeded events");
    }

    match cli.command {
        Commands::Ingest { path } => {
            let ids = cmd_ingest(&engine, &path).await?;
            if cli.json {
                println!("{}", serde_json::to_string(&ids)?);
            } else {
                println!("Recorded {} events from {}", ids.len(), path.display());
            }
            Ok(())
        }
        Commands::Duplicates {
            scope,
            threshold,
            window_secs,
        } => {
            let mut args = scope.to_json();
            if let Some(t) = threshold {
                args["threshold"] = json!(t);
            }
            if let Some(w) = window_secs {
                args["window_secs"] = json!(w);
            }
            let out = table.call("find_duplicate_events", args).await?;
            print_result(&out, cli.json, render_groups)
        }
        Commands::Merge { ids, keep } => {
            let args = merge_args(&ids, &keep)?;
            let out = table.call("merge_duplicate_events", args).await?;
            print_result(&out, cli.json, render_merge)
        }
        Commands::Consolidate {
            scope,
            batch_limit,
            skip_validation,
        } => {
            let mut args = scope.to_json();
            args["skip_validation"] = json!(skip_validation);
            if let Some(limit) = batch_limit {
                args["batch_limit"] = json!(limit);
            }
            let out = table.call("run_consolidation", args).await?;
            print_result(&out, cli.json, render_report)
        }
        Commands::Drift { scope } => {
            let out = table.call("detect_embedding_drift", scope.to_json()).await?;
            print_result(&out, cli.json, render_drift)
        }
        Commands::Refresh {
            namespace,
            session,
            owners,
        } => {
            let args = refresh_args(namespace, session, &owners)?;
            let out = table.call("refresh_embeddings", args).await?;
            print_result(&out, cli.json, |v| Ok(serde_json::to_string_pretty(v)?))
        }
        Commands::Ops => {
            for name in table.names() {
                println!("{name}");
            }
            Ok(())
        }
        Commands::Call { name, args } => {
            let args: Value = serde_json::from_str(&args).context("Arguments must be JSON")?;
            let out = table.call(&name, args).await?;
            println!("{}", serde_json::to_string_pretty(&out)?);
            Ok(())
        }
    }
}

async fn open_store(memory: bool) -> Result<Arc<dyn MemoryBackend>> {
    if memory {
        info!("Using in-memory store; nothing will be persisted");
        return Ok(Arc::new(InMemoryStore::new()));
    }
    let store = SurrealStore::from_env()
        .await
        .context("Failed to connect to Hypnos database")?;
    Ok(Arc::new(store))
}

/// Record every event in a JSONL file, skipping blank lines.
async fn cmd_ingest(engine: &HypnosEngine, path: &Path) -> Result<Vec<EventId>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let mut ids = Vec::new();
    for (n, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let event: NewEvent = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: invalid event", path.display(), n + 1))?;
        let id = engine
            .record_event(event)
            .await
            .with_context(|| format!("{}:{}: failed to record event", path.display(), n + 1))?;
        ids.push(id);
    }
    Ok(ids)
}

fn merge_args(ids: &[String], keep: &str) -> Result<Value> {
    let policy: KeepPolicy = keep.parse()?;
    Ok(json!({
        "group_ids": ids,
        "keep_policy": serde_json::to_value(policy)?,
    }))
}

fn parse_owner(raw: &str) -> Result<EmbeddingOwner> {
    match raw.split_once(':') {
        Some(("event", id)) if !id.is_empty() => Ok(EmbeddingOwner::Event(EventId::from(id))),
        Some(("memory", id)) if !id.is_empty() => Ok(EmbeddingOwner::Memory(MemoryId::from(id))),
        _ => bail!("invalid owner '{raw}' (expected event:<id> or memory:<id>)"),
    }
}

fn refresh_args(
    namespace: Option<String>,
    session: Option<String>,
    owners: &[String],
) -> Result<Value> {
    match namespace {
        Some(namespace) => {
            let scope = ScopeArgs { namespace, session };
            Ok(json!({ "all_stale": scope.to_json() }))
        }
        None if !owners.is_empty() => {
            let owners = owners
                .iter()
                .map(|o| parse_owner(o))
                .collect::<Result<Vec<_>>>()?;
            Ok(json!({ "owners": owners }))
        }
        None => bail!("refresh needs --namespace or at least one --owner"),
    }
}

fn print_result(out: &Value, json: bool, render: impl Fn(&Value) -> Result<String>) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(out)?);
    } else {
        println!("{}", render(out)?);
    }
    Ok(())
}

fn render_groups(out: &Value) -> Result<String> {
    let groups = out.as_array().map(Vec::as_slice).unwrap_or_default();
    if groups.is_empty() {
        return Ok("No duplicate groups found".to_string());
    }
    let mut lines = Vec::new();
    for (i, group) in groups.iter().enumerate() {
        let ids: Vec<&str> = group["event_ids"]
            .as_array()
            .map(|ids| ids.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        lines.push(format!(
            "group {}: {} (canonical {})",
            i + 1,
            ids.join(", "),
            group["canonical_id"].as_str().unwrap_or("?")
        ));
    }
    Ok(lines.join("\n"))
}

fn render_merge(out: &Value) -> Result<String> {
    Ok(format!(
        "Merged into {} ({} events point at it)",
        out["canonical_id"].as_str().unwrap_or("?"),
        out["merged_count"]
    ))
}

fn render_report(out: &Value) -> Result<String> {
    let r: ConsolidationReport = serde_json::from_value(out.clone())?;
    let mut text = format!(
        "Run {} on {}: {}\n  events processed:  {}\n  patterns accepted: {} ({} discoveries)\n  patterns rejected: {}\n  memories created:  {} (reused {})\n  procedures:        {} (reused {})\n  duration:          {}ms",
        r.run_id,
        r.scope,
        r.outcome.as_str(),
        r.events_processed,
        r.patterns_extracted,
        r.discoveries_found,
        r.rejected_count,
        r.memories_created,
        r.memories_reused,
        r.procedures_created,
        r.procedures_reused,
        r.duration_ms,
    );
    if r.events_reverted > 0 {
        text.push_str(&format!("\n  events reverted:   {}", r.events_reverted));
    }
    for failure in &r.cluster_failures {
        text.push_str(&format!(
            "\n  failed cluster {} ({} events): {}",
            failure.cluster, failure.event_count, failure.reason
        ));
    }
    if !r.is_success() {
        text.push_str("\n  reverted events stay pending; rerun to retry them");
    }
    Ok(text)
}

fn render_drift(out: &Value) -> Result<String> {
    let d: DriftReport = serde_json::from_value(out.clone())?;
    Ok(format!(
        "{}/{} embeddings stale ({:.1}%) against {}\n  version mismatch: {}\n  aged out:         {}\n  est. cost:        {:.4}\n{}",
        d.stale_count,
        d.total_count,
        d.drift_percentage,
        d.active_version,
        d.version_mismatch_count,
        d.aged_out_count,
        d.estimated_refresh_cost,
        d.recommendation
    ))
}
