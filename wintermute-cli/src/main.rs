//! `wintermute` CLI: tiered request routing, graph runs, router tuning, and
//! the metrics dashboard.

mod dashboard;
mod tune;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use wintermute_agent::adapters::{
    make_model_client, AnthropicAdapter, LocalChatAdapter, OpenAiAdapter, RemoteNodeAdapter,
};
use wintermute_agent::client::ModelClient;
use wintermute_agent::runtime::GenericJsonAgent;
use wintermute_core::budget::BudgetLedger;
use wintermute_core::command::{register_defaults, CommandRegistry};
use wintermute_core::config::{load_router_config, RouterConfig, TierConfig};
use wintermute_core::graph::{load_graph, Graph};
use wintermute_core::state::RunState;
use wintermute_orchestrator::checkpoint::CheckpointStore;
use wintermute_orchestrator::dispatcher::{DispatchResult, TieredDispatcher};
use wintermute_orchestrator::orchestrator::{AgentCatalog, GraphRunner, RunStatus};
use wintermute_orchestrator::providers::{ProviderEntry, ProviderRegistry};
use wintermute_orchestrator::router::{ModelRouter, SLOT_TIER1, SLOT_TIER2};
use wintermute_orchestrator::store::{DecisionStore, SqliteStore};
use wintermute_orchestrator::telemetry::MetricsCollector;

#[derive(Parser)]
#[command(name = "wintermute", about = "Cognitive routing and graph orchestration")]
struct Cli {
    /// Verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Route a request string through tier 0..3 dispatch.
    RunRouter {
        /// Slash command, JSON payload, or free text.
        request: String,
        /// Show what would be executed without running it.
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        router_config: Option<PathBuf>,
        /// stub | local | local:<model> | cloud | cloud:<model>
        #[arg(long, default_value = "stub")]
        model_call: String,
    },

    /// Execute a scope's graph.
    RunGraph {
        /// Scope type, e.g. certification, topic, story_world, lab_suite.
        #[arg(long)]
        scope: String,
        #[arg(long)]
        id: String,
        /// Graph definition YAML.
        #[arg(long)]
        graph: PathBuf,
        /// Seed source reference inserted into initial state.
        #[arg(long)]
        sources: Option<String>,
        #[arg(long)]
        router_config: Option<PathBuf>,
        /// stub | local | local:<model> | cloud | cloud:<model>
        #[arg(long, default_value = "stub")]
        model_call: String,
        /// Resume a checkpointed run by id.
        #[arg(long)]
        resume: Option<String>,
        /// SQLite database for runs and routing decisions.
        #[arg(long)]
        db: Option<String>,
        #[arg(long, default_value = ".checkpoints")]
        checkpoint_dir: PathBuf,
        /// Run-level token cap (0 = unlimited).
        #[arg(long, default_value_t = 0)]
        max_tokens: u64,
        /// Run-level cost cap in USD (0 = unlimited).
        #[arg(long, default_value_t = 0.0)]
        max_cost: f64,
    },

    /// Analyze routing decisions and suggest threshold adjustments.
    TuneRouter {
        #[arg(long)]
        db: String,
        #[arg(long)]
        run_id: Option<String>,
        /// Emit the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Serve /health, /metrics, /runs, /routing over HTTP.
    Dashboard {
        #[arg(long, default_value_t = 8088)]
        port: u16,
        #[arg(long)]
        db: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Command::RunRouter {
            request,
            dry_run,
            router_config,
            model_call,
        } => run_router(&request, dry_run, router_config.as_deref(), &model_call).await,
        Command::RunGraph {
            scope,
            id,
            graph,
            sources,
            router_config,
            model_call,
            resume,
            db,
            checkpoint_dir,
            max_tokens,
            max_cost,
        } => {
            run_graph(RunGraphArgs {
                scope,
                id,
                graph,
                sources,
                router_config,
                model_call,
                resume,
                db,
                checkpoint_dir,
                max_tokens,
                max_cost,
            })
            .await
        }
        Command::TuneRouter { db, run_id, json } => tune_router(&db, run_id.as_deref(), json).await,
        Command::Dashboard { port, db } => run_dashboard(port, db.as_deref()).await,
    }
}

fn tier_adapter(config: &TierConfig) -> Arc<dyn ModelClient> {
    let host = std::env::var("WINTERMUTE_LOCAL_HOST")
        .unwrap_or_else(|_| "http://localhost:11434".to_string());
    Arc::new(
        LocalChatAdapter::new(config.model.clone(), config.model.clone(), host)
            .with_options(config.num_ctx, config.max_tokens, config.temperature)
            .with_timeout(std::time::Duration::from_secs_f64(config.timeout_seconds)),
    )
}

/// Build the tier-3 provider pool from config, one adapter per entry.
fn build_provider_registry(config: &RouterConfig) -> Arc<ProviderRegistry> {
    let registry = Arc::new(ProviderRegistry::new(config.daily_frontier_cap));
    for pc in &config.tier3_providers {
        let client: Arc<dyn ModelClient> = match pc.kind.as_str() {
            "anthropic" => Arc::new(AnthropicAdapter::new(pc.name.clone(), pc.model.clone())),
            "openai" => Arc::new(OpenAiAdapter::new(pc.name.clone(), pc.model.clone())),
            "dgx" => Arc::new(
                RemoteNodeAdapter::new(
                    pc.name.clone(),
                    pc.model.clone(),
                    pc.host.clone().unwrap_or_else(|| "http://localhost:11434".into()),
                )
                .with_timeout(std::time::Duration::from_secs_f64(pc.timeout_seconds)),
            ),
            "local" | "ollama" => Arc::new(
                LocalChatAdapter::new(
                    pc.name.clone(),
                    pc.model.clone(),
                    pc.host.clone().unwrap_or_else(|| "http://localhost:11434".into()),
                )
                .with_timeout(std::time::Duration::from_secs_f64(pc.timeout_seconds)),
            ),
            other => {
                tracing::warn!(provider = %pc.name, kind = %other, "unknown provider kind, skipping");
                continue;
            }
        };
        registry.register(ProviderEntry::from_config(pc, client));
    }
    registry
}

async fn run_router(
    request: &str,
    dry_run: bool,
    router_config: Option<&std::path::Path>,
    model_call: &str,
) -> anyhow::Result<()> {
    let config = match router_config {
        Some(path) => load_router_config(path).context("loading router config")?,
        None => RouterConfig::default(),
    };

    let mut commands = CommandRegistry::new();
    register_defaults(&mut commands);

    let mut dispatcher = TieredDispatcher::new(commands, &config);
    if model_call != "stub" {
        dispatcher = dispatcher
            .with_tier1_client(tier_adapter(&config.tier1))
            .with_tier2_client(tier_adapter(&config.tier2));
    }
    if !config.tier3_providers.is_empty() {
        dispatcher = dispatcher.with_provider_registry(build_provider_registry(&config));
    }

    let result = dispatcher.dispatch(request).await?;
    tracing::info!(
        tier = result.tier,
        action = %result.action,
        target = %result.target,
        confidence = result.confidence,
        "dispatch result"
    );
    execute_dispatch(&result, dry_run)
}

fn execute_dispatch(result: &DispatchResult, dry_run: bool) -> anyhow::Result<()> {
    match result.action.as_str() {
        "rejected" => {
            println!("Rejected: {}", result.safety_reason);
            std::process::exit(1);
        }
        "needs_escalation" => {
            println!("No tier could resolve the request; configure tier clients or providers.");
            std::process::exit(1);
        }
        "show_status" => {
            println!("Status: system operational");
            Ok(())
        }
        "show_help" => {
            println!("Available commands:");
            println!("  /cert <cert_id>     — run the certification graph");
            println!("  /dossier <topic_id> — run the dossier graph");
            println!("  /story <world_id>   — run the story graph");
            println!("  /lab <suite_id>     — run the lab graph");
            println!("  /status             — show system status");
            println!("  /help               — show this help");
            Ok(())
        }
        "execute_graph" => {
            let (scope, arg_key) = match result.target.as_str() {
                "run_cert" => ("certification", "cert_id"),
                "run_dossier" => ("topic", "topic_id"),
                "run_story" => ("story_world", "world_id"),
                "run_lab" => ("lab_suite", "suite_id"),
                other => {
                    println!("Unknown target: {other}");
                    std::process::exit(1);
                }
            };
            let id = result
                .args
                .get(arg_key)
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            let command = format!(
                "wintermute run-graph --scope {scope} --id {id} --graph config/graphs/{}.yaml",
                result.target.trim_start_matches("run_")
            );
            if dry_run {
                println!("[dry-run] would execute: {command}");
            } else {
                println!("{command}");
            }
            Ok(())
        }
        "answer_question" => {
            if let Some(response) = &result.model_response {
                println!("{response}");
            }
            Ok(())
        }
        other => {
            println!("Unhandled action: {other} (args: {:?})", result.args);
            std::process::exit(1);
        }
    }
}

struct RunGraphArgs {
    scope: String,
    id: String,
    graph: PathBuf,
    sources: Option<String>,
    router_config: Option<PathBuf>,
    model_call: String,
    resume: Option<String>,
    db: Option<String>,
    checkpoint_dir: PathBuf,
    max_tokens: u64,
    max_cost: f64,
}

/// Instantiate a prompted agent for every agent id the graph references.
/// Domain deployments register richer agents; the generic shape keeps the
/// graphs runnable end to end.
fn catalog_for_graph(graph: &Graph) -> AgentCatalog {
    let mut catalog = AgentCatalog::new();
    for node in graph.nodes.values() {
        if catalog.contains(&node.agent) {
            continue;
        }
        let mut template = String::from("Scope type: {scope_type}\nScope id: {scope_id}");
        for input in &node.inputs {
            if input != "scope_type" && input != "scope_id" {
                template.push_str(&format!("\n{input}: {{{input}}}"));
            }
        }
        let outputs: Vec<&str> = node.outputs.iter().map(String::as_str).collect();
        let system_prompt = format!(
            "You are the '{}' stage of a content pipeline. Produce a JSON object \
             with keys: {}. Output valid JSON only.",
            node.agent,
            if outputs.is_empty() {
                "your results".to_string()
            } else {
                outputs.join(", ")
            }
        );
        let agent = GenericJsonAgent::new(node.agent.clone(), system_prompt)
            .with_user_template(template)
            .with_required_outputs(&outputs);
        catalog.register(Arc::new(agent));
    }
    catalog
}

async fn run_graph(args: RunGraphArgs) -> anyhow::Result<()> {
    let graph = load_graph(&args.graph).context("loading graph definition")?;
    let catalog = catalog_for_graph(&graph);

    let default_client =
        make_model_client(&args.model_call).map_err(|e| anyhow::anyhow!(e.to_string()))?;
    let metrics = Arc::new(MetricsCollector::new());

    let mut runner = GraphRunner::new(catalog, default_client)
        .with_metrics(metrics.clone())
        .with_checkpoints(CheckpointStore::new(&args.checkpoint_dir));

    if let Some(path) = &args.router_config {
        let config = load_router_config(path).context("loading router config")?;
        let registry = build_provider_registry(&config);
        let router = ModelRouter::new(config.clone(), registry)
            .with_adapter(SLOT_TIER1, tier_adapter(&config.tier1))
            .with_adapter(SLOT_TIER2, tier_adapter(&config.tier2));
        runner = runner.with_router(Arc::new(router));
    }

    if let Some(db) = &args.db {
        let store = SqliteStore::open(db).await.context("opening database")?;
        let store: Arc<dyn DecisionStore> = Arc::new(store);
        runner = runner.with_store(store);
    }

    let budget = BudgetLedger::with_caps(args.max_tokens, args.max_cost, 0.0);

    let result = match &args.resume {
        Some(run_id) => runner.resume(&graph, run_id, budget).await?,
        None => {
            let run_id = uuid::Uuid::new_v4().to_string();
            let mut state = RunState::new(&args.scope, &args.id, &run_id, &graph.id);
            if let Some(seed) = &args.sources {
                state.insert("sources", json!([seed]));
            }
            runner.run(&graph, state, budget).await?
        }
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "run_id": result.run_id,
            "status": result.status,
            "nodes_executed": result.events.len(),
            "needs_human_review": result.needs_human_review,
            "review_reasons": result.review_reasons,
            "state_keys": result.state.as_map().keys().collect::<Vec<_>>(),
        }))?
    );

    if result.status == RunStatus::Failed {
        std::process::exit(1);
    }
    Ok(())
}

async fn tune_router(db: &str, run_id: Option<&str>, as_json: bool) -> anyhow::Result<()> {
    let store = SqliteStore::open(db).await.context("opening database")?;
    let decisions = store
        .fetch_decisions(run_id)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    if decisions.is_empty() {
        println!("No routing decisions found.");
        return Ok(());
    }

    let report = tune::analyze(&decisions);
    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Analyzing {} routing decisions...\n", decisions.len());

    println!("=== Over-Escalation ===");
    print_issues(&report["over_escalation"]);

    println!("\n=== Under-Escalation ===");
    print_issues(&report["under_escalation"]);

    println!("\n=== Cost Analysis ===");
    let costs = &report["cost_analysis"];
    if let Some(by_provider) = costs["total_cost_by_provider"].as_object() {
        for (provider, total) in by_provider {
            let count = &costs["call_count_by_provider"][provider];
            let avg = &costs["avg_cost_per_call"][provider];
            let latency = &costs["avg_latency_ms"][provider];
            println!("  {provider}: ${total} total, {count} calls, ${avg}/call, {latency}ms avg");
        }
    }

    println!("\n=== Threshold Suggestions ===");
    if let Some(suggestions) = report["threshold_suggestions"].as_object() {
        for (key, info) in suggestions {
            match info.get("reasoning").and_then(|r| r.as_str()) {
                Some(reasoning) => println!("  {key}: {reasoning}"),
                None => println!("  {key}: {info}"),
            }
        }
    }
    Ok(())
}

fn print_issues(issues: &serde_json::Value) {
    match issues.as_array() {
        Some(items) if !items.is_empty() => {
            for issue in items {
                println!(
                    "  [{}] {}",
                    issue["agent_id"].as_str().unwrap_or("?"),
                    issue["suggestion"].as_str().unwrap_or("")
                );
            }
        }
        _ => println!("  None detected."),
    }
}

async fn run_dashboard(port: u16, db: Option<&str>) -> anyhow::Result<()> {
    let store: Option<Arc<dyn DecisionStore>> = match db {
        Some(path) => Some(Arc::new(
            SqliteStore::open(path).await.context("opening database")?,
        )),
        None => None,
    };
    let state = dashboard::AppState {
        metrics: Arc::new(MetricsCollector::new()),
        store,
    };
    dashboard::serve(port, state).await
}
