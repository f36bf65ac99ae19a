use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{CommandFactory, Parser, Subcommand};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gateflow_core::config::AppConfig;
use gateflow_core::event::EventBus;
use gateflow_core::traits::FlowStore;
use gateflow_core::tree::{goal_signature, FlowDefinition, FlowTree, NodeKind};
use gateflow_core::types::{
    AuditEventType, ExecutionId, FlowEvent, HumanDecision, HumanGateRequest,
};

use gateflow_engine::{AgentRegistry, ApprovalBroker, CommandAgent, FlowExecutor, RunLogger};
use gateflow_store::SqliteFlowStore;

#[derive(Parser)]
#[command(name = "gateflow", version, about = "Rule-gated multi-stage approval flows")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "gateflow.toml", env = "GATEFLOW_CONFIG")]
    config: PathBuf,

    /// Override the SQLite database path from the config
    #[arg(long)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a flow definition and print its tree
    Validate {
        /// Flow definition (.json or .toml)
        flow: PathBuf,
    },
    /// Execute a flow once
    Run {
        /// Flow definition (.json or .toml)
        flow: PathBuf,
        /// Initial context as JSON, or @path to a JSON file
        #[arg(long)]
        context: Option<String>,
        /// Answer every human gate with this label instead of prompting
        #[arg(long)]
        decide: Option<String>,
        /// Print the full execution report as JSON
        #[arg(long)]
        json: bool,
        /// Write a full JSONL run log to this directory
        #[arg(long, value_name = "DIR")]
        execution_log: Option<PathBuf>,
    },
    /// List executions, or show one in detail
    Status {
        /// Execution ID (prefix match on listed executions)
        execution_id: Option<String>,
        /// Only executions of this flow
        #[arg(long)]
        flow: Option<String>,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Print the audit trail of an execution
    Audit {
        execution_id: String,
        /// Include entry payloads
        #[arg(long, short)]
        verbose: bool,
    },
    /// Show recorded episodes for a goal
    Episodes {
        flow_id: String,
        goal: String,
        #[arg(long, default_value = "10")]
        limit: usize,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("gateflow=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "gateflow", &mut std::io::stdout());
        return Ok(());
    }

    if let Commands::Validate { flow } = &cli.command {
        return validate(flow);
    }

    let config = AppConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    if let Commands::Config = &cli.command {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let db_path = cli.db.clone().unwrap_or_else(|| config.store_path());
    let store = Arc::new(SqliteFlowStore::open(&db_path)?);

    match cli.command {
        Commands::Run {
            flow,
            context,
            decide,
            json,
            execution_log,
        } => {
            let options = RunOptions {
                context,
                decide,
                json,
                execution_log,
            };
            run_flow(&config, store, &flow, options).await
        }
        Commands::Status {
            execution_id,
            flow,
            limit,
        } => show_status(store.as_ref(), execution_id.as_deref(), flow.as_deref(), limit),
        Commands::Audit {
            execution_id,
            verbose,
        } => show_audit(store.as_ref(), &execution_id, verbose),
        Commands::Episodes {
            flow_id,
            goal,
            limit,
        } => {
            let signature = goal_signature(&goal);
            let episodes = store.episodes(&flow_id, &signature, limit)?;
            println!("Episodes for '{}' ({}):", goal, signature);
            if episodes.is_empty() {
                println!("  none recorded");
            }
            for episode in episodes {
                println!(
                    "  {} {} {}",
                    episode.recorded_at.format("%Y-%m-%d %H:%M:%S"),
                    if episode.success { "ok  " } else { "FAIL" },
                    truncate(&episode.output.to_string(), 100)
                );
            }
            Ok(())
        }
        Commands::Validate { .. } | Commands::Config | Commands::Completions { .. } => Ok(()),
    }
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let definition = FlowDefinition::load(path)?;
    let tree = FlowTree::build(definition)?;
    println!("Flow '{}' ({}): {} nodes", tree.name(), tree.flow_id(), tree.len());
    print_node(&tree, tree.root_id(), 1);
    Ok(())
}

fn print_node(tree: &FlowTree, id: &str, depth: usize) {
    let Ok(node) = tree.get(id) else { return };
    let detail = match &node.kind {
        NodeKind::Root => "root".to_string(),
        NodeKind::Agent(spec) => format!("agent: {}", spec.goal),
        NodeKind::Gate(spec) => format!(
            "gate ({} rule(s), pass >= {})",
            spec.rules.len(),
            spec.decision.pass_threshold
        ),
        NodeKind::ControlFlow(spec) => spec.pattern_name().to_string(),
    };
    println!("{}{} [{}]", "  ".repeat(depth), node.id, detail);
    for child in tree.children(id) {
        print_node(tree, child, depth + 1);
    }
}

fn parse_context(raw: Option<&str>) -> anyhow::Result<serde_json::Value> {
    let Some(raw) = raw else {
        return Ok(serde_json::json!({}));
    };
    let text = match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("reading {}", path))?,
        None => raw.to_string(),
    };
    serde_json::from_str(&text).context("initial context is not valid JSON")
}

fn build_agents(config: &AppConfig) -> AgentRegistry {
    let mut registry = AgentRegistry::new();
    for entry in &config.agents {
        registry.register(Arc::new(CommandAgent::from_entry(entry)));
    }
    registry
}

struct RunOptions {
    context: Option<String>,
    decide: Option<String>,
    json: bool,
    execution_log: Option<PathBuf>,
}

async fn run_flow(
    config: &AppConfig,
    store: Arc<SqliteFlowStore>,
    path: &Path,
    options: RunOptions,
) -> anyhow::Result<()> {
    let definition = FlowDefinition::load(path)?;
    store.save_flow(&definition)?;
    let tree = Arc::new(FlowTree::build(definition)?);
    let initial_context = parse_context(options.context.as_deref())?;

    let agents = build_agents(config);
    let has_agent_nodes = tree.nodes().any(|n| matches!(n.kind, NodeKind::Agent(_)));
    if agents.is_empty() && has_agent_nodes {
        warn!("No agents configured; agent nodes will fail");
    }

    let event_bus = Arc::new(EventBus::default());
    let broker = Arc::new(ApprovalBroker::new(event_bus.clone()));
    let executor = FlowExecutor::new(tree, Arc::new(agents), store.clone())
        .with_human(broker.clone())
        .with_event_bus(event_bus.clone())
        .with_config(config.engine.clone())
        .with_human_deadline(config.human_gate.default_deadline_secs);

    let execution_id = ExecutionId::new();
    let cancel = CancellationToken::new();

    // Graceful shutdown on Ctrl-C
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Cancelling execution...");
        ctrl_c.cancel();
    });

    // Spawn RunLogger if logging is enabled; --execution-log logs everything
    let run_log = match options.execution_log {
        Some(dir) => Some((dir, 3)),
        None => config
            .log_dir()
            .zip(config.log.as_ref().map(|l| l.level)),
    };
    if let Some((log_dir, level)) = run_log {
        info!(dir = %log_dir.display(), level, "RunLogger started");
        let logger = RunLogger::new(log_dir, level);
        tokio::spawn(logger.run(event_bus.clone(), execution_id.clone(), cancel.clone()));
    }

    let printer = tokio::spawn(print_events(
        event_bus.subscribe(),
        broker,
        execution_id.clone(),
        config.human_gate.actor.clone(),
        options.decide,
    ));

    let report = executor
        .execute_with_id(execution_id, initial_context, cancel)
        .await?;
    printer.await.ok();

    if options.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "Execution {} {}",
            report.execution_id,
            report.status.as_str().to_uppercase()
        );
        if let Some(reason) = &report.reason {
            println!("  reason: {}", reason);
        }
        println!("  audit entries: {}", report.audit.len());
        println!("  output: {}", truncate(&report.output.to_string(), 200));
    }

    if !report.is_completed() {
        bail!(
            "execution {} failed: {}",
            report.execution_id,
            report.reason.unwrap_or_default()
        );
    }
    Ok(())
}

/// Print progress and answer human gates until the execution finishes.
async fn print_events(
    mut rx: broadcast::Receiver<FlowEvent>,
    broker: Arc<ApprovalBroker>,
    execution_id: ExecutionId,
    actor: String,
    decide: Option<String>,
) {
    let gates = GateAnswerer {
        broker,
        actor,
        decide,
    };
    let mut answered = HashSet::new();
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                // a missed request is still pending in the broker
                warn!(skipped, "Event printer lagged; re-checking pending decisions");
                for request in gates.broker.pending_for(&execution_id).await {
                    if answered.insert(request.id.clone()) {
                        gates.answer(request).await;
                    }
                }
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        match event {
            FlowEvent::Audit(entry) if entry.execution_id == execution_id => {
                let node = entry.node_id.as_deref().unwrap_or("-");
                match entry.event_type {
                    AuditEventType::NodeStarted => eprintln!("[start] {}", node),
                    AuditEventType::GateDecided => eprintln!(
                        "[gate] {} -> {} (score {})",
                        node, entry.payload["decision"], entry.payload["score"]
                    ),
                    AuditEventType::TransformApplied => eprintln!(
                        "[transform] {} {} {}",
                        node,
                        entry.payload["type"].as_str().unwrap_or("?"),
                        entry.payload["field"].as_str().unwrap_or("")
                    ),
                    AuditEventType::RouteSelected => {
                        eprintln!("[route] {} -> {}", node, entry.payload["target"])
                    }
                    AuditEventType::RecycleTriggered => {
                        eprintln!("[recycle] {} -> {}", node, entry.payload["target"])
                    }
                    AuditEventType::NodeCompleted => {
                        eprintln!("[{}] {}", entry.payload["status"].as_str().unwrap_or("?"), node)
                    }
                    _ => {}
                }
            }
            FlowEvent::HumanDecisionRequested { request } if request.execution_id == execution_id => {
                if answered.insert(request.id.clone()) {
                    gates.answer(request).await;
                }
            }
            FlowEvent::ExecutionFinished { execution_id: finished, .. } if finished == execution_id => {
                break;
            }
            _ => {}
        }
    }
}

/// Answers human gates for one run, from `--decide` or an interactive prompt.
struct GateAnswerer {
    broker: Arc<ApprovalBroker>,
    actor: String,
    decide: Option<String>,
}

impl GateAnswerer {
    async fn answer(&self, request: HumanGateRequest) {
        let label = match &self.decide {
            Some(label) => Some(label.clone()),
            None => prompt_decision(request.clone()).await,
        };
        match label {
            Some(label) => {
                let broker = self.broker.clone();
                let decision = HumanDecision::new(label, self.actor.clone());
                tokio::spawn(async move {
                    broker.respond(&request.id, decision).await;
                });
            }
            None => warn!(gate = %request.gate_node_id, "No decision given"),
        }
    }
}

async fn prompt_decision(request: HumanGateRequest) -> Option<String> {
    eprintln!(
        "\n[DECISION] gate '{}' needs a decision from {}",
        request.gate_node_id,
        if request.approvers.is_empty() {
            "an operator".to_string()
        } else {
            request.approvers.join(", ")
        }
    );
    eprintln!(
        "  engine suggests {} (score {}): {}",
        request.information_package["decision"],
        request.information_package["score"],
        request.information_package["reason"]
    );
    if let Some(deadline) = request.deadline {
        eprintln!("  deadline: {}", deadline.format("%Y-%m-%d %H:%M:%S UTC"));
    }

    let labels = request.allowed_labels;
    tokio::task::spawn_blocking(move || {
        dialoguer::Select::new()
            .with_prompt("Decision")
            .items(&labels)
            .default(0)
            .interact()
            .ok()
            .and_then(|i| labels.get(i).cloned())
    })
    .await
    .ok()
    .flatten()
}

fn show_status(
    store: &SqliteFlowStore,
    execution_id: Option<&str>,
    flow: Option<&str>,
    limit: usize,
) -> anyhow::Result<()> {
    let executions = store.list_executions(flow, limit.max(1))?;
    let Some(prefix) = execution_id else {
        if executions.is_empty() {
            println!("No executions recorded.");
        }
        for execution in &executions {
            println!(
                "{}  {:<10} {:<20} {}",
                execution.id,
                execution.status.as_str(),
                execution.flow_id,
                execution.started_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
        return Ok(());
    };

    let id = match executions.iter().find(|e| e.id.0.starts_with(prefix)) {
        Some(e) => e.id.clone(),
        None => ExecutionId::from_string(prefix),
    };
    let Some(execution) = store.get_execution(&id)? else {
        bail!("no execution '{}'", prefix);
    };

    println!("Execution {}", execution.id);
    println!("  flow:    {}", execution.flow_id);
    println!("  status:  {}", execution.status.as_str());
    if let Some(reason) = &execution.reason {
        println!("  reason:  {}", reason);
    }
    println!("  started: {}", execution.started_at.to_rfc3339());
    if let Some(ended) = execution.ended_at {
        println!("  ended:   {}", ended.to_rfc3339());
    }

    println!("\nNodes:");
    for record in store.node_executions(&id)? {
        println!(
            "  {:<20} {:<11} {}",
            record.node_id,
            record.status.as_str(),
            record.error.as_deref().unwrap_or("")
        );
    }

    let evaluations = store.gate_evaluations(&id)?;
    if !evaluations.is_empty() {
        println!("\nGates:");
        for evaluation in evaluations {
            println!(
                "  {:<20} {:<10} {:>6.1}  {}",
                evaluation.gate_node_id,
                evaluation.decision,
                evaluation.aggregate_score,
                evaluation.reason
            );
        }
    }

    let transforms: Vec<_> = store
        .audit_trail(&id)?
        .into_iter()
        .filter(|e| e.event_type == AuditEventType::TransformApplied)
        .collect();
    if !transforms.is_empty() {
        println!("\nTransforms:");
        for entry in transforms {
            println!(
                "  {:<20} {:<13} {}",
                entry.node_id.as_deref().unwrap_or("-"),
                entry.payload["type"].as_str().unwrap_or("?"),
                entry.payload["field"].as_str().unwrap_or("")
            );
        }
    }

    let assignments = store.assignments(&id)?;
    if !assignments.is_empty() {
        println!("\nAssignments:");
        for a in &assignments {
            let result = match a.success {
                Some(true) => "ok",
                Some(false) => "FAIL",
                None => "open",
            };
            let score = a
                .performance_score
                .map(|s| format!("{:.2}", s))
                .unwrap_or_default();
            println!(
                "  {:<20} #{:<2} {:<16} {:<4} {}",
                a.node_id, a.attempt, a.agent_id, result, score
            );
        }

        println!("\nAgent performance (all executions):");
        let mut agents: Vec<&str> = assignments.iter().map(|a| a.agent_id.as_str()).collect();
        agents.sort_unstable();
        agents.dedup();
        for agent in agents {
            for stats in store.agent_performance(Some(agent))? {
                println!(
                    "  {:<16} {:>4} assigned  {:>5.1}% ok  avg score {}  avg {}",
                    stats.agent_id,
                    stats.total_assignments,
                    stats.success_rate * 100.0,
                    stats
                        .avg_score
                        .map(|s| format!("{:.2}", s))
                        .unwrap_or_else(|| "-".into()),
                    stats
                        .avg_duration_secs
                        .map(|d| format!("{:.1}s", d))
                        .unwrap_or_else(|| "-".into())
                );
            }
        }
    }

    let memory = store.load_working_memory(&id)?;
    if !memory.is_empty() {
        println!("\nWorking memory:");
        for (key, value) in memory {
            println!("  {:<20} {}", key, truncate(&value.to_string(), 100));
        }
    }
    Ok(())
}

fn show_audit(store: &SqliteFlowStore, execution_id: &str, verbose: bool) -> anyhow::Result<()> {
    let entries = store.audit_trail(&ExecutionId::from_string(execution_id))?;
    if entries.is_empty() {
        bail!("no audit entries for '{}'", execution_id);
    }
    for entry in entries {
        println!(
            "{:>5}  {}  {:<26} {:<20} {}",
            entry.sequence,
            entry.timestamp.format("%H:%M:%S%.3f"),
            entry.event_type.as_str(),
            entry.node_id.as_deref().unwrap_or("-"),
            entry.actor
        );
        if verbose && !entry.payload.is_null() {
            println!("       {}", entry.payload);
        }
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{}...", cut)
    }
}
