use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use relaycore::{NodeSpec, RetryPolicy, RunEvent, RunStatus, WorkflowDefinition};
use relayruntime::{InMemoryStore, NodeRegistry, RelayRuntime, RuntimeConfig};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "Relay workflow engine CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow file
    Run {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Trigger input as JSON
        #[arg(short, long)]
        input: Option<String>,

        /// Runtime configuration JSON file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate a workflow file
    Validate {
        /// Path to workflow JSON file
        file: PathBuf,
    },

    /// List available node types
    Nodes,

    /// Create a new example workflow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn registry() -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    relaynodes::register_all(&mut registry);
    registry
}

fn load_workflow(file: &Path) -> Result<WorkflowDefinition> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("reading workflow {}", file.display()))?;
    let workflow = serde_json::from_str(&raw)
        .with_context(|| format!("parsing workflow {}", file.display()))?;
    Ok(workflow)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            input,
            config,
            verbose,
        } => {
            init_logging(verbose);
            run_workflow(file, input, config).await?;
        }

        Commands::Validate { file } => {
            init_logging(false);
            validate_workflow(file).await?;
        }

        Commands::Nodes => {
            list_nodes();
        }

        Commands::Init { output } => {
            create_example_workflow(output)?;
        }
    }

    Ok(())
}

async fn run_workflow(file: PathBuf, input: Option<String>, config: Option<PathBuf>) -> Result<()> {
    println!("🚀 Loading workflow from: {}", file.display());
    let workflow = load_workflow(&file)?;

    println!("📋 Workflow: {}", workflow.name);
    println!("   Nodes: {}", workflow.nodes.len());
    println!("   Connections: {}", workflow.connections.len());
    println!();

    let trigger: Value = match input {
        Some(raw) => serde_json::from_str(&raw).context("input must be valid JSON")?,
        None => json!({}),
    };
    let config = match config {
        Some(path) => RuntimeConfig::from_file(&path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => RuntimeConfig::default(),
    };
    tracing::debug!("Runtime config: {:?}", config);

    let store = Arc::new(InMemoryStore::new());
    let workflow_id = store.insert_workflow(workflow).await;
    let runtime = RelayRuntime::new(registry(), store.clone(), config);

    // Subscribe before starting so no event is missed.
    let mut events = runtime.subscribe_all();
    let run_id = runtime.start_run(workflow_id, trigger).await?;

    let event_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if event.run_id().is_some() && event.run_id() != Some(run_id) {
                continue;
            }
            let terminal = event.is_terminal();
            print_event(&event);
            if terminal {
                break;
            }
        }
    });

    let summary = runtime.wait_for_run(run_id).await?;
    let _ = event_task.await;

    println!();
    println!("📊 Execution Summary:");
    println!("   Run ID: {}", run_id);
    println!("   Status: {:?}", summary.status());
    println!(
        "   Completed: {}/{} nodes",
        summary.completed_nodes().len(),
        summary.records.len()
    );
    if !summary.failed_nodes().is_empty() {
        println!("   Failed: {}", summary.failed_nodes().join(", "));
    }
    if !summary.skipped_nodes().is_empty() {
        println!("   Skipped: {}", summary.skipped_nodes().join(", "));
    }

    let outputs: Vec<_> = summary
        .records
        .iter()
        .filter_map(|r| r.output.as_ref().map(|o| (&r.node_id, o.to_value())))
        .collect();
    if !outputs.is_empty() {
        println!();
        println!("📤 Outputs:");
        for (node_id, value) in outputs {
            println!("   {}: {}", node_id, value);
        }
    }

    if summary.status() != RunStatus::Succeeded {
        bail!("run {} finished as {:?}", run_id, summary.status());
    }
    Ok(())
}

fn print_event(event: &RunEvent) {
    match event {
        RunEvent::RunStarted { .. } => println!("▶️  Run started"),
        RunEvent::NodeStarted {
            node_id,
            node_type,
            attempt,
            ..
        } => {
            if *attempt > 1 {
                println!("  ⚡ Starting node: {} ({}), attempt {}", node_id, node_type, attempt);
            } else {
                println!("  ⚡ Starting node: {} ({})", node_id, node_type);
            }
        }
        RunEvent::NodeSucceeded {
            node_id,
            duration_ms,
            ..
        } => println!("  ✅ Node {} completed in {}ms", node_id, duration_ms),
        RunEvent::NodeFailed { node_id, error, .. } => {
            println!("  ❌ Node {} failed: {}", node_id, error.message)
        }
        RunEvent::NodeRetried {
            node_id,
            next_attempt,
            delay_ms,
            error,
            ..
        } => println!(
            "  🔁 Node {} will retry (attempt {}) in {}ms: {}",
            node_id, next_attempt, delay_ms, error.message
        ),
        RunEvent::NodeSkipped { node_id, reason, .. } => {
            println!("  ⏭️  Node {} skipped: {:?}", node_id, reason)
        }
        RunEvent::RunSucceeded { duration_ms, .. } => {
            println!("✨ Run completed successfully in {}ms", duration_ms)
        }
        RunEvent::RunFailed {
            reason,
            failed_nodes,
            duration_ms,
            ..
        } => {
            let nodes: Vec<&str> = failed_nodes.iter().map(|n| n.node_id.as_str()).collect();
            println!(
                "💥 Run failed after {}ms ({:?}): {}",
                duration_ms,
                reason,
                nodes.join(", ")
            );
        }
        RunEvent::RunCancelled { .. } => println!("🛑 Run cancelled"),
        RunEvent::EventsDropped { dropped, .. } => {
            println!("  ⚠️  {} events dropped", dropped)
        }
    }
}

async fn validate_workflow(file: PathBuf) -> Result<()> {
    println!("🔍 Validating workflow: {}", file.display());
    let workflow = load_workflow(&file)?;

    let runtime = RelayRuntime::new(
        registry(),
        Arc::new(InMemoryStore::new()),
        RuntimeConfig::default(),
    );
    let plan = runtime.plan(&workflow)?;

    println!("✅ Workflow is valid:");
    println!("   Name: {}", workflow.name);
    println!("   Nodes: {}", workflow.nodes.len());
    println!("   Connections: {}", workflow.connections.len());
    println!("   Layers:");
    for (index, layer) in plan.layers().iter().enumerate() {
        println!("     {}: {}", index, layer.join(", "));
    }

    Ok(())
}

fn list_nodes() {
    println!("📦 Available Node Types:");
    println!();

    let registry = registry();
    for node_type in registry.list_node_types() {
        if let Some(metadata) = registry.get_metadata(&node_type) {
            println!("  • {} ({})", node_type, metadata.category);
            println!("    {}", metadata.description);
        } else {
            println!("  • {}", node_type);
        }
    }
}

fn create_example_workflow(output: PathBuf) -> Result<()> {
    let mut workflow = WorkflowDefinition::new("Example Branching Workflow");
    workflow.description =
        Some("Routes VIP requests, tags them and joins the branches".to_string());

    workflow.add_node(
        NodeSpec::new("check", "flow.if")
            .with_name("Is VIP?")
            .with_config("field", "vip"),
    );
    workflow.add_node(
        NodeSpec::new("gold", "transform.set")
            .with_name("Tag gold")
            .with_config("values", json!({ "tier": "gold" })),
    );
    workflow.add_node(
        NodeSpec::new("basic", "transform.set")
            .with_name("Tag basic")
            .with_config("values", json!({ "tier": "basic" })),
    );
    workflow.add_node(
        NodeSpec::new("wait", "time.delay")
            .with_name("Throttle")
            .with_config("delay_ms", 250)
            .with_retry(RetryPolicy::exponential(3, 500)),
    );
    workflow.add_node(NodeSpec::new("join", "flow.merge").with_name("Join"));
    workflow.add_node(NodeSpec::new("log", "debug.log").with_name("Log result"));

    workflow.connect_ports("check", 0, "gold", 0);
    workflow.connect_ports("check", 1, "basic", 0);
    workflow.connect("gold", "wait");
    workflow.connect_ports("wait", 0, "join", 0);
    workflow.connect_ports("basic", 0, "join", 1);
    workflow.connect("join", "log");

    let json = serde_json::to_string_pretty(&workflow)?;
    std::fs::write(&output, json)?;

    println!("✨ Created example workflow: {}", output.display());
    println!();
    println!("Run it with:");
    println!("  relay run --file {} --input '{{\"vip\": true}}'", output.display());

    Ok(())
}
