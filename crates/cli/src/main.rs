//! `rusty-orchestrator` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate`: check a workflow JSON file and print its stages.
//! - `run`: execute a workflow file with echo workers, printing events as JSON lines.
//! - `serve`: start the API server.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use engine::{validate_spec, EngineConfig, EngineSupervisor, WorkerRegistration, WorkflowSpec};
use tokio_stream::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use workers::{Capability, EchoWorker, Worker};

#[derive(Parser)]
#[command(
    name = "rusty-orchestrator",
    about = "Adaptive multi-agent workflow orchestration engine",
    version
)]
struct Cli {
    /// Engine configuration file (JSON). Defaults apply when omitted.
    #[arg(long, global = true, env = "ORCHESTRATOR_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a workflow definition JSON file.
    Validate {
        /// Path to the workflow JSON file.
        path: PathBuf,
    },
    /// Execute a workflow file with an echo worker for every capability it uses.
    Run {
        path: PathBuf,
        /// Concurrent tasks per echo worker.
        #[arg(long, default_value_t = 4)]
        worker_capacity: usize,
    },
    /// Start the REST API server.
    Serve {
        #[arg(long, default_value = "0.0.0.0:8080")]
        bind: String,
        /// Capabilities served by the built-in echo worker. Defaults to the
        /// configured catalog, or `general` when the catalog is open.
        #[arg(long = "capability")]
        capabilities: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("cannot load config {}", path.display()))?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Command::Validate { path } => validate(&config, &path),
        Command::Run {
            path,
            worker_capacity,
        } => run(config, &path, worker_capacity).await,
        Command::Serve { bind, capabilities } => serve(config, &bind, capabilities).await,
    }
}

fn read_spec(path: &Path) -> Result<WorkflowSpec> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read file {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("invalid workflow JSON in {}", path.display()))
}

fn validate(config: &EngineConfig, path: &Path) -> Result<()> {
    let spec = read_spec(path)?;
    match validate_spec(&spec, config) {
        Ok(graph) => {
            println!("Workflow '{}' is valid ({} steps).", spec.name, graph.len());
            for (i, stage) in graph.stages().iter().enumerate() {
                println!("  stage {i}: {}", stage.join(", "));
            }
            println!("Execution order: {}", graph.topological_ids().join(" -> "));
            Ok(())
        }
        Err(e) => {
            eprintln!("Validation failed: {e}");
            std::process::exit(1);
        }
    }
}

fn echo_worker(
    supervisor: &EngineSupervisor,
    capabilities: BTreeSet<Capability>,
    max_concurrent_tasks: usize,
) -> Result<()> {
    let worker: Arc<dyn Worker> = Arc::new(EchoWorker::new("echo", capabilities.iter().cloned()));
    supervisor.register_worker(
        WorkerRegistration::new("echo", worker)
            .with_capabilities(capabilities)
            .with_max_concurrent_tasks(max_concurrent_tasks),
    )?;
    Ok(())
}

async fn run(config: EngineConfig, path: &Path, worker_capacity: usize) -> Result<()> {
    let spec = read_spec(path)?;
    let supervisor = EngineSupervisor::new(config)?;
    let capabilities = spec
        .steps
        .iter()
        .map(|s| s.required_capability.clone())
        .collect();
    echo_worker(&supervisor, capabilities, worker_capacity)?;

    let handle = supervisor.create_workflow(spec)?;
    let mut events = supervisor.execute_workflow(handle.workflow_id)?;
    let mut last = None;

    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else { break };
                println!("{}", serde_json::to_string(&event)?);
                last = Some(event.name());
            }
            _ = tokio::signal::ctrl_c() => {
                warn!(workflow_id = %handle.workflow_id, "interrupted; cancelling workflow");
                supervisor.cancel_workflow(handle.workflow_id)?;
            }
        }
    }

    match last {
        Some("workflow_completed") => Ok(()),
        Some(outcome) => bail!("workflow '{}' ended with {outcome}", handle.name),
        None => bail!("workflow '{}' produced no events", handle.name),
    }
}

async fn serve(config: EngineConfig, bind: &str, capabilities: Vec<String>) -> Result<()> {
    let capabilities: BTreeSet<Capability> = if !capabilities.is_empty() {
        capabilities
            .iter()
            .map(|c| Capability::new(c))
            .collect::<Result<_, _>>()?
    } else if !config.capabilities.is_empty() {
        config.capabilities.clone()
    } else {
        BTreeSet::from([Capability::new("general")?])
    };

    let supervisor = EngineSupervisor::new(config)?;
    echo_worker(&supervisor, capabilities, supervisor.config().max_parallel_steps)?;

    info!("Starting API server on {bind}");
    api::serve(bind, supervisor.clone()).await?;
    supervisor.shutdown();
    Ok(())
}
