//! `maestro` host binary.

mod config;
mod workers;

use clap::{Parser, Subcommand};
use config::MaestroConfig;
use maestro_core::{
    FileStateStore, InMemoryMemoryStore, InMemoryMetrics, MetricsSink, StateStore, TracingMetrics,
};
use maestro_orchestrator::{
    validate_workflow, Platform, PlatformCollaborators, TaskKind, WorkflowDefinition,
    WorkflowInput, WorkflowStatus,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "maestro", about = "Maestro — multi-agent dispatch and workflow engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "maestro.toml")]
    config: PathBuf,

    /// Emit JSON logs (overrides config)
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the platform and run until Ctrl-C
    Serve,
    /// Validate the config and every workflow file
    Check,
    /// Execute one workflow and print the final execution as JSON
    Run {
        /// Registered workflow id
        workflow_id: String,
        #[arg(long, default_value = "default")]
        workspace: String,
        #[arg(long, default_value = "cli")]
        user: String,
        /// Workflow inputs as a JSON object
        #[arg(long)]
        inputs: Option<String>,
    },
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).compact().init();
    }
}

/// Build the platform and register the configured agents and workflows.
async fn build_platform(
    config: &MaestroConfig,
    metrics: Arc<dyn MetricsSink>,
) -> anyhow::Result<Platform> {
    let state: Option<Arc<dyn StateStore>> = match &config.state_dir {
        Some(dir) => Some(Arc::new(FileStateStore::new(dir.clone()).await?)),
        None => None,
    };
    let platform = Platform::new(
        config.platform.clone(),
        PlatformCollaborators {
            memory: Some(Arc::new(InMemoryMemoryStore::new())),
            state,
            metrics,
            hooks: Vec::new(),
        },
    );

    let ids = platform.registry().register_all(config.agent_entries())?;
    info!(count = ids.len(), "Agents registered");

    for definition in config.load_workflows().await? {
        let id = platform.orchestrator().register_workflow(definition)?;
        info!(workflow = %id, "Workflow loaded");
    }
    Ok(platform)
}

/// Agent tasks whose request type no configured agent can serve.
fn unroutable_tasks(platform: &Platform, definition: &WorkflowDefinition) -> Vec<String> {
    definition
        .tasks
        .iter()
        .filter(|t| t.kind == TaskKind::Agent)
        .filter_map(|t| {
            let request_type = t.request_type.as_deref()?;
            let required = platform.dispatcher().routing().resolve(request_type);
            platform
                .registry()
                .find_by_capabilities(&required)
                .is_empty()
                .then(|| format!("{}.{} ({request_type})", definition.id, t.id))
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = MaestroConfig::load(&cli.config).await?;
    init_tracing(&config.logging.level, cli.json || config.logging.json);

    match cli.command {
        Commands::Serve => {
            let metrics = Arc::new(InMemoryMetrics::new());
            let platform = build_platform(&config, metrics.clone()).await?;
            platform.start();
            info!(
                agents = platform.registry().list_descriptors().len(),
                workflows = platform.orchestrator().list_workflows().len(),
                "Maestro running, press Ctrl-C to stop"
            );

            tokio::signal::ctrl_c().await?;
            info!("Shutdown requested");
            platform.stop().await;

            let summary = metrics.snapshot();
            info!(
                dispatches = summary.dispatches,
                executions = summary.executions,
                execution_failures = summary.execution_failures,
                workflows_completed = summary.workflows_completed,
                workflows_failed = summary.workflows_failed,
                tokens = summary.tokens,
                "Final metrics"
            );
        }
        Commands::Check => {
            for agent in &config.agents {
                agent.spec.validate()?;
            }
            let definitions = config.load_workflows().await?;
            for (path, definition) in config.workflows.iter().zip(&definitions) {
                validate_workflow(definition)
                    .map_err(|e| anyhow::anyhow!("{}: {e}", path.display()))?;
            }
            let platform = build_platform(&config, Arc::new(TracingMetrics)).await?;

            let unroutable: Vec<String> = definitions
                .iter()
                .flat_map(|d| unroutable_tasks(&platform, d))
                .collect();
            for task in &unroutable {
                warn!(task = %task, "No registered agent can serve this task");
            }

            println!("Config OK: {}", cli.config.display());
            println!("  Agents:    {}", config.agents.len());
            println!("  Workflows: {}", config.workflows.len());
            if !unroutable.is_empty() {
                println!("  Unroutable agent tasks:");
                for task in &unroutable {
                    println!("    {task}");
                }
            }
        }
        Commands::Run {
            workflow_id,
            workspace,
            user,
            inputs,
        } => {
            let inputs = match inputs {
                Some(raw) => serde_json::from_str(&raw)
                    .map_err(|e| anyhow::anyhow!("--inputs is not valid JSON: {e}"))?,
                None => serde_json::Value::Null,
            };
            let platform = build_platform(&config, Arc::new(TracingMetrics)).await?;
            platform.start();

            let orchestrator = platform.orchestrator();
            let execution_id = orchestrator.execute_workflow(
                &workflow_id,
                WorkflowInput::new(workspace, user).with_inputs(inputs),
            )?;
            let execution = tokio::select! {
                result = orchestrator.wait_for_completion(execution_id) => result?,
                _ = tokio::signal::ctrl_c() => {
                    orchestrator.cancel_workflow(execution_id).await?;
                    orchestrator.wait_for_completion(execution_id).await?
                }
            };
            platform.stop().await;

            println!("{}", serde_json::to_string_pretty(&execution)?);
            if execution.status != WorkflowStatus::Completed {
                anyhow::bail!(
                    "workflow '{workflow_id}' ended {}: {}",
                    execution.status,
                    execution.error.unwrap_or_default()
                );
            }
        }
    }

    Ok(())
}
