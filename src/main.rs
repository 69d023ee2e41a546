use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use cluster_lcm::config::{ControllerConfig, QueuedPolicy, ShellConfig};
use cluster_lcm::facts::{FactStore, JsonFileFactStore};
use cluster_lcm::scheduler::{Execution, NewConfiguration};
use cluster_lcm::shutdown::{install_shutdown_handler, ShutdownReport};
use cluster_lcm::worker::{ShellRunner, StaticCatalog};
use cluster_lcm::{Controller, ControllerSnapshot, SubmitRequest};

#[derive(Parser, Debug)]
#[command(name = "cluster-lcm")]
#[command(version)]
#[command(about = "Storage cluster lifecycle execution controller")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Submit every configuration of a plan and wait for the executions
    Run(RunArgs),

    /// List recorded facts
    Facts(FactsArgs),
}

// =============================================================================
// Run Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RunArgs {
    /// Playbook catalog (JSON array of playbook templates)
    #[arg(long)]
    catalog: PathBuf,

    /// Plan (JSON array of configurations to create and run)
    #[arg(long)]
    plan: PathBuf,

    /// Fact store file
    #[arg(long, default_value = "facts.json")]
    facts: PathBuf,

    /// Controller state file, restored on start and written on exit
    #[arg(long)]
    state: Option<PathBuf>,

    /// Number of workers (0 = one per CPU)
    #[arg(long, default_value = "0")]
    workers: usize,

    /// Maximum duration of one execution, in seconds
    #[arg(long, default_value = "3600")]
    timeout_secs: u64,

    /// Time granted to running executions on shutdown, in seconds
    #[arg(long, default_value = "30")]
    grace_secs: u64,

    /// Maximum number of queued executions
    #[arg(long, default_value = "64")]
    queue_capacity: usize,

    /// Days a finished execution is kept in the state file
    #[arg(long, default_value = "90")]
    retention_days: u64,

    /// Fail queued executions on shutdown instead of keeping them
    #[arg(long)]
    fail_queued: bool,

    /// Shell used to run step commands
    #[arg(long, default_value = "sh")]
    shell: String,

    /// Who is submitting
    #[arg(long, default_value = "cli")]
    initiator: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Parser, Debug)]
struct FactsArgs {
    /// Fact store file
    #[arg(long, default_value = "facts.json")]
    facts: PathBuf,

    /// Cluster to list
    #[arg(long)]
    cluster: String,

    /// Restrict to one host
    #[arg(long)]
    host: Option<String>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct ExecutionOutput {
    execution_id: String,
    configuration_id: String,
    version: u64,
    cluster_id: String,
    playbook: String,
    state: String,
    failed_step: Option<u32>,
    message: Option<String>,
    log: String,
}

impl From<&Execution> for ExecutionOutput {
    fn from(exec: &Execution) -> Self {
        Self {
            execution_id: exec.id.to_string(),
            configuration_id: exec.configuration_id.to_string(),
            version: exec.configuration_version,
            cluster_id: exec.cluster_id.clone(),
            playbook: exec.playbook.clone(),
            state: exec.state.to_string(),
            failed_step: exec.failure.as_ref().and_then(|f| f.step_index),
            message: exec.failure.as_ref().map(|f| f.message.clone()),
            log: exec.log(),
        }
    }
}

#[derive(Serialize)]
struct RunOutput {
    executions: Vec<ExecutionOutput>,
    rejected: Vec<String>,
    shutdown: Option<ShutdownReport>,
}

// =============================================================================
// Run
// =============================================================================

async fn run(args: RunArgs) -> Result<bool, Box<dyn std::error::Error>> {
    let config = ControllerConfig::default()
        .with_workers(args.workers)
        .with_execution_timeout(Duration::from_secs(args.timeout_secs))
        .with_shutdown_grace(Duration::from_secs(args.grace_secs))
        .with_queue_capacity(args.queue_capacity)
        .with_retention_days(args.retention_days)
        .with_queued_policy(if args.fail_queued {
            QueuedPolicy::Fail
        } else {
            QueuedPolicy::Retain
        });

    let catalog = Arc::new(StaticCatalog::load(&args.catalog)?);
    let plan: Vec<NewConfiguration> = serde_json::from_slice(&std::fs::read(&args.plan)?)?;
    let facts: Arc<dyn FactStore> = Arc::new(JsonFileFactStore::open(&args.facts)?);
    let runner = Arc::new(ShellRunner::new(ShellConfig {
        shell: args.shell,
        ..ShellConfig::default()
    }));

    let controller = match &args.state {
        Some(path) if path.exists() => {
            let snapshot = ControllerSnapshot::load(path)?;
            Controller::restore(config, catalog, runner, facts, snapshot).await?
        }
        _ => Controller::new(config, catalog, runner, facts),
    };

    let shutdown = install_shutdown_handler();
    controller.start().await?;

    let mut submitted = Vec::new();
    let mut rejected = Vec::new();
    for new in plan {
        let name = new.name.clone();
        let configuration = controller.configurations().create(new).await?;
        match controller
            .submit(SubmitRequest::latest(configuration.id, &args.initiator))
            .await
        {
            Ok(exec) => submitted.push(exec.id),
            Err(e) => {
                tracing::warn!(
                    configuration = %name,
                    error = %e,
                    retry_later = e.is_transient(),
                    "Not submitted"
                );
                rejected.push(format!("{}: {}", name, e));
            }
        }
    }

    let wait_all = async {
        for id in &submitted {
            if let Err(e) = controller.wait_terminal(*id).await {
                tracing::warn!(execution_id = %id, error = %e, "Stopped waiting for execution");
            }
        }
    };

    let interrupted = tokio::select! {
        _ = wait_all => false,
        _ = shutdown.cancelled() => true,
    };
    let report = controller.shutdown().await;

    let mut executions = Vec::new();
    for id in &submitted {
        if let Some(exec) = controller.execution(*id).await {
            executions.push(exec);
        }
    }

    if let Some(path) = &args.state {
        controller.purge_expired().await;
        controller.snapshot().await.save(path)?;
        tracing::info!(path = %path.display(), "Controller state saved");
    }
    let all_succeeded = rejected.is_empty()
        && executions
            .iter()
            .all(|e| e.state == cluster_lcm::scheduler::ExecutionState::Success);

    match args.output {
        OutputFormat::Json => {
            let output = RunOutput {
                executions: executions.iter().map(ExecutionOutput::from).collect(),
                rejected,
                shutdown: interrupted.then_some(report),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if executions.is_empty() {
                println!("No executions.");
            } else {
                println!(
                    "{:<38} {:<14} {:<20} STATE",
                    "EXECUTION ID", "CLUSTER", "PLAYBOOK"
                );
                println!("{}", "-".repeat(96));
                for exec in &executions {
                    println!(
                        "{:<38} {:<14} {:<20} {}",
                        exec.id, exec.cluster_id, exec.playbook, exec.state
                    );
                }
                for exec in executions.iter().filter(|e| e.failure.is_some()) {
                    println!();
                    println!("Execution {} ({})", exec.id, exec.state);
                    print!("{}", exec.log());
                }
            }
            for line in &rejected {
                println!("Rejected: {}", line);
            }
            if interrupted {
                println!();
                println!(
                    "Interrupted: {} completed, {} forced, {} queued kept, {} queued failed",
                    report.completed.len(),
                    report.forced.len(),
                    report.queued_retained.len(),
                    report.queued_failed.len()
                );
            }
        }
    }

    Ok(all_succeeded)
}

// =============================================================================
// Facts
// =============================================================================

fn list_facts(args: FactsArgs) -> Result<(), Box<dyn std::error::Error>> {
    let store = JsonFileFactStore::open(&args.facts)?;
    let facts = match &args.host {
        Some(host) => store.list_host(&args.cluster, host)?,
        None => store.list_cluster(&args.cluster)?,
    };

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&facts)?),
        OutputFormat::Table => {
            if facts.is_empty() {
                println!("No facts found.");
            } else {
                println!("{:<20} {:<24} VALUE", "HOST", "KEY");
                println!("{}", "-".repeat(70));
                for fact in &facts {
                    println!("{:<20} {:<24} {}", fact.host, fact.key, fact.value);
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Run(run_args) => {
            if !run(run_args).await? {
                std::process::exit(1);
            }
        }
        Commands::Facts(facts_args) => list_facts(facts_args)?,
    }

    Ok(())
}
