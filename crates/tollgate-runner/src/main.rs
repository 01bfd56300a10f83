use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use tollgate::contract::{ContractStore, TaskContract, TaskProposal};
use tollgate::{AuditLog, DraftGate, ReplayMismatch};
use tollgate_runner::{
    GitVcs, HttpWorker, NoopVcs, Orchestrator, RunnerConfig, VersionControl, WorkerRequest,
    WorkerResponse,
};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Gated implement/review/merge pipeline", long_about = None)]
struct Cli {
    /// Path to tollgate.toml (overrides TOLLGATE_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the orchestrator loop
    Run {
        /// Make a single pass over active tasks and exit
        #[arg(long, default_value_t = false)]
        once: bool,
    },
    /// Create a task contract from a proposal JSON file
    Submit { proposal: PathBuf },
    /// Show active and archived contracts
    Status { task_id: Option<String> },
    /// Start a new attempt for a halted task
    Reset {
        task_id: String,
        /// Why the operator is resetting the task
        #[arg(long)]
        reason: String,
    },
    /// Replay the transition log through the transition table
    Replay,
    /// Print the JSON schema of the worker protocol
    Schema,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.as_str().into()),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Command::Schema = cli.command {
        return print_schema();
    }

    let config = RunnerConfig::load(cli.config.as_deref())?;
    match cli.command {
        Command::Run { once } => run(config, once).await,
        Command::Submit { proposal } => submit(&config, &proposal),
        Command::Status { task_id } => status(&config, task_id.as_deref()),
        Command::Reset { task_id, reason } => reset(&config, &task_id, &reason),
        Command::Replay => replay(&config),
        Command::Schema => print_schema(),
    }
}

async fn run(config: RunnerConfig, once: bool) -> Result<()> {
    let worker =
        Arc::new(HttpWorker::new(&config.worker).context("Failed to build worker client")?);
    worker
        .open()
        .await
        .with_context(|| format!("Worker at {} is unreachable", config.worker.url))?;

    let vcs: Box<dyn VersionControl> = if config.git.enabled {
        Box::new(
            GitVcs::new(&config.gate.workspace_root, config.git.main_branch.clone())
                .context("Failed to open workspace repository")?
                .with_retries(config.git.max_retries),
        )
    } else {
        info!("Git integration disabled");
        Box::new(NoopVcs)
    };

    let mut orchestrator = Orchestrator::new(config, worker.clone(), vcs)?;
    let cancel = orchestrator.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping after the current step");
            cancel.cancel();
        }
    });

    let result = orchestrator.run(once).await;
    worker.close();
    result
}

fn open_store(config: &RunnerConfig) -> Result<ContractStore> {
    ContractStore::open(&config.gate.state_dir).with_context(|| {
        format!(
            "Failed to open contract store at {}",
            config.gate.state_dir.display()
        )
    })
}

fn submit(config: &RunnerConfig, path: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read proposal {}", path.display()))?;
    let proposal: TaskProposal = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid proposal {}", path.display()))?;

    let gate = DraftGate::new(&config.gate).context("Failed to initialise draft gate")?;
    let contract = open_store(config)?
        .create(&proposal, gate.validator(), &config.gate.workspace_root)
        .map_err(|e| anyhow::anyhow!(e.with_suggestion()))?;
    println!("{} {} (attempt {})", contract.task_id, contract.status, contract.attempt);
    Ok(())
}

fn status(config: &RunnerConfig, task_id: Option<&str>) -> Result<()> {
    let store = open_store(config)?;
    let wanted = |c: &TaskContract| task_id.map_or(true, |id| c.task_id == id);

    let active: Vec<TaskContract> = store.list_active()?.into_iter().filter(wanted).collect();
    let archived: Vec<TaskContract> = store.list_archived()?.into_iter().filter(wanted).collect();
    if active.is_empty() && archived.is_empty() {
        if let Some(id) = task_id {
            bail!("No contract for task {id}");
        }
        println!("No contracts.");
        return Ok(());
    }

    if !active.is_empty() {
        println!("Active:");
        for c in &active {
            print_contract(c);
        }
    }
    if !archived.is_empty() {
        println!("Archived:");
        for c in &archived {
            print_contract(c);
        }
    }
    Ok(())
}

fn print_contract(c: &TaskContract) {
    let b = &c.breaker;
    println!(
        "  {:<24} {:<28} attempt={} reviews={} rebuttals={} tokens={} cost=${:.2} breaker={:?}",
        c.task_id,
        c.status.to_string(),
        c.attempt,
        b.review_cycle_count(),
        b.rebuttal_count(),
        b.tokens_used(),
        b.cost_usd(),
        b.state(),
    );
    if let Some(lock) = &c.lock {
        println!("    locked by {} until {}", lock.holder, lock.expires_at);
    }
    if !c.status_reason.is_empty() {
        println!("    {}", c.status_reason);
    }
}

fn reset(config: &RunnerConfig, task_id: &str, reason: &str) -> Result<()> {
    let store = open_store(config)?;
    let (contract, entry) = store
        .reset_from_archive(task_id, reason)
        .map_err(|e| anyhow::anyhow!(e.with_suggestion()))?;
    AuditLog::new(config.gate.transition_log_path())
        .append(&entry)
        .context("Failed to append reset to the transition log")?;
    info!(task_id, attempt = contract.attempt, "Task reset");
    println!("{} {} (attempt {})", contract.task_id, contract.status, contract.attempt);
    Ok(())
}

fn replay(config: &RunnerConfig) -> Result<()> {
    let audit = AuditLog::new(config.gate.transition_log_path());
    let report = audit
        .verify_replay()
        .with_context(|| format!("Failed to read {}", audit.path().display()))?;

    println!(
        "{} entries, {} tasks, {} malformed lines",
        report.entries_checked, report.tasks_seen, report.malformed_lines
    );
    for mismatch in &report.mismatches {
        match mismatch {
            ReplayMismatch::Diverged { line, task_id, expected, logged } => {
                println!("  line {line}: {task_id} logged {logged}, table gives {expected}");
            }
            ReplayMismatch::NoEdge { line, task_id, from, event } => {
                println!("  line {line}: {task_id} has no edge for {event:?} from {from}");
            }
            ReplayMismatch::ChainBreak { line, task_id, previous, logged_from } => {
                println!("  line {line}: {task_id} starts at {logged_from}, was {previous}");
            }
        }
    }
    if !report.is_clean() {
        warn!(mismatches = report.mismatches.len(), "Replay found inconsistencies");
        bail!("transition log does not replay cleanly");
    }
    println!("Replay clean.");
    Ok(())
}

fn print_schema() -> Result<()> {
    let schema = serde_json::json!({
        "request": schemars::schema_for!(WorkerRequest),
        "response": schemars::schema_for!(WorkerResponse),
    });
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}
