mod config;
mod pids;
mod process;
mod shutdown;
mod state_dir;
mod worker;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use queuectl_core::{JobState, LifecycleManager, SystemClock};
use queuectl_sqlite::SqliteStore;
use std::str::FromStr;

use crate::config::FileConfig;
use crate::state_dir::StateDir;

#[derive(Parser)]
#[command(name = "queuectl")]
#[command(about = "CLI-based background job queue system")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Override the state directory (default: ~/.queuectl).
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Enqueue a new job.
    Enqueue {
        /// JSON string with job data, e.g. '{"id":"job1","command":"sleep 2"}'
        job_json: Option<String>,

        /// Read job JSON from a file instead of the argument.
        #[arg(long, short = 'f')]
        file: Option<PathBuf>,
    },

    /// Manage worker processes.
    Worker {
        #[command(subcommand)]
        command: WorkerCommands,
    },

    /// Show summary of job states and active workers.
    Status,

    /// List jobs, optionally filtered by state.
    List {
        #[arg(long)]
        state: Option<String>,
    },

    /// Manage the Dead Letter Queue.
    Dlq {
        #[command(subcommand)]
        command: DlqCommands,
    },

    /// Manage configuration.
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum WorkerCommands {
    /// Start one or more worker processes.
    Start {
        #[arg(long, default_value_t = 1)]
        count: u32,
    },
    /// Stop all running worker processes gracefully.
    Stop,
    /// Run a single worker loop in this process. Internal: used by `worker
    /// start` to re-invoke the binary as an independent OS process.
    #[command(hide = true, name = "run-one")]
    RunOne {
        #[arg(long)]
        worker_id: String,
    },
}

#[derive(Subcommand)]
enum DlqCommands {
    /// List all jobs in the Dead Letter Queue.
    List,
    /// Retry a job from the Dead Letter Queue.
    Retry { job_id: String },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Get configuration value(s).
    Get { key: Option<String> },
    /// Set a configuration value.
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let state_dir = StateDir::resolve(cli.state_dir.as_deref())?;

    match cli.command {
        Commands::Enqueue { job_json, file } => enqueue(&state_dir, job_json, file).await,
        Commands::Worker { command } => match command {
            WorkerCommands::Start { count } => worker_start(&state_dir, count).await,
            WorkerCommands::Stop => worker_stop(&state_dir),
            WorkerCommands::RunOne { worker_id } => worker_run_one(&state_dir, worker_id).await,
        },
        Commands::Status => status(&state_dir).await,
        Commands::List { state } => list(&state_dir, state).await,
        Commands::Dlq { command } => match command {
            DlqCommands::List => dlq_list(&state_dir).await,
            DlqCommands::Retry { job_id } => dlq_retry(&state_dir, job_id).await,
        },
        Commands::Config { command } => match command {
            ConfigCommands::Get { key } => config_get(&state_dir, key),
            ConfigCommands::Set { key, value } => config_set(&state_dir, key, value),
        },
    }
}

async fn open_lifecycle(
    state_dir: &StateDir,
) -> anyhow::Result<LifecycleManager<SqliteStore, SystemClock>> {
    let file_config = FileConfig::load(&state_dir.config_json())?;
    let store = SqliteStore::connect(state_dir.jobs_db().to_str().unwrap()).await?;
    Ok(LifecycleManager::new(
        Arc::new(store),
        Arc::new(SystemClock),
        file_config.to_queue_config(),
    ))
}

async fn enqueue(
    state_dir: &StateDir,
    job_json: Option<String>,
    file: Option<PathBuf>,
) -> anyhow::Result<()> {
    let raw = if let Some(path) = file {
        std::fs::read_to_string(path)?.trim().to_string()
    } else if let Some(json) = job_json {
        json
    } else {
        anyhow::bail!("either provide JOB_JSON argument or use --file option");
    };

    let data: serde_json::Value =
        serde_json::from_str(&raw).map_err(|e| anyhow::anyhow!("invalid JSON input: {e}"))?;

    let lifecycle = open_lifecycle(state_dir).await?;
    let job = lifecycle.enqueue(data).await?;

    println!("Job enqueued successfully:");
    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}

async fn worker_start(state_dir: &StateDir, count: u32) -> anyhow::Result<()> {
    if count < 1 {
        anyhow::bail!("count must be at least 1");
    }

    let pids_path = state_dir.worker_pids_json();
    let existing = pids::load(&pids_path);
    if !existing.is_empty() {
        println!(
            "Warning: found {} existing worker process(es) registered",
            existing.len()
        );
    }

    let new_pids = process::spawn_workers(count, state_dir_root(state_dir))?;
    let mut all_pids = existing;
    all_pids.extend(new_pids);
    pids::save(&pids_path, &all_pids)?;

    println!("\nStarted {count} worker(s). Use 'queuectl worker stop' to stop them.");
    Ok(())
}

fn worker_stop(state_dir: &StateDir) -> anyhow::Result<()> {
    let stopped = pids::stop_all(&state_dir.worker_pids_json())?;
    if stopped > 0 {
        println!("Stopped {stopped} worker(s)");
    } else {
        println!("No running workers found");
    }
    Ok(())
}

async fn worker_run_one(state_dir: &StateDir, worker_id: String) -> anyhow::Result<()> {
    let file_config = FileConfig::load(&state_dir.config_json())?;
    let config = file_config.to_queue_config();
    let store = SqliteStore::connect(state_dir.jobs_db().to_str().unwrap()).await?;
    let lifecycle = Arc::new(LifecycleManager::new(
        Arc::new(store),
        Arc::new(SystemClock),
        config,
    ));

    let token = shutdown::ShutdownToken::new();
    shutdown::install(token.clone());

    let loop_ = worker::WorkerLoop::new(worker_id, lifecycle, config, token);
    loop_.run().await;
    Ok(())
}

async fn status(state_dir: &StateDir) -> anyhow::Result<()> {
    let lifecycle = open_lifecycle(state_dir).await?;
    let stats = lifecycle.get_stats().await?;

    println!("=== QueueCTL Status ===\n");
    println!("Job States:");
    println!("  {:12} {:4}", "pending", stats.pending);
    println!("  {:12} {:4}", "processing", stats.processing);
    println!("  {:12} {:4}", "completed", stats.completed);
    println!("  {:12} {:4}", "failed", stats.failed);
    println!("  {:12} {:4}", "dead", stats.dead);
    println!("  {:12} {:4}", "total", stats.total());

    println!("\nActive Workers:");
    let pids_path = state_dir.worker_pids_json();
    let recorded = pids::load(&pids_path);
    if recorded.is_empty() {
        println!("  No active workers");
    } else {
        let mut alive = Vec::new();
        for pid in &recorded {
            if pids::is_running(*pid) {
                println!("  Worker (PID: {pid}) - Running");
                alive.push(*pid);
            } else {
                println!("  Worker (PID: {pid}) - Not running");
            }
        }
        if alive.len() != recorded.len() {
            pids::save(&pids_path, &alive)?;
        }
    }

    println!("\nConfiguration:");
    let file_config = FileConfig::load(&state_dir.config_json())?;
    for (key, value) in file_config.entries() {
        println!("  {}: {value}", config::snake_to_kebab(key));
    }

    Ok(())
}

async fn list(state_dir: &StateDir, state: Option<String>) -> anyhow::Result<()> {
    let lifecycle = open_lifecycle(state_dir).await?;
    let state_filter = match &state {
        Some(s) => Some(
            JobState::from_str(s).map_err(|_| anyhow::anyhow!("invalid state: {s}"))?,
        ),
        None => None,
    };
    let jobs = lifecycle.list_jobs(state_filter, None).await?;

    if jobs.is_empty() {
        let suffix = state.map(|s| format!(" with state '{s}'")).unwrap_or_default();
        println!("No jobs found{suffix}");
        return Ok(());
    }

    println!("Found {} job(s):\n", jobs.len());
    for job in jobs {
        println!("ID: {}", job.id);
        println!("  Command: {}", job.command);
        println!("  State: {}", job.state);
        println!("  Attempts: {}/{}", job.attempts, job.max_retries);
        println!("  Created: {}", queuectl_core::format_timestamp(job.created_at));
        if let Some(next_retry_at) = job.next_retry_at {
            println!("  Next Retry: {}", queuectl_core::format_timestamp(next_retry_at));
        }
        println!();
    }
    Ok(())
}

async fn dlq_list(state_dir: &StateDir) -> anyhow::Result<()> {
    let lifecycle = open_lifecycle(state_dir).await?;
    let dead_jobs = lifecycle.list_jobs(Some(JobState::Dead), None).await?;

    if dead_jobs.is_empty() {
        println!("No jobs in Dead Letter Queue");
        return Ok(());
    }

    println!("Found {} job(s) in Dead Letter Queue:\n", dead_jobs.len());
    for job in dead_jobs {
        println!("ID: {}", job.id);
        println!("  Command: {}", job.command);
        println!("  Attempts: {}/{}", job.attempts, job.max_retries);
        println!("  Failed at: {}", queuectl_core::format_timestamp(job.updated_at));
        println!();
    }
    Ok(())
}

async fn dlq_retry(state_dir: &StateDir, job_id: String) -> anyhow::Result<()> {
    let lifecycle = open_lifecycle(state_dir).await?;
    if lifecycle.retry_dead_job(&job_id).await? {
        println!("Job '{job_id}' moved back to pending queue");
        Ok(())
    } else {
        anyhow::bail!("job '{job_id}' not found or not in Dead Letter Queue");
    }
}

fn config_get(state_dir: &StateDir, key: Option<String>) -> anyhow::Result<()> {
    let file_config = FileConfig::load(&state_dir.config_json())?;
    match key {
        Some(key) => {
            let internal_key = config::kebab_to_snake(&key);
            match file_config.get(&internal_key) {
                Some(value) => println!("{key} = {value}"),
                None => anyhow::bail!("configuration key '{key}' not found"),
            }
        }
        None => {
            println!("Configuration:");
            for (key, value) in file_config.entries() {
                println!("  {} = {value}", config::snake_to_kebab(key));
            }
        }
    }
    Ok(())
}

fn config_set(state_dir: &StateDir, key: String, value: String) -> anyhow::Result<()> {
    let internal_key = config::kebab_to_snake(&key);
    let parsed = config::parse_config_value(&internal_key, &value)?;

    let path = state_dir.config_json();
    let mut file_config = FileConfig::load(&path)?;
    file_config.set(&internal_key, parsed);
    file_config.save(&path)?;

    println!("Set {key} = {value}");
    Ok(())
}

fn state_dir_root(state_dir: &StateDir) -> &std::path::Path {
    state_dir.root_path()
}
