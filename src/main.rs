//! # CMDB Scheduler Daemon
//!
//! Watches the configuration-management database and fans machine refresh
//! work out to executors, on change and on a cron-like schedule.
//!
//! Usage:
//!   cmdb serve                          # Run with ~/.cmdb/config.toml
//!   cmdb serve --schedule "@every 30m"  # Override the schedule
//!   cmdb next "0 */15 * * * *" -n 5     # Preview upcoming activations
//!   cmdb init                           # Write a default config

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use cmdb_core::config::StorageConfig;
use cmdb_core::{CmdbConfig, MemoryStorage, Object, Storage};
use cmdb_scheduler::{ChannelExecutor, CronSchedule, EngineOptions, ExecutorJob, SchedulerEngine};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cmdb", version, about = "🗄️ CMDB: reactive machine inventory scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until interrupted
    Serve {
        /// Config file (default: ~/.cmdb/config.toml)
        #[arg(short, long)]
        config: Option<String>,

        /// Schedule expression, overrides the config file
        #[arg(short, long)]
        schedule: Option<String>,
    },
    /// Print the next activations of a schedule expression
    Next {
        expr: String,

        #[arg(short = 'n', long, default_value = "5")]
        count: usize,
    },
    /// Write a default config file
    Init {
        /// Target path (default: ~/.cmdb/config.toml)
        #[arg(short, long)]
        config: Option<String>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

fn init_logging(verbose: bool, json: bool) {
    let filter = if verbose {
        "cmdb=debug,cmdb_core=debug,cmdb_scheduler=debug"
    } else {
        "cmdb=info,cmdb_core=info,cmdb_scheduler=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    match cli.command {
        Command::Serve { config, schedule } => serve(config, schedule).await,
        Command::Next { expr, count } => next(&expr, count),
        Command::Init { config, force } => init(config, force),
    }
}

async fn serve(config_path: Option<String>, schedule: Option<String>) -> Result<()> {
    let config = match config_path.as_deref() {
        Some(path) => CmdbConfig::load_from(&expand_path(path))?,
        None => CmdbConfig::load()?,
    };
    let schedule = schedule.unwrap_or_else(|| config.scheduler.schedule.clone());

    let storage = match config.storage {
        StorageConfig::Memory { watch_channel_size } => {
            Arc::new(MemoryStorage::new(watch_channel_size))
        }
    };

    let mut engine = SchedulerEngine::new(&schedule)?
        .with_options(EngineOptions::from_config(&config.scheduler));
    engine.prepare(Arc::clone(&storage));

    let mut workers = Vec::with_capacity(config.executor.count);
    for i in 0..config.executor.count {
        let id = format!("executor-{i}");
        let (executor, rx) = ChannelExecutor::channel(&id, config.executor.queue_capacity);
        engine.register_executor(Arc::new(executor))?;
        workers.push(tokio::spawn(run_worker(id, rx)));
    }

    println!("🗄️ CMDB Scheduler v{}", env!("CARGO_PKG_VERSION"));
    println!("   📅 Schedule:  {schedule}");
    println!("   🧰 Executors: {}", config.executor.count);
    println!();

    let handle = engine.handle();
    tokio::spawn(async move {
        shutdown_signal().await;
        handle.stop();
    });

    let reason = engine.serve().await?;

    // The handler is gone once serve returns, so every executor queue is
    // closed and the workers finish what they already received.
    for worker in workers {
        if let Err(e) = worker.await {
            tracing::error!(error = %e, "Executor worker panicked");
        }
    }
    storage.close().await.context("Failed to close storage")?;

    if !reason.is_graceful() {
        anyhow::bail!("Scheduler stopped: {reason}");
    }
    Ok(())
}

async fn run_worker(id: String, mut rx: mpsc::Receiver<ExecutorJob>) {
    while let Some(job) = rx.recv().await {
        match &job {
            ExecutorJob::RefreshDigest(digest) => {
                tracing::info!(executor = %id, digest = %digest.guid(), "🔄 Refreshing machine digest");
            }
            ExecutorJob::RefreshDiscovered(latest) => {
                tracing::info!(
                    executor = %id,
                    state = %latest.state,
                    machines = latest.machines.len(),
                    "🔄 Refreshing discovered machines"
                );
            }
        }
    }
    tracing::debug!(executor = %id, "Executor worker exited");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn next(expr: &str, count: usize) -> Result<()> {
    let schedule = CronSchedule::parse(expr)?;
    let upcoming = schedule.upcoming(Utc::now(), count);
    if upcoming.is_empty() {
        println!("⏳ '{}' has no defined next activation", schedule.expr());
        return Ok(());
    }
    println!("📅 Next activations of '{}':", schedule.expr());
    for at in upcoming {
        println!("   {}", at.to_rfc3339());
    }
    Ok(())
}

fn init(config_path: Option<String>, force: bool) -> Result<()> {
    let path = config_path
        .as_deref()
        .map(expand_path)
        .unwrap_or_else(CmdbConfig::default_path);
    if path.exists() && !force {
        println!("⚠️  Config already exists at {} (use --force to overwrite)", path.display());
        return Ok(());
    }
    CmdbConfig::default().save_to(&path)?;
    println!("✅ Default config written to {}", path.display());
    Ok(())
}
