use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use txflow::{
    register_all, ActivityRegistry, Engine, FlowConfig, TransactionLatencies, TransactionLedger,
    WorkerOptions, WorkerPool,
};

#[derive(Parser)]
#[command(name = "txflow-worker")]
#[command(about = "Drive work persisted by a previous process to completion")]
#[command(long_about = "Recovers interrupted activity tasks and unfinished instances from the sled \
database and drives them to a terminal phase. The database is locked by one process at a time, \
so new transactions are not accepted here: use txflow-api or txflow-driver to start them.")]
#[command(version)]
struct Cli {
    /// sled database directory
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Task queue to poll
    #[arg(short, long)]
    task_queue: Option<String>,

    /// Skip recovery of persisted work on startup
    #[arg(long)]
    no_recover: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = FlowConfig::from_env().map_err(anyhow::Error::msg)?;
    if let Some(path) = cli.db_path {
        config.db_path = Some(path);
    }
    if let Some(queue) = cli.task_queue {
        config.task_queue = queue;
    }

    let registry = ActivityRegistry::new();
    register_all(&registry, TransactionLedger::new(), &TransactionLatencies::default())?;
    let engine = Engine::open(config, registry).context("Failed to open engine")?;

    let mut options = WorkerOptions::from_config(engine.config());
    options.recover_on_start = !cli.no_recover;
    let worker = WorkerPool::new(Arc::clone(&engine), options)
        .start()
        .await
        .context("Unable to start worker")?;
    info!(recovery = ?worker.recovery(), "Worker running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down worker");
    worker.stop().await?;
    Ok(())
}
