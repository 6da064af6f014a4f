use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use txflow::api::{self, AppState};
use txflow::{
    register_all, ActivityRegistry, Client, ConnectionOptions, Engine, FlowConfig,
    TransactionLatencies, TransactionLedger, WorkerOptions, WorkerPool,
};

const ENV_PORT: &str = "CALLER_API_PORT";
const DEFAULT_PORT: u16 = 7070;

#[derive(Parser)]
#[command(name = "txflow-api")]
#[command(about = "Serve the caller HTTP API with an in-process worker pool", long_about = None)]
#[command(version)]
struct Cli {
    /// Port to listen on [default: $CALLER_API_PORT or 7070]
    #[arg(short, long)]
    port: Option<u16>,

    /// sled database directory; a temporary database when omitted
    #[arg(long)]
    db_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let port = match cli.port {
        Some(port) => port,
        None => match std::env::var(ENV_PORT) {
            Ok(raw) => raw
                .parse()
                .with_context(|| format!("{ENV_PORT} is not a port: {raw}"))?,
            Err(_) => DEFAULT_PORT,
        },
    };

    let mut config = FlowConfig::from_env().map_err(anyhow::Error::msg)?;
    if let Some(path) = cli.db_path {
        config.db_path = Some(path);
    }
    let connection = ConnectionOptions::from_env().context("Failed to load connection options")?;

    let registry = ActivityRegistry::new();
    register_all(&registry, TransactionLedger::new(), &TransactionLatencies::default())?;
    let engine = Engine::open(config, registry).context("Failed to open engine")?;

    let options = WorkerOptions::from_config(engine.config());
    let worker = WorkerPool::new(Arc::clone(&engine), options)
        .start()
        .await
        .context("Unable to start worker")?;
    info!(task_queue = %engine.config().task_queue, "Worker started");

    let state = AppState::new(Client::new(Arc::clone(&engine), connection));
    state.set_worker_running(true);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind port {port}"))?;
    info!("Caller API listening on port {}", port);

    api::serve(listener, state.clone(), async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;

    info!("Shutting down");
    state.set_worker_running(false);
    worker.stop().await?;
    Ok(())
}
