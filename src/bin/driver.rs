use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use txflow::{
    register_all, ActivityRegistry, Client, ConnectionOptions, Engine, FlowConfig, ResultsStore,
    Scenario, Transaction, TransactionLatencies, TransactionLedger, WorkerOptions, WorkerPool,
};

#[derive(Parser)]
#[command(name = "txflow-driver")]
#[command(about = "Run the transaction latency scenarios", long_about = None)]
#[command(version)]
struct Cli {
    /// Scenario to run: local, regular, update-with-start or eager
    #[arg(short, long, default_value = "update-with-start", value_parser = parse_scenario)]
    scenario: Scenario,

    /// Run every scenario in turn
    #[arg(long)]
    all: bool,

    #[arg(short = 'n', long, default_value_t = 1)]
    iterations: usize,

    #[arg(long, default_value = "Bob")]
    from: String,

    #[arg(long, default_value = "Alice")]
    to: String,

    #[arg(long, default_value_t = 100)]
    amount: i64,

    /// sled database directory; a temporary database when omitted
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Print the collected reports as JSON
    #[arg(long)]
    json: bool,
}

fn parse_scenario(s: &str) -> std::result::Result<Scenario, String> {
    s.parse()
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
    if let Some(path) = cli.db_path.clone() {
        config.db_path = Some(path);
    }
    let connection = ConnectionOptions::from_env().context("Failed to load connection options")?;
    info!(server = ?connection.server_info(), "Loaded connection options");

    let registry = ActivityRegistry::new();
    register_all(&registry, TransactionLedger::new(), &TransactionLatencies::default())?;
    let engine = Engine::open(config, registry).context("Failed to open engine")?;

    // Remote activities need a worker; run one alongside the client.
    let options = WorkerOptions::from_config(engine.config());
    let worker = WorkerPool::new(Arc::clone(&engine), options)
        .start()
        .await
        .context("Unable to start worker")?;
    let client = Client::new(Arc::clone(&engine), connection);

    let scenarios = if cli.all {
        Scenario::ALL.to_vec()
    } else {
        vec![cli.scenario]
    };
    let results = ResultsStore::new();
    let request_id = ResultsStore::request_id();

    for scenario in scenarios {
        for iteration in 1..=cli.iterations {
            let tx = Transaction::generate(cli.from.clone(), cli.to.clone(), cli.amount);
            let report = client
                .run_scenario(scenario, tx)
                .await
                .with_context(|| format!("Scenario {scenario} failed"))?;

            println!(
                "{scenario:>18} #{iteration}: first response {:>8.2} ms, completion {:>8.2} ms, \
                 saved {:>5.1}%, status {:?}",
                report.update_latency_ms,
                report.final_latency_ms,
                report.early_return_saving() * 100.0,
                report.status
            );
            results.add_run(&request_id, cli.iterations, report);
        }
    }

    if cli.json {
        if let Some(group) = results.get(&request_id) {
            println!("{}", serde_json::to_string_pretty(&group)?);
        }
    }

    let metrics = engine.metrics();
    info!(
        completed = metrics.instances_completed,
        cancelled = metrics.instances_cancelled,
        failed = metrics.instances_failed,
        avg_init_ms = metrics.avg_init_time_ms,
        "Driver finished"
    );
    worker.stop().await?;
    Ok(())
}
