//! Orchestrator Core daemon CLI.
//!
//! Starts the coordinator against a configured Runtime endpoint, runs crash
//! recovery, and blocks until shut down (Ctrl-C), at which point the
//! shutdown sequence runs in order.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, Level};

use orchestrator_core::config::OrchestratorConfig;
use orchestrator_core::spawner::runtime_client::HttpRuntimeClient;
use orchestrator_core::Orchestrator;

#[derive(Parser)]
#[command(name = "orchestratord")]
#[command(about = "Durable orchestration core daemon")]
#[command(version)]
struct Cli {
    /// Path to a TOML configuration file; defaults are used for any key it omits.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Session id this coordinator instance owns.
    #[arg(short, long, default_value = "default")]
    session: String,

    /// Base URL of the external Runtime's HTTP API.
    #[arg(long, default_value = "http://127.0.0.1:4096")]
    runtime_url: String,

    /// Verbose (debug-level) logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    let config = match &cli.config {
        Some(path) => OrchestratorConfig::load(path).with_context(|| format!("loading config from {}", path.display()))?,
        None => OrchestratorConfig::default(),
    };

    info!(session = %cli.session, runtime_url = %cli.runtime_url, "starting orchestrator");

    let runtime = Arc::new(HttpRuntimeClient::new(cli.runtime_url)?);
    let orchestrator = Orchestrator::new(config, cli.session, runtime).await?;
    let report = orchestrator.init().await?;
    info!(
        events_replayed = report.events_replayed,
        tasks_hydrated = report.tasks_hydrated,
        pending_checkpoints = report.pending_checkpoints,
        "recovery complete, orchestrator running"
    );

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutdown signal received");
    orchestrator.shutdown().await?;

    Ok(())
}
