//! `weftd`: the learning-core process.
//!
//! Loads the process configuration, opens the strand store, and runs the
//! coordinator's worker pool until interrupted. `config init` writes a
//! starter configuration; `stats` prints the store and queue counters.

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use weft_config::AppConfig;
use weft_llm::HttpLlmClient;
use weft_runtime::Coordinator;
use weft_store::{StrandStore, SystemClock};

#[derive(Parser)]
#[command(name = "weftd", about = "Centralized learning core daemon")]
struct Cli {
    /// Path to the toml configuration file.
    #[arg(long, default_value = "weft.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the coordinator worker pool (the default).
    Run,
    /// Write a starter configuration file and exit.
    ConfigInit,
    /// Print store and queue statistics and exit.
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.telemetry.log_level.clone())),
        )
        .init();

    match cli.command.unwrap_or(Command::Run) {
        Command::ConfigInit => {
            AppConfig::default().save_to(&cli.config)?;
            println!("wrote {}", cli.config);
            Ok(())
        }
        Command::Stats => {
            let store = StrandStore::open(&config.store.db_path, Arc::new(SystemClock))?;
            let stats = store.stats()?;
            println!("strands: {} ({} braids)", stats.strands_total, stats.braids_total);
            for (kind, count) in &stats.by_kind {
                println!("  {kind}: {count}");
            }
            println!(
                "queue: pending={} processing={} completed={} failed={}",
                stats.queue.pending,
                stats.queue.processing,
                stats.queue.completed,
                stats.queue.failed
            );
            Ok(())
        }
        Command::Run => run(config).await,
    }
}

async fn run(config: AppConfig) -> Result<()> {
    let store = Arc::new(StrandStore::open(&config.store.db_path, Arc::new(SystemClock))?);
    let llm = Arc::new(HttpLlmClient::new(
        config.llm.base_url.clone(),
        config.llm.model.clone(),
        config.llm.deadline_secs,
    ));

    let coordinator = Arc::new(Coordinator::new(store, llm, config));
    coordinator.bootstrap()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut events = coordinator.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!(?event, "progress");
        }
    });

    let runner = tokio::spawn(coordinator.run(shutdown_rx));
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);
    let _ = runner.await;
    Ok(())
}
