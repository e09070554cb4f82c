//! flowindex CLI: run the Flow ingesters and inspect or manage their state.
//!
//! # Commands
//! ```text
//! flowindex run                       [--history false] [--start-block <h>]
//! flowindex status                    [--json]
//! flowindex reset-checkpoint --mode <forward|backward> [--height <h>]
//! flowindex route --height <h>
//! flowindex info
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use flowindex_access::spork::{spork_label, CANDIDATE_SPORK_ROOTS, MAINNET_SPORK_ROOTS};
use flowindex_access::AccessNodeClient;
use flowindex_core::checkpoint::{Checkpoint, CheckpointStore, IngestMode};
use flowindex_core::committer::BlockCommitter;
use flowindex_core::config::IngesterConfig;
use flowindex_storage::SqliteStorage;

mod config;
mod logging;
mod run;

use config::{AccessArgs, FileConfig, RunArgs};

#[derive(Parser)]
#[command(
    name = "flowindex",
    about = "Reorg-aware, spork-aware Flow block ingester",
    long_about = "
FlowIndex ingests Flow blocks, transactions and events into SQLite.
A forward ingester tails the chain head while a backward ingester backfills
history, both over one pool of access nodes routed by spork.

ENVIRONMENT VARIABLES:
  FLOW_ACCESS_NODES                  Live access nodes
  FLOW_HISTORIC_ACCESS_NODES         Access nodes of earlier sporks
  FLOW_NODE_UNAVAILABLE_DISABLE_SEC  Quarantine length for failing nodes
  FLOW_RPC_RPS / FLOW_RPC_BURST      Client-wide rate limit
  FLOWINDEX_DB                       SQLite database path
",
    version
)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true, env = "FLOWINDEX_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database path
    #[arg(long, global = true, env = "FLOWINDEX_DB")]
    db: Option<String>,

    /// Log level: trace, debug, info, warn or error
    #[arg(long, global = true, env = "FLOWINDEX_LOG_LEVEL")]
    log_level: Option<String>,

    /// Emit JSON logs
    #[arg(long, global = true)]
    log_json: bool,

    #[command(flatten)]
    access: AccessArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the ingesters until interrupted
    Run(RunArgs),

    /// Show checkpoints and stored totals
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete a checkpoint, or overwrite it with --height
    #[command(name = "reset-checkpoint")]
    ResetCheckpoint {
        /// forward or backward
        #[arg(long)]
        mode: IngestMode,
        /// Service name (defaults to the configured one for the mode)
        #[arg(long)]
        service: Option<String>,
        #[arg(long)]
        height: Option<u64>,
    },

    /// Show which access node a height is routed to
    Route {
        #[arg(long)]
        height: u64,
    },

    /// Show defaults and the built-in spork table
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = FileConfig::load(cli.config.as_deref())?;
    config.access.overlay(&cli.access);
    if cli.db.is_some() {
        config.database = cli.db;
    }
    if let Some(level) = cli.log_level {
        config.log.level = level;
    }
    if cli.log_json {
        config.log.json = true;
    }
    logging::init_tracing(&config.log);

    match cli.command {
        Commands::Run(args) => {
            config.overlay_run(&args);
            run::run(config).await
        }
        Commands::Status { json } => cmd_status(&config, json).await,
        Commands::ResetCheckpoint { mode, service, height } => {
            cmd_reset_checkpoint(&config, mode, service, height).await
        }
        Commands::Route { height } => cmd_route(&config, height),
        Commands::Info => {
            cmd_info(&config);
            Ok(())
        }
    }
}

async fn open_storage(config: &FileConfig) -> Result<SqliteStorage> {
    SqliteStorage::open(config.database())
        .await
        .with_context(|| format!("opening database {}", config.database()))
}

fn service_config(config: &FileConfig, mode: IngestMode) -> IngesterConfig {
    match mode {
        IngestMode::Forward => config.forward_config(),
        IngestMode::Backward => config.backward_config(),
    }
}

async fn cmd_status(config: &FileConfig, as_json: bool) -> Result<()> {
    let store = open_storage(config).await?;

    let mut services = Vec::new();
    for mode in [IngestMode::Forward, IngestMode::Backward] {
        let service = service_config(config, mode).service;
        let checkpoint = store.load(&service, mode).await?;
        services.push((service, mode, checkpoint));
    }
    let lowest = store.lowest_height().await?;
    let highest = store.highest_height().await?;
    let blocks = store.block_count().await?;
    let transactions = store.transaction_count().await?;
    let events = store.event_count().await?;

    if as_json {
        let out = json!({
            "database": config.database(),
            "services": services.iter().map(|(service, mode, cp)| json!({
                "service": service,
                "mode": mode,
                "checkpoint": cp.as_ref().map(|c| c.height),
                "updated_at": cp.as_ref().map(|c| c.updated_at),
            })).collect::<Vec<_>>(),
            "lowest_height": lowest,
            "highest_height": highest,
            "blocks": blocks,
            "transactions": transactions,
            "events": events,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("Database: {}", config.database());
    for (service, mode, cp) in &services {
        match cp {
            Some(cp) => println!("  {service} ({mode}): checkpoint {}", cp.height),
            None => println!("  {service} ({mode}): no checkpoint"),
        }
    }
    match (lowest, highest) {
        (Some(lo), Some(hi)) => println!("  Stored range: {lo}..={hi}"),
        _ => println!("  Stored range: empty"),
    }
    println!("  Blocks: {blocks}  Transactions: {transactions}  Events: {events}");
    Ok(())
}

async fn cmd_reset_checkpoint(
    config: &FileConfig,
    mode: IngestMode,
    service: Option<String>,
    height: Option<u64>,
) -> Result<()> {
    let store = open_storage(config).await?;
    let service = service.unwrap_or_else(|| service_config(config, mode).service);

    match height {
        Some(height) => {
            store
                .save(Checkpoint {
                    service: service.clone(),
                    mode,
                    height,
                    updated_at: chrono::Utc::now().timestamp(),
                })
                .await?;
            println!("{service} ({mode}): checkpoint set to {height}");
        }
        None => {
            store.delete(&service, mode).await?;
            println!("{service} ({mode}): checkpoint deleted");
        }
    }
    Ok(())
}

fn cmd_route(config: &FileConfig, height: u64) -> Result<()> {
    let client = AccessNodeClient::connect(
        config.access.pool(),
        config.access.client_config(),
        CancellationToken::new(),
    )?;

    match client.route(height) {
        Ok(address) => println!("height {height} → {address}"),
        Err(e) => println!("height {height}: {e}"),
    }
    println!("\nPool:");
    for ep in client.status() {
        println!(
            "  [{}] {:<50} spork={:<12} floor={}",
            ep.index,
            ep.address,
            ep.spork.as_deref().unwrap_or("-"),
            ep.floor,
        );
    }
    Ok(())
}

fn cmd_info(config: &FileConfig) {
    let forward = config.forward_config();
    let backward = config.backward_config();
    let client = config.access.client_config();

    println!("FlowIndex v{}", env!("CARGO_PKG_VERSION"));
    println!("  Database: {}", config.database());
    println!(
        "  Forward:  service={} batch={} workers={} max reorg depth={}",
        forward.service, forward.batch_size, forward.worker_count, forward.max_reorg_depth
    );
    println!(
        "  Backward: service={} batch={} workers={}",
        backward.service, backward.batch_size, backward.worker_count
    );
    println!(
        "  Retry: {} attempts, {}ms initial backoff",
        client.retry.max_attempts,
        client.retry.initial_backoff.as_millis()
    );
    println!("  Quarantine: {}s", client.quarantine.duration.as_secs());
    match &client.rate_limit {
        Some(limit) => println!(
            "  Rate limit: {} req/s, burst {}",
            limit.requests_per_sec, limit.burst
        ),
        None => println!("  Rate limit: off"),
    }
    println!("  Pool:");
    for addr in config.access.pool() {
        println!("    {addr} ({})", spork_label(&addr).as_deref().unwrap_or("unlabeled"));
    }
    println!("  Spork roots:");
    for (n, root) in MAINNET_SPORK_ROOTS {
        println!("    mainnet{n:<3} {root}");
    }
    for (n, root) in CANDIDATE_SPORK_ROOTS {
        println!("    candidate{n:<2} {root}");
    }
}
