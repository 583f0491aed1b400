//! ShipIndex CLI.
//!
//! # Commands
//! ```text
//! shipindex info   --config <indexer.json>
//! shipindex plan   --config <indexer.json> [--lib <N>] [--first-available <N>] [--db <index.sqlite>]
//! shipindex probe  --config <indexer.json>
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use shipindex_core::{Checkpoint, CheckpointStore, EndpointStatus, IndexerConfig};
use shipindex_ship::{healthy_endpoints, validate_endpoints, WsTransport};
use shipindex_storage::SqliteStore;
use shipindex_worker::RunPlan;
use tracing::debug;

mod tracing_setup;

use tracing_setup::{init_tracing, LogConfig};

#[derive(Parser)]
#[command(
    name = "shipindex",
    about = "State-history ingestion pipeline for Antelope chains",
    version
)]
struct Cli {
    /// Indexer configuration (JSON). Defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level: trace | debug | info | warn | error
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration after defaults and validation
    Info,

    /// Print the backfill range plan, the ABI scan and the live reader's range
    Plan {
        /// Last irreversible block. Probed from the endpoints when omitted.
        #[arg(long)]
        lib: Option<u32>,
        /// First block with traces on the node (used when start_block is 0)
        #[arg(long)]
        first_available: Option<u32>,
        /// SQLite index whose checkpoints the plan resumes from
        #[arg(long)]
        db: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Handshake with every configured endpoint and check its chain id
    Probe {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&LogConfig {
        level: cli.log_level.clone(),
        json: cli.log_json,
        ..LogConfig::default()
    });

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Info => cmd_info(&config),
        Commands::Plan { lib, first_available, db, json } => {
            cmd_plan(&config, lib, first_available, db.as_deref(), json).await
        }
        Commands::Probe { json } => cmd_probe(&config, json).await,
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<IndexerConfig> {
    let config = match path {
        Some(path) => IndexerConfig::from_file(path)
            .with_context(|| format!("load config '{}'", path.display()))?,
        None => IndexerConfig::default(),
    };
    config.validate().context("invalid configuration")?;
    debug!(chain = %config.chain, endpoints = config.ship.endpoints.len(), "Configuration loaded");
    Ok(config)
}

// ─── Command implementations ─────────────────────────────────────────────────

fn cmd_info(config: &IndexerConfig) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

async fn cmd_plan(
    config: &IndexerConfig,
    lib: Option<u32>,
    first_available: Option<u32>,
    db: Option<&str>,
    as_json: bool,
) -> Result<()> {
    let (lib, first_available) = match lib {
        Some(lib) => (lib, first_available.unwrap_or(1)),
        None => {
            let statuses = probe(config).await;
            let status = statuses
                .iter()
                .find(|s| s.healthy)
                .context("no healthy endpoint to read the last irreversible block from; pass --lib")?;
            (
                status.last_irreversible.unwrap_or_default(),
                first_available.or(status.trace_begin_block).unwrap_or(1),
            )
        }
    };

    let checkpoints = match db {
        Some(path) => load_checkpoints(path, &config.chain).await?,
        None => vec![],
    };

    let plan = RunPlan::build(config, lib, first_available, &checkpoints);
    if as_json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    println!("Chain:               {}", config.chain);
    println!("Start block:         {}", plan.start);
    println!("Last irreversible:   {}", plan.last_irreversible);
    println!("Checkpoints loaded:  {}", checkpoints.len());
    println!(
        "Backfill:            {} ranges, {} blocks, {} readers at a time",
        plan.backfill.len(),
        plan.backfill_blocks(),
        config.scaling.readers
    );
    for assignment in &plan.backfill {
        let resumed = if assignment.resume_from > assignment.range.start {
            format!("  (resume at {})", assignment.resume_from)
        } else {
            String::new()
        };
        println!("  {:<24} {:>10} blocks{}", assignment.range.to_string(), assignment.remaining(), resumed);
    }
    if !plan.abi_scan.is_empty() {
        println!(
            "ABI scan first:      {} ranges, {} blocks",
            plan.abi_scan.len(),
            plan.abi_scan_blocks()
        );
    }
    match plan.live {
        Some(range) => println!("Live reader:         {range}"),
        None => println!("Live reader:         none"),
    }
    Ok(())
}

async fn cmd_probe(config: &IndexerConfig, as_json: bool) -> Result<()> {
    let statuses = probe(config).await;
    let healthy = healthy_endpoints(&statuses);

    if as_json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
    } else {
        for status in &statuses {
            if status.healthy {
                println!(
                    "  ✓ {}  head={} lib={} traces_from={}",
                    status.url,
                    fmt_block(status.head),
                    fmt_block(status.last_irreversible),
                    fmt_block(status.trace_begin_block)
                );
            } else {
                println!(
                    "  ✗ {}  {}",
                    status.url,
                    status.error.as_deref().unwrap_or("unhealthy")
                );
            }
        }
        println!("\n{} of {} endpoints healthy", healthy.len(), statuses.len());
    }

    if healthy.is_empty() {
        bail!("no healthy state-history endpoint");
    }
    Ok(())
}

async fn probe(config: &IndexerConfig) -> Vec<EndpointStatus> {
    let transport = WsTransport::from_config(&config.ship);
    validate_endpoints(
        &transport,
        &config.ship.endpoints,
        config.chain_id.as_deref(),
        Duration::from_millis(config.ship.connect_timeout_ms),
    )
    .await
}

async fn load_checkpoints(path: &str, chain: &str) -> Result<Vec<Checkpoint>> {
    let store = SqliteStore::open(path)
        .await
        .with_context(|| format!("open index '{path}'"))?;
    let checkpoints = store.list(chain).await.context("read checkpoints")?;
    Ok(checkpoints)
}

fn fmt_block(block: Option<u32>) -> String {
    block.map_or_else(|| "?".into(), |b| b.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plan_arguments() {
        let cli = Cli::try_parse_from(["shipindex", "plan", "--lib", "500", "--json"]).unwrap();
        match cli.command {
            Commands::Plan { lib, json, db, .. } => {
                assert_eq!(lib, Some(500));
                assert!(json);
                assert!(db.is_none());
            }
            _ => panic!("expected plan"),
        }
        assert_eq!(cli.log_level, "warn");
    }

    #[test]
    fn global_config_flag_after_subcommand() {
        let cli = Cli::try_parse_from(["shipindex", "info", "--config", "indexer.json"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("indexer.json")));
    }

    #[test]
    fn missing_config_file_is_an_error() {
        assert!(load_config(Some(std::path::Path::new("/nonexistent/indexer.json"))).is_err());
        assert!(load_config(None).is_ok());
    }

    #[tokio::test]
    async fn plan_with_explicit_lib_needs_no_endpoint() {
        let mut config = IndexerConfig::default();
        config.start_block = 1;
        config.scaling.batch_size = 100;
        cmd_plan(&config, Some(250), None, None, true).await.unwrap();
        cmd_plan(&config, Some(250), None, None, false).await.unwrap();
    }
}
