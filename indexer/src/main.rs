//! Staking history indexer.
//!
//! Subscribes to finalized blocks, attributes every staking reward and slash
//! event to the validator and era that caused it, and maintains per-account
//! net reward totals.

mod chain;
mod store;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use history::model::Block;
use history::HistoryIndexer;
use subxt::{OnlineClient, PolkadotConfig};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use chain::{load_block, SubxtStakingQuery};
use store::FileStore;

/// Reward event names, current and pre-rename.
const REWARD_EVENTS: [&str; 2] = ["Rewarded", "Reward"];
/// Slash event names, current and pre-rename.
const SLASH_EVENTS: [&str; 2] = ["Slashed", "Slash"];

#[derive(Parser)]
#[command(name = "indexer")]
#[command(about = "Staking reward and slash history indexer", long_about = None)]
struct Cli {
    /// Chain RPC endpoint
    #[arg(long, env = "RPC_URL", default_value = "ws://127.0.0.1:9944")]
    rpc_url: String,

    /// Directory for persisted history records and reward totals
    #[arg(long, env = "DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let level = Level::from_str(&cli.log_level).unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    let store = Arc::new(FileStore::new(cli.data_dir.clone())?);

    info!(rpc_url = %cli.rpc_url, "connecting to node");
    let api = OnlineClient::<PolkadotConfig>::from_url(&cli.rpc_url).await?;
    info!("connected, watching finalized blocks");

    let query = SubxtStakingQuery::new(api.clone());
    let indexer = HistoryIndexer::new(store, query);

    let mut blocks_sub = api.blocks().subscribe_finalized().await?;
    while let Some(block) = blocks_sub.next().await {
        let block = match block {
            Ok(block) => block,
            Err(err) => {
                error!(error = %err, "block subscription error");
                continue;
            }
        };

        let number = block.number();
        let block = match load_block(block).await {
            Ok(block) => block,
            Err(err) => {
                error!(number, error = %err, "failed to load block");
                continue;
            }
        };

        process_block(&indexer, &block).await;
    }

    Ok(())
}

/// Dispatch every staking reward/slash event of the block to its handler.
/// Failures are logged at block granularity; later events still run.
async fn process_block(indexer: &HistoryIndexer<FileStore, SubxtStakingQuery>, block: &Block) {
    for event in &block.events {
        if event.pallet != "Staking" {
            continue;
        }

        let outcome = if REWARD_EVENTS.contains(&event.method.as_str()) {
            indexer.handle_reward(block, event.index).await
        } else if SLASH_EVENTS.contains(&event.method.as_str()) {
            indexer.handle_slash(block, event.index).await
        } else {
            continue;
        };

        if let Err(err) = outcome {
            error!(
                block = block.number,
                event = event.index,
                error = %err,
                "event handling failed"
            );
        }
    }
}
