//! Inventory daemon entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;

use entity_manager::EntityManager;
use entity_manager_bus::MemoryBus;
use entity_manager_common::{EmConfig, init_tracing, load_config};

#[derive(Parser, Debug)]
#[command(about = "Hardware inventory manager")]
struct Args {
    /// Path to a JSON5 configuration file; defaults apply without one.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config: EmConfig = match &args.config {
        Some(path) => load_config(path).context("loading configuration")?,
        None => EmConfig::default(),
    };
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    init_tracing(&config.logging).context("initializing tracing")?;

    // Power-state reading belongs to an external collaborator; until one
    // is wired in, the host is reported off and power-dependent pruning
    // stays deferred.
    let (_power_tx, power_rx) = watch::channel(false);

    // The bus wire transport is likewise external; the in-process bus
    // carries the object model it would sync onto the wire.
    let bus = Arc::new(MemoryBus::new());

    let engine =
        EntityManager::new(config, bus, power_rx).context("starting entity manager")?;
    engine.run().await.context("running entity manager")?;
    Ok(())
}
