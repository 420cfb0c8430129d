//! # Mediadex Server
//!
//! Indexing daemon: loads the indexer configuration, starts the content
//! manager with its scheduler and rescan timer, and keeps the index in sync
//! with the watched directories until interrupted.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use mediadex_core::autoscan::ScanMode;
use mediadex_core::config::{AutoscanEntryConfig, IndexerConfig};
use mediadex_core::content::{ContentManager, InMemoryStorage, RealFs};
use mediadex_core::lifecycle::ProcessContext;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{ConfigLoad, ConfigLoader};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "mediadex-server")]
#[command(about = "Keeps a media index in sync with watched directories")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to a .env file (defaults to ./.env when present)
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Extra directory to rescan periodically; may be repeated
    #[arg(long = "watch", value_name = "DIR")]
    watch: Vec<PathBuf>,

    /// Rescan interval in seconds for directories given with --watch
    #[arg(long, value_name = "SECS", default_value_t = 1800)]
    interval: u64,

    /// Import hidden files by default
    #[arg(long, default_value_t = false)]
    hidden_files: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_config_path(path);
    }
    if let Some(path) = &cli.env_file {
        loader = loader.with_env_file(path);
    }
    let ConfigLoad { mut config, metadata } =
        loader.load().context("failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,mediadex_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if metadata.env_file_loaded {
        info!("loaded .env file");
    }
    match &metadata.config_path {
        Some(path) => info!(path = %path.display(), "configuration loaded"),
        None => warn!("no mediadex.toml found; using defaults and environment"),
    }

    apply_cli(&mut config, &cli);
    config.validate().context("invalid configuration")?;

    let ctx = ProcessContext::new();
    let manager = ContentManager::launch(
        &ctx,
        &config,
        Arc::new(InMemoryStorage::new()),
        Arc::new(RealFs::new()),
    )
    .await
    .context("failed to start content manager")?;

    info!(
        timed = manager.autoscan_directories(ScanMode::Timed).len(),
        inotify = manager.autoscan_directories(ScanMode::Inotify).len(),
        "mediadex running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("shutdown requested");

    ctx.shutdown_all(true).await;
    info!(
        total_files = manager.accounting().total_files,
        "mediadex stopped"
    );
    Ok(())
}

fn apply_cli(config: &mut IndexerConfig, cli: &Cli) {
    if cli.hidden_files {
        config.import.hidden_files = true;
    }
    for location in &cli.watch {
        if config.autoscan.iter().any(|entry| &entry.location == location) {
            continue;
        }
        let mut entry = AutoscanEntryConfig::new(location.clone(), ScanMode::Timed);
        entry.interval_secs = cli.interval;
        config.autoscan.push(entry);
    }
}
