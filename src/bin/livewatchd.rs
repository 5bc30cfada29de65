//! livewatchd - live detection session daemon
//!
//! Serves the session HTTP API. Sessions are created over HTTP; each one
//! runs on its own worker thread until stopped or until it fails. Ctrl-C
//! stops every session and waits for the workers before exiting.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;

use livewatch::api::{ApiConfig, ApiServer};
use livewatch::{LivewatchConfig, SessionRegistry};

#[derive(Parser, Debug)]
#[command(name = "livewatchd", version, about = "Live video detection session daemon")]
struct Args {
    /// JSON config file (all fields optional).
    #[arg(long, env = "LIVEWATCH_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// API bind address; overrides the config file.
    #[arg(long, value_name = "ADDR")]
    addr: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = LivewatchConfig::load_from(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.api_addr = addr;
    }
    log::info!(
        "livewatchd {} (detector: {}, source backend: {:?}, results: {}, images: {})",
        env!("CARGO_PKG_VERSION"),
        config.detector.backend,
        config.source.backend,
        config.storage.results_dir.display(),
        config.storage.images_dir.display()
    );

    let registry = Arc::new(SessionRegistry::from_config(config.clone())?);
    let api_handle = ApiServer::new(ApiConfig::from_config(&config), Arc::clone(&registry)).spawn()?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("failed to install signal handler: {}", e))?;

    rx.recv()
        .map_err(|_| anyhow!("signal channel closed unexpectedly"))?;
    log::info!("shutdown requested");

    registry.shutdown();
    api_handle.stop()?;
    log::info!("livewatchd stopped");
    Ok(())
}
