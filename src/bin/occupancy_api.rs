//! occupancy_api - API-only service for the zone occupancy store
//!
//! This daemon:
//! 1. Opens the occupancy database
//! 2. Serves zone administration and count queries over HTTP
//! 3. Does NOT read detections

use anyhow::{anyhow, Result};
use std::sync::mpsc;

use zone_occupancy::{api::ApiServer, config::ApiServiceConfig, SqliteStore};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ApiServiceConfig::load()?;
    let store = SqliteStore::open(&config.db_path, config.store_timeout)?;
    let api_handle = ApiServer::new(&config.api_addr, store).spawn()?;
    log::info!("occupancy_api running. serving {}", config.db_path);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("occupancy_api waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;

    Ok(())
}
