//! occupancyd - zone occupancy pipeline daemon
//!
//! This daemon:
//! 1. Loads zones for the configured location/areas (retrying at startup)
//! 2. Keeps them fresh from a background refresher
//! 3. Reads tracked detections (JSON lines) frame by frame
//! 4. On each capture tick, uploads person crops and writes person + count records
//! 5. Optionally serves the HTTP façade from the same process

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use zone_occupancy::{
    api::ApiServer,
    config::PipelineConfig,
    pipeline::PipelineSettings,
    snapshot::{FilesystemObjectStore, ObjectStore, SnapshotSink},
    zones::{spawn_refresher, SnapshotCell, ZoneRegistry},
    JsonLinesSource, PersistenceWriter, PipelineOrchestrator, SqliteStore, TrackerNamespace,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = PipelineConfig::load()?;
    let store = SqliteStore::open(&cfg.db_path, cfg.store_timeout)?;
    log::info!(
        "occupancyd starting: db={} location={} areas={:?}",
        store.db_path(),
        cfg.location,
        cfg.areas
    );

    let cell = SnapshotCell::new();
    let mut registry = ZoneRegistry::with_cell(store.reopen(cfg.store_timeout)?, cell.clone());
    initial_refresh(&mut registry, &cfg)?;
    let refresher = spawn_refresher(registry, cfg.location.clone(), cfg.areas.clone())?;

    let api_handle = if cfg.api.enabled {
        Some(ApiServer::new(&cfg.api.addr, store.reopen(cfg.store_timeout)?).spawn()?)
    } else {
        None
    };

    let object_store = build_object_store(&cfg)?;
    let sink = SnapshotSink::new(object_store, cfg.snapshots.url_ttl);
    let namespace = TrackerNamespace::from_process_start()?;
    log::info!("tracker namespace: {:?}", namespace);
    let writer = PersistenceWriter::new(store, namespace);
    let settings = PipelineSettings {
        bucket: cfg.snapshots.bucket.clone(),
        capture_interval: cfg.capture_interval,
        refresh_interval: cfg.refresh_interval,
        upload_workers: cfg.upload_workers,
    };
    let mut orchestrator =
        PipelineOrchestrator::new(cell, writer, sink, settings, Instant::now())
            .with_refresher(refresher);

    let stop = Arc::new(AtomicBool::new(false));
    let stop_handler = stop.clone();
    ctrlc::set_handler(move || {
        if stop_handler.swap(true, Ordering::SeqCst) {
            // Second signal: the frame source may be blocked on a read.
            std::process::exit(130);
        }
        log::info!("shutdown requested; finishing current frame (Ctrl-C again to force)");
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let mut source = JsonLinesSource::open(&cfg.input)?;
    log::info!("occupancyd running. reading detections from {}", cfg.input);
    let result = orchestrator.run(&mut source, &stop);

    let stats = orchestrator.shutdown()?;
    if let Some(handle) = api_handle {
        handle.stop()?;
    }
    result?;
    log::info!(
        "run summary: frames={} frames_without_zones={} ticks={} counts={} people={} failed_snapshots={} failed_zone_writes={}",
        stats.frames,
        stats.frames_without_zones,
        stats.capture_ticks,
        stats.count_records,
        stats.person_records,
        stats.failed_snapshots,
        stats.failed_zone_writes
    );
    Ok(())
}

fn initial_refresh(registry: &mut ZoneRegistry<SqliteStore>, cfg: &PipelineConfig) -> Result<()> {
    for attempt in 1..=cfg.startup_refresh_attempts {
        match registry.refresh(&cfg.location, &cfg.areas) {
            Ok(snapshot) => {
                log::info!(
                    "loaded {} zone(s) for `{}` on attempt {}",
                    snapshot.zones().len(),
                    cfg.location,
                    attempt
                );
                return Ok(());
            }
            Err(err) => {
                log::warn!(
                    "initial zone refresh attempt {}/{} failed: {}",
                    attempt,
                    cfg.startup_refresh_attempts,
                    err
                );
                if attempt < cfg.startup_refresh_attempts {
                    std::thread::sleep(cfg.startup_retry_delay);
                }
            }
        }
    }
    log::error!("no zone snapshot could be loaded; containment is impossible");
    Err(anyhow!(
        "startup failed: no zones loaded for location `{}` after {} attempt(s)",
        cfg.location,
        cfg.startup_refresh_attempts
    ))
}

fn build_object_store(cfg: &PipelineConfig) -> Result<Arc<dyn ObjectStore>> {
    if let Some(endpoint) = &cfg.snapshots.endpoint {
        #[cfg(feature = "object-store-http")]
        {
            let store = zone_occupancy::snapshot::HttpObjectStore::new(
                endpoint,
                &cfg.snapshots.base_url,
                &cfg.snapshots.signing_secret,
                cfg.store_timeout,
            )?;
            log::info!("snapshots go to {}", endpoint);
            return Ok(Arc::new(store));
        }
        #[cfg(not(feature = "object-store-http"))]
        {
            return Err(anyhow!(
                "snapshots.endpoint {} requires the object-store-http feature",
                endpoint
            ));
        }
    }
    let store = FilesystemObjectStore::new(
        &cfg.snapshots.root,
        &cfg.snapshots.base_url,
        &cfg.snapshots.signing_secret,
    )?;
    log::info!("snapshots go to {}", store.root().display());
    Ok(Arc::new(store))
}
