//! Background zone refresh. The frame loop only posts a request; the store
//! round-trip happens on this thread and lands via `SnapshotCell::store`.

use anyhow::{anyhow, Result};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::thread::JoinHandle;

use super::ZoneRegistry;
use crate::storage::ZoneStore;

enum RefreshMsg {
    Refresh,
    Stop,
}

#[derive(Debug)]
pub struct RefreshHandle {
    tx: SyncSender<RefreshMsg>,
    join: Option<JoinHandle<()>>,
}

impl RefreshHandle {
    /// Never blocks. Requests coalesce while one is pending; returns false
    /// when this one was folded into it or the thread is gone.
    pub fn request(&self) -> bool {
        match self.tx.try_send(RefreshMsg::Refresh) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => false,
            Err(TrySendError::Disconnected(_)) => {
                log::warn!("zone refresher is not running; refresh request dropped");
                false
            }
        }
    }

    /// Waits for an in-progress refresh to finish, then joins the thread.
    pub fn stop(mut self) -> Result<()> {
        let _ = self.tx.send(RefreshMsg::Stop);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("zone refresher thread panicked"))?;
        }
        Ok(())
    }
}

pub fn spawn_refresher<S>(
    registry: ZoneRegistry<S>,
    location: String,
    area_names: Vec<String>,
) -> Result<RefreshHandle>
where
    S: ZoneStore + 'static,
{
    let (tx, rx) = mpsc::sync_channel(1);
    let join = std::thread::Builder::new()
        .name("zone-refresher".to_string())
        .spawn(move || run_refresher(registry, rx, &location, &area_names))?;
    Ok(RefreshHandle {
        tx,
        join: Some(join),
    })
}

fn run_refresher<S: ZoneStore>(
    mut registry: ZoneRegistry<S>,
    rx: Receiver<RefreshMsg>,
    location: &str,
    area_names: &[String],
) {
    while let Ok(RefreshMsg::Refresh) = rx.recv() {
        match registry.refresh(location, area_names) {
            Ok(snapshot) => log::info!(
                "zone snapshot refreshed: {} zone(s) at `{}`",
                snapshot.zones().len(),
                location
            ),
            Err(err) => log::warn!("zone refresh failed, keeping previous snapshot: {}", err),
        }
    }
}
