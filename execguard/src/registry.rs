//! Notifier registry
//!
//! Maps container ids to their running permission monitor. Start and stop
//! for the same id are serialized through a per-id slot; a stop keeps the
//! slot locked until the old monitor has released its kernel channel, so a
//! racing start for a reused id only proceeds once the channel is gone.

use crate::container::Container;
use crate::metrics::ACTIVE_MONITORS;
use crate::monitor::MonitorHandle;
use anyhow::{Context, Result};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Creates the monitor for a container: watch setup plus loop thread.
pub trait MonitorLauncher: Send + Sync {
    fn launch(&self, container: &Container) -> Result<MonitorHandle>;
}

type Slot = Arc<Mutex<Option<MonitorHandle>>>;

pub struct NotifierRegistry<L> {
    launcher: Arc<L>,
    slots: DashMap<String, Slot>,
}

impl<L: MonitorLauncher + 'static> NotifierRegistry<L> {
    pub fn new(launcher: L) -> Self {
        Self {
            launcher: Arc::new(launcher),
            slots: DashMap::new(),
        }
    }

    /// Start enforcing on `container`.
    ///
    /// A start for an id that already has a live monitor is ignored.
    pub async fn on_container_start(&self, container: &Container) -> Result<()> {
        self.on_container_start_if(container, || true).await.map(|_| ())
    }

    /// Start enforcing on `container` unless `proceed` says otherwise.
    ///
    /// `proceed` runs with the slot for the id locked, so a stop for the
    /// same id either happens before it (and can cancel the start) or waits
    /// for the launch and stops the new monitor. Returns whether a monitor
    /// was launched.
    pub async fn on_container_start_if<F>(&self, container: &Container, proceed: F) -> Result<bool>
    where
        F: FnOnce() -> bool,
    {
        let slot = self.slot(&container.id);
        let mut guard = slot.lock().await;

        if !proceed() {
            debug!(container = %container.id, "Start cancelled");
            drop(guard);
            self.release(&container.id, slot);
            return Ok(false);
        }

        if let Some(existing) = guard.as_ref() {
            if !existing.is_finished() {
                warn!(container = %container.id, "Monitor already running, ignoring start");
                return Ok(false);
            }
            // The previous loop ended on its own (e.g. its queue failed).
            if let Some(stale) = guard.take() {
                debug!(container = %container.id, "Reaping exited monitor");
                join_blocking(stale).await;
                ACTIVE_MONITORS.dec();
            }
        }

        let launcher = Arc::clone(&self.launcher);
        let target = container.clone();
        let launched = tokio::task::spawn_blocking(move || launcher.launch(&target))
            .await
            .context("Monitor launch task failed")
            .and_then(|r| r);

        match launched {
            Ok(handle) => {
                *guard = Some(handle);
                ACTIVE_MONITORS.inc();
                info!(container = %container.id, name = %container.name, pid = container.pid, "Monitor started");
                Ok(true)
            }
            Err(e) => {
                drop(guard);
                self.release(&container.id, slot);
                Err(e)
            }
        }
    }

    /// Stop the monitor for `id` and wait until its channel is released.
    ///
    /// Returns whether a monitor was running.
    pub async fn on_container_stop(&self, id: &str) -> bool {
        let Some(slot) = self.slots.get(id).map(|s| Arc::clone(s.value())) else {
            debug!(container = %id, "No monitor to stop");
            return false;
        };

        let mut guard = slot.lock().await;
        let stopped = match guard.take() {
            Some(handle) => {
                join_blocking(handle).await;
                ACTIVE_MONITORS.dec();
                true
            }
            None => false,
        };
        drop(guard);

        self.release(id, slot);
        stopped
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.slots.contains_key(id)
    }

    pub fn container_ids(&self) -> Vec<String> {
        self.slots.iter().map(|e| e.key().clone()).collect()
    }

    /// Stop every monitor. Used at process exit.
    pub async fn shutdown_all(&self) {
        let ids = self.container_ids();
        info!("Stopping {} monitor(s)", ids.len());
        for id in ids {
            self.on_container_stop(&id).await;
        }
    }

    fn slot(&self, id: &str) -> Slot {
        Arc::clone(self.slots.entry(id.to_string()).or_default().value())
    }

    /// Drop our reference and remove the slot if nobody else holds it and
    /// it is empty.
    fn release(&self, id: &str, slot: Slot) {
        drop(slot);
        self.slots.remove_if(id, |_, s| {
            Arc::strong_count(s) == 1 && s.try_lock().is_ok_and(|g| g.is_none())
        });
    }
}

async fn join_blocking(handle: MonitorHandle) {
    let id = handle.container_id().to_string();
    if let Err(e) = tokio::task::spawn_blocking(move || handle.stop()).await {
        warn!(container = %id, "Failed to join monitor: {}", e);
    }
}
