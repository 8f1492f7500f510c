//! Running monitor: its OS thread plus the shutdown trigger.

use super::{PermissionMonitor, PermissionQueue, ShutdownTrigger};
use anyhow::{Context, Result};
use std::thread::JoinHandle;
use tracing::{error, info};

#[derive(Debug)]
pub struct MonitorHandle {
    container_id: String,
    trigger: ShutdownTrigger,
    thread: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Run `monitor` on a dedicated thread.
    ///
    /// The permission queue is read with a blocking wait, so each monitor
    /// gets its own thread and a stalled container cannot starve others.
    pub fn spawn<Q>(monitor: PermissionMonitor<Q>, trigger: ShutdownTrigger) -> Result<Self>
    where
        Q: PermissionQueue + 'static,
    {
        let container_id = monitor.container_id().to_string();
        let short: String = container_id.chars().take(12).collect();

        let thread = std::thread::Builder::new()
            .name(format!("mon-{}", short))
            .spawn(move || {
                let mut monitor = monitor;
                monitor.run();
                // The queue, and with it the kernel channel, is released here.
            })
            .context("Failed to spawn monitor thread")?;

        Ok(Self {
            container_id,
            trigger,
            thread: Some(thread),
        })
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Wake the loop and wait until it has released its channel.
    pub fn stop(mut self) {
        self.trigger.trigger();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(container = %self.container_id, "Monitor thread panicked");
            }
        }
        info!(container = %self.container_id, "Monitor stopped");
    }
}
