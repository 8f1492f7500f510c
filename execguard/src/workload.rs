//! Workload correlation
//!
//! Decides whether a container belongs to a workload that opted into
//! enforcement. A runtime event can arrive before the workload is known, so
//! correlation waits a bounded time for the name to show up.

use crate::config::WorkloadConfig;
use crate::container::Container;
use dashmap::DashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Names of workloads eligible for enforcement.
#[derive(Debug, Default)]
pub struct WorkloadIndex {
    names: DashSet<String>,
}

impl WorkloadIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(&self, name: impl Into<String>) {
        let name = name.into();
        debug!(workload = %name, "Workload admitted");
        self.names.insert(name);
    }

    pub fn forget(&self, name: &str) -> bool {
        self.names.remove(name).is_some()
    }

    pub fn is_eligible(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Poll `index` for `name`: immediately, then every `every` until `timeout`.
pub async fn await_workload(index: &WorkloadIndex, name: &str, every: Duration, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if index.is_eligible(name) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        debug!(workload = %name, "Container not found in the workload list yet");
    }
}

pub struct WorkloadCorrelator {
    index: Arc<WorkloadIndex>,
    label_key: String,
    label_value: String,
    every: Duration,
    timeout: Duration,
}

impl WorkloadCorrelator {
    /// Statically configured names are admitted up front.
    pub fn new(config: &WorkloadConfig) -> Self {
        let index = Arc::new(WorkloadIndex::new());
        for name in &config.names {
            index.admit(name.clone());
        }

        Self {
            index,
            label_key: config.label_key.clone(),
            label_value: config.label_value.clone(),
            every: Duration::from_millis(config.correlation_interval_ms),
            timeout: Duration::from_millis(config.correlation_timeout_ms),
        }
    }

    pub fn index(&self) -> &Arc<WorkloadIndex> {
        &self.index
    }

    /// Whether the container's own labels carry the enforcement selector.
    pub fn selects(&self, container: &Container) -> bool {
        container
            .labels
            .get(&self.label_key)
            .is_some_and(|v| v == &self.label_value)
    }

    /// Workload name to enforce on, or `None` if the container is out of
    /// scope: a pause container, or no eligible workload before the deadline.
    pub async fn correlate(&self, container: &Container) -> Option<String> {
        if container.is_pause() {
            debug!(container = %container.id, name = %container.name, "Skipping pause container");
            return None;
        }

        if self.selects(container) {
            self.index.admit(container.name.clone());
        }

        if await_workload(&self.index, &container.name, self.every, self.timeout).await {
            Some(container.name.clone())
        } else {
            info!(container = %container.id, name = %container.name, "Ignoring container: no eligible workload");
            None
        }
    }
}
