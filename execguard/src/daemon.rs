//! Daemon wiring
//!
//! Consumes container lifecycle events and drives the registry. Every event
//! is handled on its own task so a slow correlation never holds up others.

use crate::container::{Container, ContainerEvent};
use crate::registry::{MonitorLauncher, NotifierRegistry};
use crate::workload::WorkloadCorrelator;
use dashmap::DashSet;
use std::future::Future;
use std::sync::Arc;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, error, info, warn};

pub struct Daemon<L> {
    registry: Arc<NotifierRegistry<L>>,
    correlator: Arc<WorkloadCorrelator>,
    /// Ids added but still waiting on correlation
    pending: Arc<DashSet<String>>,
}

impl<L: MonitorLauncher + 'static> Daemon<L> {
    pub fn new(registry: NotifierRegistry<L>, correlator: WorkloadCorrelator) -> Self {
        Self {
            registry: Arc::new(registry),
            correlator: Arc::new(correlator),
            pending: Arc::new(DashSet::new()),
        }
    }

    pub fn registry(&self) -> &Arc<NotifierRegistry<L>> {
        &self.registry
    }

    /// Handle events until the stream ends or `shutdown` resolves, then stop
    /// every monitor.
    pub async fn run<S, F>(&self, events: S, shutdown: F)
    where
        S: Stream<Item = ContainerEvent>,
        F: Future<Output = ()>,
    {
        tokio::pin!(events);
        tokio::pin!(shutdown);

        info!("Waiting for containers to start");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                event = events.next() => match event {
                    Some(event) => self.dispatch(event),
                    None => {
                        warn!("Container event stream ended");
                        break;
                    }
                },
            }
        }

        self.registry.shutdown_all().await;
    }

    fn dispatch(&self, event: ContainerEvent) {
        let registry = Arc::clone(&self.registry);
        let correlator = Arc::clone(&self.correlator);
        let pending = Arc::clone(&self.pending);

        // Pending ids are updated in stream order, before either task runs.
        // A removal while correlation is still running cancels the start.
        match &event {
            ContainerEvent::Added(container) => {
                pending.insert(container.id.clone());
            }
            ContainerEvent::Removed(id) => {
                pending.remove(id);
            }
        }

        tokio::spawn(async move {
            match event {
                ContainerEvent::Added(container) => {
                    handle_added(&registry, &correlator, &pending, container).await
                }
                ContainerEvent::Removed(id) => {
                    if registry.on_container_stop(&id).await {
                        info!(container = %id, "Container stopped");
                    }
                }
            }
        });
    }
}

async fn handle_added<L: MonitorLauncher + 'static>(
    registry: &NotifierRegistry<L>,
    correlator: &WorkloadCorrelator,
    pending: &DashSet<String>,
    container: Container,
) {
    let Some(workload) = correlator.correlate(&container).await else {
        pending.remove(&container.id);
        return;
    };

    // Checked under the registry's slot lock, so a removal that lands after
    // this point waits for the launch and then stops the monitor.
    let still_pending = || pending.remove(&container.id).is_some();
    match registry.on_container_start_if(&container, still_pending).await {
        Ok(true) => info!(container = %container.id, workload = %workload, "Container started"),
        Ok(false) => debug!(container = %container.id, "No new monitor started"),
        Err(e) => error!(container = %container.id, "Failed to create monitor: {:#}", e),
    }
}
