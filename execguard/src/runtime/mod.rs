//! Container runtime adapters
//!
//! Supply the two things the daemon needs from a runtime: a container's
//! spec (pid, mounts, name, labels) and a stream of lifecycle events.

pub mod containerd;
pub mod docker;

pub use containerd::ContainerdRuntime;
pub use docker::DockerRuntime;

use crate::config::{DaemonConfig, RuntimeKind};
use crate::container::{Container, ContainerEvent};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::error;

const EVENT_BUFFER: usize = 256;

pub enum Runtime {
    Containerd(ContainerdRuntime),
    Docker(DockerRuntime),
}

impl Runtime {
    /// Both runtimes are resolved from containerd task bundles; the
    /// runtime kind selects the namespace and the event source.
    pub fn connect(config: &DaemonConfig) -> Result<Self> {
        let bundles = ContainerdRuntime::new(
            &config.containerd_state_dir,
            config.runtime.containerd_namespace(),
            Duration::from_millis(config.poll_interval_ms),
        );
        match config.runtime {
            RuntimeKind::Containerd => Ok(Runtime::Containerd(bundles)),
            RuntimeKind::Docker => Ok(Runtime::Docker(DockerRuntime::connect(&config.docker_socket, bundles)?)),
        }
    }

    pub fn resolve_spec(&self, id: &str) -> Result<Container> {
        match self {
            Runtime::Containerd(rt) => rt.resolve_spec(id),
            Runtime::Docker(rt) => rt.resolve_spec(id),
        }
    }

    /// Lifecycle events, produced by a background watcher task.
    ///
    /// The stream ends if the watcher fails.
    pub fn container_events(self: Arc<Self>) -> ReceiverStream<ContainerEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(async move {
            let result = match self.as_ref() {
                Runtime::Containerd(rt) => rt.watch(tx).await,
                Runtime::Docker(rt) => rt.watch(tx).await,
            };
            if let Err(e) = result {
                error!("Container event watcher stopped: {:#}", e);
            }
        });
        ReceiverStream::new(rx)
    }
}
