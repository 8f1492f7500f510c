//! Docker adapter
//!
//! Docker runs its containers through containerd in the `moby` namespace, so
//! pid and the full OCI mount table come from the same task bundles the
//! containerd adapter reads. The docker API only supplies lifecycle events
//! and the container name and labels.

use super::containerd::ContainerdRuntime;
use crate::container::{Container, ContainerEvent};
use anyhow::{bail, Context, Result};
use bollard::container::ListContainersOptions;
use bollard::models::{ContainerSummary, EventMessage};
use bollard::system::EventsOptions;
use bollard::Docker;
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT_SECS: u64 = 120;

/// Event attributes that are not container labels.
const NON_LABEL_ATTRIBUTES: &[&str] = &["name", "image", "exitCode", "signal", "execDuration"];

/// What a docker event means for us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Start,
    Stop,
}

/// Name and labels as docker reports them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Identity {
    name: Option<String>,
    labels: HashMap<String, String>,
}

impl Identity {
    fn from_summary(summary: &ContainerSummary) -> Self {
        Self {
            name: summary
                .names
                .as_ref()
                .and_then(|names| names.first())
                .map(|n| container_name(n)),
            labels: summary.labels.clone().unwrap_or_default(),
        }
    }

    fn from_event(message: &EventMessage) -> Self {
        let attributes = message
            .actor
            .as_ref()
            .and_then(|a| a.attributes.clone())
            .unwrap_or_default();

        Self {
            name: attributes.get("name").map(|n| container_name(n)),
            labels: attributes
                .into_iter()
                .filter(|(k, _)| !NON_LABEL_ATTRIBUTES.contains(&k.as_str()))
                .collect(),
        }
    }

    /// Overlay docker's view on a container resolved from its bundle.
    fn apply(self, mut container: Container) -> Container {
        if let Some(name) = self.name {
            container.name = name;
        }
        container.labels.extend(self.labels);
        container
    }
}

pub struct DockerRuntime {
    docker: Docker,
    bundles: ContainerdRuntime,
}

impl DockerRuntime {
    /// `bundles` must point at containerd's `moby` namespace.
    pub fn connect(socket: &Path, bundles: ContainerdRuntime) -> Result<Self> {
        let socket = socket
            .to_str()
            .with_context(|| format!("Docker socket path is not UTF-8: {}", socket.display()))?;
        let docker = Docker::connect_with_unix(socket, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            .context("Failed to connect to Docker")?;
        Ok(Self { docker, bundles })
    }

    /// Pid, mounts and annotations from the container's task bundle.
    pub fn resolve_spec(&self, id: &str) -> Result<Container> {
        self.bundles.resolve_spec(id)
    }

    /// Report running containers, then follow the event stream until the
    /// receiver goes away.
    pub async fn watch(&self, tx: mpsc::Sender<ContainerEvent>) -> Result<()> {
        let running = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await
            .context("Failed to list containers")?;

        for summary in running {
            let Some(id) = summary.id.clone() else { continue };
            if !self.send_added(&id, Identity::from_summary(&summary), &tx).await {
                return Ok(());
            }
        }

        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        filters.insert(
            "event".to_string(),
            vec!["start".to_string(), "die".to_string(), "destroy".to_string()],
        );
        let events = self.docker.events(Some(EventsOptions::<String> {
            filters,
            ..Default::default()
        }));
        tokio::pin!(events);

        info!(root = %self.bundles.task_root().display(), "Watching docker events");

        while let Some(message) = events.next().await {
            let message = message.context("Docker event stream failed")?;
            let Some((lifecycle, id)) = classify(&message) else {
                continue;
            };

            let open = match lifecycle {
                Lifecycle::Start => self.send_added(&id, Identity::from_event(&message), &tx).await,
                Lifecycle::Stop => tx.send(ContainerEvent::Removed(id)).await.is_ok(),
            };
            if !open {
                return Ok(());
            }
        }

        bail!("Docker event stream ended")
    }

    /// Returns false once the receiver is gone.
    async fn send_added(&self, id: &str, identity: Identity, tx: &mpsc::Sender<ContainerEvent>) -> bool {
        match self.resolve_spec(id) {
            Ok(container) => tx.send(ContainerEvent::Added(identity.apply(container))).await.is_ok(),
            Err(e) => {
                warn!(container = %id, "Failed to resolve container: {:#}", e);
                true
            }
        }
    }
}

fn classify(message: &EventMessage) -> Option<(Lifecycle, String)> {
    let lifecycle = match message.action.as_deref()? {
        "start" => Lifecycle::Start,
        "die" | "destroy" => Lifecycle::Stop,
        other => {
            debug!(action = other, "Ignoring docker event");
            return None;
        }
    };
    let id = message.actor.as_ref()?.id.clone()?;
    Some((lifecycle, id))
}

/// `/k8s_web_app_default_8143ee7d_2` becomes `k8s_web_app_default_8143ee7d`.
///
/// Docker names carry a leading slash and kubelet-managed names a trailing
/// restart counter; neither is part of the workload identity.
fn container_name(raw: &str) -> String {
    let name = raw.strip_prefix('/').unwrap_or(raw);
    match name.rsplit_once('_') {
        Some((base, counter))
            if name.starts_with("k8s_")
                && !counter.is_empty()
                && counter.bytes().all(|b| b.is_ascii_digit()) =>
        {
            base.to_string()
        }
        _ => name.to_string(),
    }
}
