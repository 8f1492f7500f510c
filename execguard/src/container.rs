//! Container data as supplied by the runtime adapters.

use std::collections::HashMap;
use std::path::PathBuf;

/// Kind of a declared mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountKind {
    Bind,
    Other(String),
}

impl MountKind {
    pub fn from_type(typ: &str) -> Self {
        match typ {
            "bind" | "rbind" => MountKind::Bind,
            other => MountKind::Other(other.to_string()),
        }
    }
}

/// One entry of a container's mount table, snapshotted at monitor creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub kind: MountKind,
}

impl MountEntry {
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<PathBuf>, kind: MountKind) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            kind,
        }
    }

    pub fn bind(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self::new(source, destination, MountKind::Bind)
    }
}

/// A running container.
#[derive(Debug, Clone)]
pub struct Container {
    pub id: String,
    pub pid: u32,
    /// Runtime-assigned name, e.g. `k8s_<pod>_<container>_<namespace>_<uid>`
    pub name: String,
    pub mounts: Vec<MountEntry>,
    pub labels: HashMap<String, String>,
}

impl Container {
    /// Root filesystem of the container as seen from the host.
    ///
    /// Looks like `/proc/49190/root`.
    pub fn rootfs(&self) -> PathBuf {
        PathBuf::from("/proc").join(self.pid.to_string()).join("root")
    }

    /// Pause containers hold the pod sandbox and never run workload code.
    pub fn is_pause(&self) -> bool {
        self.name.starts_with("k8s_POD_")
    }
}

/// Lifecycle notification from a runtime event bus.
#[derive(Debug, Clone)]
pub enum ContainerEvent {
    Added(Container),
    Removed(String),
}

impl ContainerEvent {
    pub fn container_id(&self) -> &str {
        match self {
            ContainerEvent::Added(c) => &c.id,
            ContainerEvent::Removed(id) => id,
        }
    }
}
