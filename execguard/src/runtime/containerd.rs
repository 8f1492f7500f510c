//! containerd adapter
//!
//! Reads task state straight from the shim v2 state directory:
//!
//! ```text
//! /run/containerd/io.containerd.runtime.v2.task/<namespace>/<id>/config.json
//! /run/containerd/io.containerd.runtime.v2.task/<namespace>/<id>/init.pid
//! ```
//!
//! Lifecycle events come from polling that directory and diffing the id set.

use crate::container::{Container, ContainerEvent, MountEntry, MountKind};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const TASK_DIR: &str = "io.containerd.runtime.v2.task";

const CRI_CONTAINER_TYPE: &str = "io.kubernetes.cri.container-type";
const CRI_CONTAINER_NAME: &str = "io.kubernetes.cri.container-name";
const CRI_SANDBOX_NAME: &str = "io.kubernetes.cri.sandbox-name";
const CRI_SANDBOX_NAMESPACE: &str = "io.kubernetes.cri.sandbox-namespace";
const CRI_SANDBOX_UID: &str = "io.kubernetes.cri.sandbox-uid";

/// Subset of the OCI runtime spec that matters here.
#[derive(Debug, Deserialize)]
struct OciSpec {
    #[serde(default)]
    mounts: Vec<OciMount>,
    #[serde(default)]
    annotations: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct OciMount {
    destination: PathBuf,
    #[serde(default, rename = "type")]
    typ: Option<String>,
    #[serde(default)]
    source: Option<PathBuf>,
    #[serde(default)]
    options: Vec<String>,
}

impl OciMount {
    fn into_entry(self) -> MountEntry {
        let bind = self.options.iter().any(|o| o == "bind" || o == "rbind");
        let kind = match self.typ.as_deref() {
            _ if bind => MountKind::Bind,
            Some(typ) => MountKind::from_type(typ),
            None => MountKind::Other(String::new()),
        };
        MountEntry::new(self.source.unwrap_or_default(), self.destination, kind)
    }
}

pub struct ContainerdRuntime {
    task_root: PathBuf,
    poll_interval: Duration,
}

impl ContainerdRuntime {
    pub fn new(state_dir: &Path, namespace: &str, poll_interval: Duration) -> Self {
        Self {
            task_root: state_dir.join(TASK_DIR).join(namespace),
            poll_interval,
        }
    }

    pub fn task_root(&self) -> &Path {
        &self.task_root
    }

    /// Build a [`Container`] from the task's bundle.
    pub fn resolve_spec(&self, id: &str) -> Result<Container> {
        let bundle = self.task_root.join(id);

        let pid_raw = fs::read_to_string(bundle.join("init.pid"))
            .with_context(|| format!("Failed to read init.pid for {}", id))?;
        let pid: u32 = pid_raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid init.pid for {}: {:?}", id, pid_raw.trim()))?;

        let raw = fs::read_to_string(bundle.join("config.json"))
            .with_context(|| format!("Failed to read config.json for {}", id))?;

        parse_bundle(id, pid, &raw)
    }

    /// Ids of every task currently present.
    pub fn list(&self) -> Result<HashSet<String>> {
        let entries = match fs::read_dir(&self.task_root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashSet::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to list {}", self.task_root.display()))
            }
        };

        let mut ids = HashSet::new();
        for entry in entries.flatten() {
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                ids.insert(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(ids)
    }

    /// Poll the task directory and emit lifecycle events until the
    /// receiver goes away.
    ///
    /// Tasks present at startup are reported as added. A task whose
    /// bundle cannot be read yet is retried on the next poll.
    pub async fn watch(&self, tx: mpsc::Sender<ContainerEvent>) -> Result<()> {
        info!(root = %self.task_root.display(), "Watching containerd tasks");

        let mut known: HashSet<String> = HashSet::new();
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            interval.tick().await;

            let current = match self.list() {
                Ok(ids) => ids,
                Err(e) => {
                    warn!("Failed to list containerd tasks: {:#}", e);
                    continue;
                }
            };

            let (added, removed) = diff(&known, &current);

            for id in removed {
                known.remove(&id);
                if tx.send(ContainerEvent::Removed(id)).await.is_err() {
                    return Ok(());
                }
            }

            for id in added {
                match self.resolve_spec(&id) {
                    Ok(container) => {
                        known.insert(id);
                        if tx.send(ContainerEvent::Added(container)).await.is_err() {
                            return Ok(());
                        }
                    }
                    Err(e) => debug!(container = %id, "Task not ready yet: {:#}", e),
                }
            }
        }
    }
}

/// Ids that appeared and ids that went away since the last poll.
fn diff(known: &HashSet<String>, current: &HashSet<String>) -> (Vec<String>, Vec<String>) {
    let mut added: Vec<String> = current.difference(known).cloned().collect();
    let mut removed: Vec<String> = known.difference(current).cloned().collect();
    added.sort();
    removed.sort();
    (added, removed)
}

fn parse_bundle(id: &str, pid: u32, raw: &str) -> Result<Container> {
    let spec: OciSpec =
        serde_json::from_str(raw).with_context(|| format!("Failed to parse OCI spec for {}", id))?;

    let name = cri_name(&spec.annotations).unwrap_or_else(|| {
        debug!(container = %id, "No CRI annotations, using id as name");
        id.to_string()
    });

    Ok(Container {
        id: id.to_string(),
        pid,
        name,
        mounts: spec.mounts.into_iter().map(OciMount::into_entry).collect(),
        labels: spec.annotations,
    })
}

/// Docker-style name built from CRI annotations:
/// `k8s_<pod>_<container>_<namespace>_<uid>`, with pod `POD` for sandboxes.
fn cri_name(annotations: &HashMap<String, String>) -> Option<String> {
    let sandbox = annotations.get(CRI_SANDBOX_NAME)?;
    let (pod, container) = match annotations.get(CRI_CONTAINER_TYPE)?.as_str() {
        "sandbox" => ("POD", sandbox.as_str()),
        "container" => (sandbox.as_str(), annotations.get(CRI_CONTAINER_NAME)?.as_str()),
        _ => return None,
    };
    let namespace = annotations.get(CRI_SANDBOX_NAMESPACE)?;
    let uid = annotations.get(CRI_SANDBOX_UID)?;

    Some(format!("k8s_{}_{}_{}_{}", pod, container, namespace, uid))
}
