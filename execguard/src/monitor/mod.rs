//! Permission monitor
//!
//! One monitor per container. It owns the container's permission queue,
//! builds the trusted inventory on the first intercepted exec and answers
//! every pending exec with exactly one verdict.
//!
//! Decision order (fail-closed at each step):
//! 1. exec by this daemon → allow
//! 2. inventory cannot be built → deny
//! 3. path cannot be resolved → deny
//! 4. content cannot be hashed → deny
//! 5. path not in inventory → deny
//! 6. digest differs from the inventory → deny
//! 7. otherwise → allow

pub mod fanotify;
mod handle;
mod shutdown;

pub use handle::MonitorHandle;
pub use shutdown::{shutdown_pair, ShutdownListener, ShutdownTrigger};

use crate::digest::{digest_file, Digest};
use crate::inventory::Inventory;
use crate::metrics::{INVENTORY_BUILDS, VERDICTS_TOTAL};
use crate::policy::MountPolicy;
use anyhow::Result;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Answer to one pending exec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Allow => "ALLOW",
            Verdict::Deny => "DENY",
        }
    }
}

/// Why a verdict was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    Trusted,
    /// Exec by this daemon itself
    OwnProcess,
    PathUnresolved,
    DigestFailed,
    /// The lazy inventory build failed for this event
    InventoryUnavailable,
    UnknownExecutable,
    ModifiedExecutable,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::Trusted => "trusted",
            Reason::OwnProcess => "own_process",
            Reason::PathUnresolved => "path_unresolved",
            Reason::DigestFailed => "digest_failed",
            Reason::InventoryUnavailable => "inventory_unavailable",
            Reason::UnknownExecutable => "unknown_executable",
            Reason::ModifiedExecutable => "modified_executable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub verdict: Verdict,
    pub reason: Reason,
}

impl Decision {
    pub fn allow(reason: Reason) -> Self {
        Self { verdict: Verdict::Allow, reason }
    }

    pub fn deny(reason: Reason) -> Self {
        Self { verdict: Verdict::Deny, reason }
    }
}

/// Compare a live digest against the inventory.
pub fn evaluate(inventory: &Inventory, path: &Path, live: &Digest) -> Decision {
    match inventory.get(path) {
        None => Decision::deny(Reason::UnknownExecutable),
        Some(recorded) if recorded != live => Decision::deny(Reason::ModifiedExecutable),
        Some(_) => Decision::allow(Reason::Trusted),
    }
}

/// An exec that is blocked in the kernel until it gets a verdict.
pub trait PendingExec {
    /// Path of the file being executed, as the kernel reports it.
    fn path(&self) -> Result<PathBuf>;

    /// The open handle delivered with the event.
    fn content(&self) -> Result<File>;

    /// Pid of the process attempting the exec.
    fn pid(&self) -> Option<i32>;
}

/// Kernel channel delivering pending execs.
pub trait PermissionQueue: Send {
    type Event: PendingExec;

    /// Block until execs are pending.
    ///
    /// An empty batch is a spurious wakeup. An error means the queue is
    /// closed or unusable and the monitor must stop.
    fn next_events(&mut self) -> Result<Vec<Self::Event>>;

    /// Write the verdict for `event` back to the kernel.
    fn respond(&self, event: &Self::Event, verdict: Verdict) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Created,
    Watching,
    Closed,
}

pub struct PermissionMonitor<Q: PermissionQueue> {
    container_id: String,
    rootfs: PathBuf,
    policy: MountPolicy,
    queue: Q,
    inventory: Option<Inventory>,
    state: MonitorState,
    own_pid: i32,
}

impl<Q: PermissionQueue> PermissionMonitor<Q> {
    /// Wrap a queue whose watches are already registered.
    pub fn new(container_id: impl Into<String>, rootfs: PathBuf, policy: MountPolicy, queue: Q) -> Self {
        Self {
            container_id: container_id.into(),
            rootfs,
            policy,
            queue,
            inventory: None,
            state: MonitorState::Created,
            own_pid: std::process::id() as i32,
        }
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn inventory(&self) -> Option<&Inventory> {
        self.inventory.as_ref()
    }

    /// Answer events until the queue closes.
    pub fn run(&mut self) {
        info!(container = %self.container_id, rootfs = %self.rootfs.display(), "Permission monitor running");
        self.state = MonitorState::Watching;

        while self.state == MonitorState::Watching {
            let events = match self.queue.next_events() {
                Ok(events) => events,
                Err(e) => {
                    debug!(container = %self.container_id, "Permission queue closed: {:#}", e);
                    self.state = MonitorState::Closed;
                    break;
                }
            };

            // Each event's file handle is released when it drops at the end
            // of its iteration.
            for event in events {
                self.handle(&event);
            }
        }

        info!(container = %self.container_id, "Permission monitor stopped");
    }

    /// Decide on one pending exec and send the verdict.
    pub fn handle(&mut self, event: &Q::Event) -> Decision {
        let (decision, path) = self.decide(event);

        let shown = path
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<unresolved>".to_string());
        info!(
            container = %self.container_id,
            path = %shown,
            reason = decision.reason.as_str(),
            "[{}]",
            decision.verdict.as_str()
        );
        VERDICTS_TOTAL
            .with_label_values(&[decision.verdict.as_str(), decision.reason.as_str()])
            .inc();

        if let Err(e) = self.queue.respond(event, decision.verdict) {
            error!(container = %self.container_id, path = %shown, "Failed to send verdict: {:#}", e);
        }

        decision
    }

    fn decide(&mut self, event: &Q::Event) -> (Decision, Option<PathBuf>) {
        if event.pid() == Some(self.own_pid) {
            return (Decision::allow(Reason::OwnProcess), None);
        }

        if !self.ensure_inventory() {
            return (Decision::deny(Reason::InventoryUnavailable), None);
        }

        let path = match event.path() {
            Ok(reported) => self.resolve(&reported),
            Err(e) => {
                error!(container = %self.container_id, "Failed to get file path: {:#}", e);
                return (Decision::deny(Reason::PathUnresolved), None);
            }
        };

        let live = match event.content().and_then(|file| digest_file(&file)) {
            Ok(digest) => digest,
            Err(e) => {
                error!(container = %self.container_id, path = %path.display(), "Failed to hash content: {:#}", e);
                return (Decision::deny(Reason::DigestFailed), Some(path));
            }
        };

        let Some(inventory) = self.inventory.as_ref() else {
            return (Decision::deny(Reason::InventoryUnavailable), Some(path));
        };

        (evaluate(inventory, &path, &live), Some(path))
    }

    /// Build the inventory if this is the first event. A failed build is
    /// retried on the next event.
    fn ensure_inventory(&mut self) -> bool {
        if self.inventory.is_some() {
            return true;
        }

        info!(container = %self.container_id, "First notification received, walking over {}", self.rootfs.display());

        match Inventory::build(&self.rootfs, &self.policy) {
            Ok(inventory) => {
                INVENTORY_BUILDS.with_label_values(&["ok"]).inc();
                self.inventory = Some(inventory);
                true
            }
            Err(e) => {
                INVENTORY_BUILDS.with_label_values(&["failed"]).inc();
                warn!(container = %self.container_id, "Failed to walk the container rootfs: {:#}", e);
                false
            }
        }
    }

    /// Map a reported path onto the rootfs, e.g. `/usr/bin/touch` becomes
    /// `/proc/49190/root/usr/bin/touch`.
    fn resolve(&self, reported: &Path) -> PathBuf {
        if reported.starts_with(&self.rootfs) {
            return reported.to_path_buf();
        }
        let relative = reported.strip_prefix("/").unwrap_or(reported);
        self.rootfs.join(relative)
    }
}
