//! Fanotify permission queue
//!
//! Kernel side of the permission monitor. Registers `FAN_OPEN_EXEC_PERM`
//! marks for a container and hands pending execs to the decision loop.
//!
//! Requires CAP_SYS_ADMIN (root) to operate.

use super::{
    shutdown_pair, MonitorHandle, PendingExec, PermissionMonitor, PermissionQueue,
    ShutdownListener, Verdict,
};
use crate::config::PolicyConfig;
use crate::container::{Container, MountEntry};
use crate::policy::{MountPolicy, WatchSet};
use crate::registry::MonitorLauncher;
use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::fanotify::{
    EventFFlags, Fanotify, FanotifyEvent, FanotifyResponse, InitFlags, MarkFlags, MaskFlags,
    Response,
};
use std::fs::{self, File};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub struct FanotifyQueue {
    fanotify: Fanotify,
    shutdown: ShutdownListener,
}

impl FanotifyQueue {
    /// Initialize a permission-class channel and register every watch.
    ///
    /// Any mark failure aborts; the channel is closed when the partially
    /// set up queue is dropped.
    pub fn open(watches: &WatchSet, shutdown: ShutdownListener) -> Result<Self> {
        let init_flags = InitFlags::FAN_CLASS_CONTENT
            | InitFlags::FAN_UNLIMITED_QUEUE
            | InitFlags::FAN_UNLIMITED_MARKS
            | InitFlags::FAN_CLOEXEC;
        let event_flags = EventFFlags::O_RDONLY | EventFFlags::O_LARGEFILE | EventFFlags::O_CLOEXEC;

        let fanotify = Fanotify::init(init_flags, event_flags)
            .context("Failed to initialize fanotify (requires CAP_SYS_ADMIN/root)")?;
        let queue = Self { fanotify, shutdown };

        for dir in &watches.directories {
            queue.mark_directory(dir)?;
        }
        for file in &watches.files {
            queue.mark_file(file)?;
        }

        Ok(queue)
    }

    fn mark_directory(&self, path: &Path) -> Result<()> {
        let mark_flags = MarkFlags::FAN_MARK_ADD | MarkFlags::FAN_MARK_MOUNT;
        let mask = MaskFlags::FAN_OPEN_EXEC_PERM | MaskFlags::FAN_EVENT_ON_CHILD;

        self.fanotify
            .mark(mark_flags, mask, None, Some(path))
            .with_context(|| format!("Failed to mark directory {}", path.display()))?;
        info!("Watching directory: {}", path.display());
        Ok(())
    }

    fn mark_file(&self, path: &Path) -> Result<()> {
        self.fanotify
            .mark(MarkFlags::FAN_MARK_ADD, MaskFlags::FAN_OPEN_EXEC_PERM, None, Some(path))
            .with_context(|| format!("Failed to mark file {}", path.display()))?;
        info!("Watching file: {}", path.display());
        Ok(())
    }
}

impl PermissionQueue for FanotifyQueue {
    type Event = FanotifyEvent;

    fn next_events(&mut self) -> Result<Vec<FanotifyEvent>> {
        let mut fds = [
            PollFd::new(self.fanotify.as_fd(), PollFlags::POLLIN),
            PollFd::new(self.shutdown.as_fd(), PollFlags::POLLIN),
        ];

        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(Vec::new()),
            Err(e) => return Err(e).context("Failed to wait for fanotify events"),
        }

        if fds[1].revents().is_some_and(|r| !r.is_empty()) {
            bail!("Shutdown requested");
        }

        let ready = fds[0].revents().unwrap_or(PollFlags::empty());
        if ready.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL) {
            bail!("Fanotify channel is no longer usable");
        }
        if !ready.contains(PollFlags::POLLIN) {
            return Ok(Vec::new());
        }

        let events = match self.fanotify.read_events() {
            Ok(events) => events,
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => return Ok(Vec::new()),
            Err(e) => return Err(e).context("Failed to read fanotify events"),
        };

        let mut pending = Vec::with_capacity(events.len());
        for event in events {
            if !event.check_version() {
                bail!("Fanotify metadata version mismatch");
            }
            // FAN_NOFD: an overflow marker, no pending permission attached
            if event.fd().is_none() {
                warn!("Fanotify queue overflow event skipped");
                continue;
            }
            pending.push(event);
        }
        Ok(pending)
    }

    fn respond(&self, event: &FanotifyEvent, verdict: Verdict) -> Result<()> {
        let Some(fd) = event.fd() else {
            return Ok(());
        };
        let response = match verdict {
            Verdict::Allow => Response::FAN_ALLOW,
            Verdict::Deny => Response::FAN_DENY,
        };
        self.fanotify
            .write_response(FanotifyResponse::new(fd, response))
            .context("Failed to write fanotify response")?;
        Ok(())
    }
}

impl PendingExec for FanotifyEvent {
    fn path(&self) -> Result<PathBuf> {
        let fd = self.fd().context("Event carries no file descriptor")?;
        get_path_from_fd(fd.as_raw_fd())
    }

    fn content(&self) -> Result<File> {
        let fd = self.fd().context("Event carries no file descriptor")?;
        let owned = fd.try_clone_to_owned().context("Failed to duplicate event fd")?;
        Ok(File::from(owned))
    }

    fn pid(&self) -> Option<i32> {
        Some(FanotifyEvent::pid(self))
    }
}

/// Get file path from a file descriptor via /proc/self/fd/
fn get_path_from_fd(fd: RawFd) -> Result<PathBuf> {
    let link_path = format!("/proc/self/fd/{}", fd);
    let path = fs::read_link(&link_path).context("Failed to read fd link")?;
    Ok(path)
}

const MOUNTINFO: &str = "/proc/self/mountinfo";

/// Refuse a rootfs that is not a mount root.
///
/// Directory watches are mount marks. For a plain directory the mark would
/// cover the whole host mount holding it, and host execs on that mount would
/// be judged against this rootfs.
pub fn ensure_mount_root(path: &Path) -> Result<()> {
    if is_mount_root(path)? {
        return Ok(());
    }
    bail!(
        "{} is not a mount point; bind-mount it onto itself (mount --bind {0} {0}) to enforce on it",
        path.display()
    )
}

fn is_mount_root(path: &Path) -> Result<bool> {
    let Some(parent) = path.parent() else {
        return Ok(true);
    };
    let dev = fs::metadata(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?
        .dev();
    let parent_dev = fs::metadata(parent)
        .with_context(|| format!("Failed to stat {}", parent.display()))?
        .dev();
    if dev != parent_dev {
        return Ok(true);
    }

    // Bind mounts of the same filesystem share st_dev with their parent.
    let mountinfo = fs::read_to_string(MOUNTINFO).context("Failed to read mountinfo")?;
    let is_mount_point = mount_points(&mountinfo).any(|mount_point| mount_point == path);
    Ok(is_mount_point)
}

/// Mount points listed in a mountinfo table, with octal escapes decoded.
fn mount_points(mountinfo: &str) -> impl Iterator<Item = PathBuf> + '_ {
    mountinfo
        .lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .map(|field| PathBuf::from(unescape_octal(field)))
}

/// `/srv/my\040rootfs` becomes `/srv/my rootfs`.
fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let octal = bytes.get(i + 1..i + 4).filter(|d| d.iter().all(|b| (b'0'..=b'7').contains(b)));
        if let (b'\\', Some(digits)) = (bytes[i], octal) {
            let code = digits.iter().fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            out.push(code as u8);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Launches fanotify-backed monitors.
#[derive(Debug, Clone, Default)]
pub struct FanotifyLauncher {
    policy: PolicyConfig,
}

impl FanotifyLauncher {
    pub fn new(policy: PolicyConfig) -> Self {
        Self { policy }
    }

    /// Set up and start a monitor for an arbitrary rootfs.
    ///
    /// Used directly in standalone mode, where the rootfs is a host
    /// directory rather than `/proc/<pid>/root`.
    pub fn launch_rootfs(
        &self,
        container_id: &str,
        rootfs: PathBuf,
        mounts: Vec<MountEntry>,
    ) -> Result<MonitorHandle> {
        let policy = MountPolicy::new(mounts, &self.policy);
        let watches = policy.watch_set(&rootfs);
        debug!(
            container = container_id,
            directories = watches.directories.len(),
            files = watches.files.len(),
            "Registering watches"
        );

        let (trigger, listener) = shutdown_pair()?;
        let queue = FanotifyQueue::open(&watches, listener)
            .with_context(|| format!("Failed to set up monitor for {}", container_id))?;

        let monitor = PermissionMonitor::new(container_id, rootfs, policy, queue);
        MonitorHandle::spawn(monitor, trigger)
    }
}

impl MonitorLauncher for FanotifyLauncher {
    fn launch(&self, container: &Container) -> Result<MonitorHandle> {
        self.launch_rootfs(&container.id, container.rootfs(), container.mounts.clone())
    }
}
