//! Mount policy.
//!
//! Decides, from a container's mount table:
//! - which host paths get an execute-permission watch (setup time)
//! - which accessed paths belong to a mount and are left out of the inventory

use crate::config::PolicyConfig;
use crate::container::{MountEntry, MountKind};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Paths to register with the kernel for one container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchSet {
    /// Watched recursively, including child execs. The rootfs comes first.
    pub directories: Vec<PathBuf>,
    /// Watched as single files
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct MountPolicy {
    mounts: Vec<MountEntry>,
    ignored: Vec<PathBuf>,
    files: Vec<PathBuf>,
}

impl MountPolicy {
    pub fn new(mounts: Vec<MountEntry>, config: &PolicyConfig) -> Self {
        Self {
            mounts,
            ignored: config.ignored_destinations.clone(),
            files: config.file_destinations.clone(),
        }
    }

    /// Policy for a bare directory with no declared mounts.
    pub fn empty() -> Self {
        Self::new(Vec::new(), &PolicyConfig::default())
    }

    pub fn mounts(&self) -> &[MountEntry] {
        &self.mounts
    }

    /// Partition the mount table into directory and file watches.
    pub fn watch_set(&self, rootfs: &Path) -> WatchSet {
        let mut set = WatchSet {
            directories: vec![rootfs.to_path_buf()],
            files: Vec::new(),
        };

        for mount in &self.mounts {
            if self.ignored.iter().any(|d| d == &mount.destination) {
                debug!(destination = %mount.destination.display(), "Mount ignored");
                continue;
            }

            if self.files.iter().any(|d| d == &mount.destination) {
                set.files.push(mount.source.clone());
                continue;
            }

            if mount.kind == MountKind::Bind {
                set.directories.push(mount.source.clone());
            }
        }

        set
    }

    /// Whether `path` (rootfs-prefixed) lies under any declared mount destination.
    ///
    /// Such paths are host-managed and never enter the inventory.
    pub fn is_exempt(&self, rootfs: &Path, path: &Path) -> bool {
        let Some(relative) = strip_rootfs(rootfs, path) else {
            return false;
        };

        self.mounts
            .iter()
            .any(|mount| relative.starts_with(&mount.destination))
    }
}

/// Turn `/proc/49190/root/usr/bin/touch` into `/usr/bin/touch`.
pub fn strip_rootfs(rootfs: &Path, path: &Path) -> Option<PathBuf> {
    path.strip_prefix(rootfs)
        .ok()
        .map(|rest| Path::new("/").join(rest))
}
