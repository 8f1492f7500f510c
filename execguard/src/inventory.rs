//! Trusted inventory of executables under a container rootfs.
//!
//! The inventory is captured once per monitor and never refreshed. It maps
//! each executable regular file (rootfs-prefixed path) to the digest of its
//! content at capture time.

use crate::digest::{digest_path, Digest};
use crate::policy::MountPolicy;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};
use walkdir::WalkDir;

const EXEC_BITS: u32 = 0o111;

#[derive(Debug, Clone)]
pub struct Inventory {
    rootfs: PathBuf,
    entries: HashMap<PathBuf, Digest>,
    built_at: DateTime<Utc>,
    vanished: usize,
}

impl Inventory {
    /// Walk `rootfs` and hash every executable regular file.
    ///
    /// Entries under a mount destination and symlinks are left out. Files
    /// that disappear mid-walk are skipped; any other I/O error fails the
    /// whole build.
    pub fn build(rootfs: &Path, policy: &MountPolicy) -> Result<Self> {
        Self::build_with(rootfs, policy, digest_path)
    }

    /// [`Inventory::build`] with the per-file hash step supplied by the caller.
    fn build_with<H>(rootfs: &Path, policy: &MountPolicy, mut hash: H) -> Result<Self>
    where
        H: FnMut(&Path) -> Result<Digest>,
    {
        let started = Instant::now();
        let mut entries = HashMap::new();
        let mut vanished = 0usize;

        // The trailing slash makes the walk descend even when the root is a
        // symlink, as /proc/<pid>/root is.
        let root = rootfs.join("");

        let walker = WalkDir::new(&root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !policy.is_exempt(rootfs, e.path()));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if e.depth() > 0 && walk_error_is_not_found(&e) => {
                    vanished += 1;
                    continue;
                }
                Err(e) => {
                    let path = e.path().map(|p| p.display().to_string()).unwrap_or_default();
                    return Err(anyhow::Error::new(e))
                        .with_context(|| format!("Failed to walk {}", path));
                }
            };

            // Directories, symlinks, fifos, sockets and devices
            if !entry.file_type().is_file() {
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) if walk_error_is_not_found(&e) => {
                    vanished += 1;
                    continue;
                }
                Err(e) => {
                    return Err(anyhow::Error::new(e)).with_context(|| {
                        format!("Failed to stat {}", entry.path().display())
                    });
                }
            };

            if metadata.permissions().mode() & EXEC_BITS == 0 {
                continue;
            }

            match hash(entry.path()) {
                Ok(digest) => {
                    entries.insert(entry.path().to_path_buf(), digest);
                }
                Err(e) if is_not_found(&e) => {
                    debug!(path = %entry.path().display(), "File vanished during scan");
                    vanished += 1;
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            rootfs = %rootfs.display(),
            entries = entries.len(),
            vanished,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Inventory built"
        );

        Ok(Self {
            rootfs: rootfs.to_path_buf(),
            entries,
            built_at: Utc::now(),
            vanished,
        })
    }

    /// Recorded digest for a rootfs-prefixed path.
    pub fn get(&self, path: &Path) -> Option<&Digest> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    /// Entries skipped because they vanished between listing and hashing.
    pub fn vanished(&self) -> usize {
        self.vanished
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PathBuf, &Digest)> {
        self.entries.iter()
    }
}

impl PartialEq for Inventory {
    fn eq(&self, other: &Self) -> bool {
        self.rootfs == other.rootfs && self.entries == other.entries
    }
}

fn walk_error_is_not_found(e: &walkdir::Error) -> bool {
    e.io_error()
        .is_some_and(|io| io.kind() == io::ErrorKind::NotFound)
}

fn is_not_found(e: &anyhow::Error) -> bool {
    e.chain().any(|cause| {
        cause
            .downcast_ref::<io::Error>()
            .is_some_and(|io| io.kind() == io::ErrorKind::NotFound)
    })
}
