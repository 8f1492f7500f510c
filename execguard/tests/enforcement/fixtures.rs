//! Test fixtures: rootfs trees and a scripted permission queue.

use anyhow::Result;
use execguard::monitor::{PendingExec, PermissionQueue, ShutdownListener, Verdict};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::collections::VecDeque;
use std::fs::{self, File};
use std::os::fd::AsFd;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// A container-like root filesystem in a temp dir.
pub struct Rootfs {
    dir: TempDir,
}

impl Rootfs {
    /// A small distro-like tree: a couple of binaries, a shell script and
    /// plain config files.
    pub fn typical() -> Self {
        let rootfs = Self {
            dir: TempDir::new().expect("Failed to create temp dir"),
        };
        rootfs.install("usr/bin/touch", b"\x7fELF touch v1", 0o755);
        rootfs.install("usr/bin/env", b"\x7fELF env v1", 0o755);
        rootfs.install("usr/local/bin/entrypoint.sh", b"#!/bin/sh\nexec \"$@\"\n", 0o750);
        rootfs.install("etc/passwd", b"root:x:0:0:root:/root:/bin/sh\n", 0o644);
        rootfs.install("etc/os-release", b"ID=test\n", 0o644);
        fs::create_dir_all(rootfs.path().join("tmp")).expect("Failed to create tmp");
        rootfs
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn join(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    pub fn install(&self, rel: &str, content: &[u8], mode: u32) -> PathBuf {
        let path = self.join(rel);
        fs::create_dir_all(path.parent().expect("Path has no parent")).expect("Failed to create dirs");
        fs::write(&path, content).expect("Failed to write file");
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).expect("Failed to chmod");
        path
    }

    /// An exec of `rel` as the kernel would report it: container-relative
    /// path plus an open handle on the current content.
    pub fn exec(&self, rel: &str) -> Exec {
        Exec {
            reported: Some(PathBuf::from("/").join(rel)),
            content: self.join(rel),
            pid: 1,
        }
    }
}

/// One pending exec.
pub struct Exec {
    pub reported: Option<PathBuf>,
    pub content: PathBuf,
    pub pid: i32,
}

impl PendingExec for Exec {
    fn path(&self) -> Result<PathBuf> {
        self.reported
            .clone()
            .ok_or_else(|| anyhow::anyhow!("Failed to read fd link"))
    }

    fn content(&self) -> Result<File> {
        Ok(File::open(&self.content)?)
    }

    fn pid(&self) -> Option<i32> {
        Some(self.pid)
    }
}

/// Verdicts written back, in order, with the reported path.
pub type Responses = Arc<Mutex<Vec<(Option<PathBuf>, Verdict)>>>;

/// Replays scripted batches, then either closes or waits for shutdown.
pub struct ScriptedQueue {
    batches: VecDeque<Vec<Exec>>,
    responses: Responses,
    shutdown: Option<ShutdownListener>,
}

impl ScriptedQueue {
    pub fn new(batches: Vec<Vec<Exec>>) -> Self {
        Self {
            batches: batches.into(),
            responses: Arc::default(),
            shutdown: None,
        }
    }

    /// Block on `listener` once the script is exhausted.
    pub fn until_shutdown(mut self, listener: ShutdownListener) -> Self {
        self.shutdown = Some(listener);
        self
    }

    pub fn responses(&self) -> Responses {
        Arc::clone(&self.responses)
    }
}

impl PermissionQueue for ScriptedQueue {
    type Event = Exec;

    fn next_events(&mut self) -> Result<Vec<Exec>> {
        if let Some(batch) = self.batches.pop_front() {
            return Ok(batch);
        }
        if let Some(listener) = &self.shutdown {
            let mut fds = [PollFd::new(listener.as_fd(), PollFlags::POLLIN)];
            poll(&mut fds, PollTimeout::NONE)?;
        }
        anyhow::bail!("Queue closed")
    }

    fn respond(&self, event: &Exec, verdict: Verdict) -> Result<()> {
        self.responses
            .lock()
            .expect("Responses lock poisoned")
            .push((event.reported.clone(), verdict));
        Ok(())
    }
}

pub fn verdicts(responses: &Responses) -> Vec<Verdict> {
    responses
        .lock()
        .expect("Responses lock poisoned")
        .iter()
        .map(|(_, v)| *v)
        .collect()
}
