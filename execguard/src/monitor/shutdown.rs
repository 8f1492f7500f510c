//! Wakeup signal for a monitor blocked in poll(2).
//!
//! A pipe: the listener polls the read end next to the kernel queue, the
//! trigger owns the write end. Dropping the write end raises POLLHUP on the
//! read end, so a trigger that goes away for any reason also stops the loop.

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::pipe2;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

pub fn shutdown_pair() -> Result<(ShutdownTrigger, ShutdownListener)> {
    let (read, write) = pipe2(OFlag::O_CLOEXEC).context("Failed to create shutdown pipe")?;
    Ok((ShutdownTrigger { write: Some(write) }, ShutdownListener { read }))
}

#[derive(Debug)]
pub struct ShutdownTrigger {
    write: Option<OwnedFd>,
}

impl ShutdownTrigger {
    pub fn trigger(&mut self) {
        self.write.take();
    }

    pub fn is_triggered(&self) -> bool {
        self.write.is_none()
    }
}

#[derive(Debug)]
pub struct ShutdownListener {
    read: OwnedFd,
}

impl ShutdownListener {
    /// Non-blocking check.
    pub fn is_triggered(&self) -> bool {
        let mut fds = [PollFd::new(self.read.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::ZERO) {
            Ok(0) => false,
            Ok(_) => fds[0].revents().is_some_and(|r| !r.is_empty()),
            Err(Errno::EINTR) => false,
            Err(_) => true,
        }
    }
}

impl AsFd for ShutdownListener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.read.as_fd()
    }
}
