//! Monitor Threads
//!
//! Monitors run on their own OS threads and must let go of their queue
//! promptly when stopped.

use super::fixtures::{verdicts, Responses, Rootfs, ScriptedQueue};
use anyhow::Result;
use execguard::container::Container;
use execguard::monitor::{shutdown_pair, MonitorHandle, PermissionMonitor, Verdict};
use execguard::policy::MountPolicy;
use execguard::registry::{MonitorLauncher, NotifierRegistry};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Test: stopping a monitor blocked on an idle queue returns promptly
#[test]
fn test_stop_unblocks_waiting_monitor() {
    let rootfs = Rootfs::typical();
    let (trigger, listener) = shutdown_pair().expect("Failed to create shutdown pipe");
    let queue = ScriptedQueue::new(vec![vec![rootfs.exec("usr/bin/touch")]]).until_shutdown(listener);
    let responses = queue.responses();
    let monitor = PermissionMonitor::new("c1", rootfs.path().to_path_buf(), MountPolicy::empty(), queue);

    let handle = MonitorHandle::spawn(monitor, trigger).expect("Failed to spawn monitor");
    let deadline = Instant::now() + Duration::from_secs(5);
    while verdicts(&responses).is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(!handle.is_finished(), "Monitor should be waiting for more events");

    let started = Instant::now();
    handle.stop();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(verdicts(&responses), vec![Verdict::Allow]);
}

/// Test: a monitor whose queue closes on its own finishes its thread
#[test]
fn test_monitor_thread_exits_when_queue_closes() {
    let rootfs = Rootfs::typical();
    let (trigger, _listener) = shutdown_pair().expect("Failed to create shutdown pipe");
    let queue = ScriptedQueue::new(vec![vec![rootfs.exec("tmp/unknown")]]);
    let monitor = PermissionMonitor::new("c1", rootfs.path().to_path_buf(), MountPolicy::empty(), queue);

    let handle = MonitorHandle::spawn(monitor, trigger).expect("Failed to spawn monitor");
    let deadline = Instant::now() + Duration::from_secs(5);
    while !handle.is_finished() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }

    assert!(handle.is_finished());
    handle.stop();
}

/// Launches scripted monitors over one rootfs, one exec per container.
struct ScriptedLauncher {
    rootfs: PathBuf,
    responses: Mutex<Vec<Responses>>,
}

impl MonitorLauncher for ScriptedLauncher {
    fn launch(&self, container: &Container) -> Result<MonitorHandle> {
        let (trigger, listener) = shutdown_pair()?;
        let exec = super::fixtures::Exec {
            reported: Some(PathBuf::from("/usr/bin/touch")),
            content: self.rootfs.join("usr/bin/touch"),
            pid: 1,
        };
        let queue = ScriptedQueue::new(vec![vec![exec]]).until_shutdown(listener);
        self.responses
            .lock()
            .expect("Responses lock poisoned")
            .push(queue.responses());
        let monitor = PermissionMonitor::new(container.id.clone(), self.rootfs.clone(), MountPolicy::empty(), queue);
        MonitorHandle::spawn(monitor, trigger)
    }
}

fn container(id: &str) -> Container {
    Container {
        id: id.to_string(),
        pid: 1,
        name: format!("k8s_web_{}_default_uid", id),
        mounts: Vec::new(),
        labels: HashMap::new(),
    }
}

/// Test: container-stop closes the channel, ends the loop and clears the entry
#[tokio::test]
async fn test_container_stop_releases_monitor() {
    let rootfs = Rootfs::typical();
    let registry = NotifierRegistry::new(ScriptedLauncher {
        rootfs: rootfs.path().to_path_buf(),
        responses: Mutex::new(Vec::new()),
    });

    registry
        .on_container_start(&container("c1"))
        .await
        .expect("Failed to start monitor");
    registry
        .on_container_start(&container("c2"))
        .await
        .expect("Failed to start monitor");
    assert_eq!(registry.len(), 2);

    assert!(registry.on_container_stop("c1").await);
    assert!(!registry.contains("c1"));
    assert!(registry.contains("c2"));

    registry.shutdown_all().await;
    assert!(registry.is_empty());

    let all = registry.launcher().responses.lock().expect("Responses lock poisoned");
    assert_eq!(all.len(), 2);
    for responses in all.iter() {
        assert_eq!(verdicts(responses), vec![Verdict::Allow]);
    }
}
