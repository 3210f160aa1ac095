//! Process-tree termination against real process trees.

use sandboxd::process::proc_table::{is_alive, LinuxProcesses, ProcessControl};
use sandboxd::process::{ProcessHandle, Terminator};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};

fn spawn_tree(script: &str, own_group: bool) -> Child {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(script)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    if own_group {
        cmd.process_group(0);
    }
    cmd.spawn().expect("spawn sh")
}

async fn wait_for_descendants(pid: i32, count: usize) -> Vec<i32> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let found = LinuxProcesses.descendants(pid);
        if found.len() >= count || Instant::now() > deadline {
            return found;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn all_dead(pids: &[i32]) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if pids.iter().all(|&pid| !is_alive(pid)) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

fn terminator() -> Terminator {
    Terminator::new().with_check_interval(Duration::from_millis(50))
}

#[tokio::test]
async fn cooperative_tree_exits_within_grace_period() {
    let mut child = spawn_tree("sleep 30 & sleep 30 & wait", false);
    let handle = ProcessHandle::from_child(&child).unwrap();
    let descendants = wait_for_descendants(handle.pid(), 2).await;
    assert_eq!(descendants.len(), 2);

    let started = Instant::now();
    terminator()
        .terminate(Some(handle), Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));

    child.wait().await.unwrap();
    assert!(all_dead(&descendants).await);
}

#[tokio::test]
async fn tree_ignoring_sigterm_is_killed_after_grace_period() {
    let mut child = spawn_tree("trap '' TERM; sleep 30 & sleep 30 & wait", false);
    let handle = ProcessHandle::from_child(&child).unwrap();
    let descendants = wait_for_descendants(handle.pid(), 2).await;
    assert_eq!(descendants.len(), 2);

    let grace = Duration::from_millis(500);
    let started = Instant::now();
    terminator().terminate(Some(handle), Some(grace)).await.unwrap();
    let elapsed = started.elapsed();
    assert!(elapsed >= grace, "escalated early: {:?}", elapsed);
    assert!(elapsed < grace + Duration::from_secs(1), "escalated late: {:?}", elapsed);

    let status = child.wait().await.unwrap();
    assert_eq!(status.code(), None);
    assert!(all_dead(&descendants).await);
}

#[tokio::test]
async fn group_leader_is_terminated_through_its_group() {
    let mut child = spawn_tree("sleep 30 & sleep 30 & wait", true);
    let handle = ProcessHandle::from_child(&child).unwrap();
    assert!(handle.is_group_leader(&LinuxProcesses));
    let descendants = wait_for_descendants(handle.pid(), 2).await;
    assert_eq!(descendants.len(), 2);

    terminator()
        .terminate(Some(handle), Some(Duration::from_secs(2)))
        .await
        .unwrap();

    child.wait().await.unwrap();
    assert!(all_dead(&descendants).await);
}

#[tokio::test]
async fn already_reaped_process_is_a_quick_success() {
    let mut child = spawn_tree("true", false);
    let handle = ProcessHandle::from_child(&child).unwrap();
    child.wait().await.unwrap();

    let started = Instant::now();
    terminator()
        .terminate(Some(handle), Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
}
