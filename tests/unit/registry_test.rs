// ProcessRegistry with real child processes: natural exit, forced kill from
// the close path, and the race between the two removal paths.

use std::os::unix::process::ExitStatusExt;
use std::sync::Arc;
use std::time::Duration;

use fleetsshd::session::registry::{ProcessRegistry, RegistryError};
use fleetsshd::session::SessionId;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tokio::process::Command;

/// Registry with an open slot for each id, as the connection supervisor leaves it.
fn registry_with(ids: &[&SessionId]) -> Arc<ProcessRegistry> {
    let registry = Arc::new(ProcessRegistry::new());
    for id in ids {
        registry.open_session((*id).clone());
    }
    registry
}

fn is_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

fn spawn(program: &str, args: &[&str]) -> tokio::process::Child {
    Command::new(program)
        .args(args)
        .process_group(0)
        .kill_on_drop(true)
        .spawn()
        .unwrap()
}

#[tokio::test]
async fn test_natural_exit_unregisters_on_release() {
    let id = SessionId::from("exit");
    let registry = registry_with(&[&id]);
    let mut tracked = registry.track(id.clone(), spawn("/bin/sh", &["-c", "exit 3"])).unwrap();
    assert!(registry.contains(&id));
    assert_eq!(registry.pid(&id), tracked.pid());

    let status = tracked.wait().await.unwrap();
    assert_eq!(status.code(), Some(3));
    tracked.release();
    assert!(registry.is_empty());
    assert!(!registry.kill_and_forget(&id));
}

#[tokio::test]
async fn test_kill_and_forget_ends_running_process() {
    let id = SessionId::from("sleeper");
    let registry = registry_with(&[&id]);
    let mut tracked = registry.track(id.clone(), spawn("/bin/sleep", &["30"])).unwrap();

    let waiter = tokio::spawn(async move {
        let status = tracked.wait().await;
        tracked.release();
        status
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(registry.kill_and_forget(&id));
    assert!(!registry.contains(&id));

    let status = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("killed process should be reaped promptly")
        .unwrap()
        .unwrap();
    assert_eq!(status.signal(), Some(9));

    // Second call: nothing left to kill.
    assert!(!registry.kill_and_forget(&id));
}

#[tokio::test]
async fn test_kill_reaches_whole_process_group() {
    let id = SessionId::from("group");
    let registry = registry_with(&[&id]);
    let mut tracked = registry
        .track(id.clone(), spawn("/bin/sh", &["-c", "sleep 30 & sleep 30; wait"]))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(registry.kill_and_forget(&id));
    let status = tokio::time::timeout(Duration::from_secs(5), tracked.wait())
        .await
        .expect("group leader should die")
        .unwrap();
    assert_eq!(status.signal(), Some(9));
    tracked.release();
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_duplicate_track_kills_new_child() {
    let id = SessionId::from("dup");
    let registry = registry_with(&[&id]);
    let _first = registry.track(id.clone(), spawn("/bin/sleep", &["30"])).unwrap();

    let err = registry
        .track(id.clone(), spawn("/bin/sleep", &["30"]))
        .err()
        .expect("second registration must fail");
    assert_eq!(err, RegistryError::AlreadyRegistered(id.clone()));
    assert_eq!(registry.len(), 1);
    assert!(registry.kill_and_forget(&id));
}

#[tokio::test]
async fn test_drop_unregisters() {
    let id = SessionId::from("dropped");
    let registry = registry_with(&[&id]);
    let tracked = registry.track(id.clone(), spawn("/bin/sleep", &["30"])).unwrap();
    drop(tracked);
    assert!(!registry.contains(&id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_close_and_exit_race_removes_exactly_once() {
    let registry = Arc::new(ProcessRegistry::new());

    for i in 0..50 {
        let id = SessionId::from(format!("race-{i}"));
        registry.open_session(id.clone());
        let mut tracked = registry.track(id.clone(), spawn("/bin/true", &[])).unwrap();

        let handler = tokio::spawn(async move {
            let _ = tracked.wait().await;
            tracked.release();
        });
        let closer = {
            let registry = Arc::clone(&registry);
            let id = id.clone();
            tokio::spawn(async move { registry.kill_and_forget(&id) })
        };

        handler.await.unwrap();
        let _killed = closer.await.unwrap();
        assert!(!registry.contains(&id), "entry for {id} left behind");
        assert!(!registry.kill_and_forget(&id));
    }
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_killing_one_session_spares_the_other() {
    let a = SessionId::from("session-a");
    let b = SessionId::from("session-b");
    let registry = registry_with(&[&a, &b]);

    let mut tracked_a = registry.track(a.clone(), spawn("/bin/sleep", &["30"])).unwrap();
    let mut tracked_b = registry
        .track(b.clone(), spawn("/bin/sh", &["-c", "sleep 0.5; exit 4"]))
        .unwrap();
    let pid_b = tracked_b.pid().unwrap();

    let waiter_a = tokio::spawn(async move {
        let status = tracked_a.wait().await;
        tracked_a.release();
        status
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(registry.kill_and_forget(&a));
    let status_a = tokio::time::timeout(Duration::from_secs(5), waiter_a)
        .await
        .expect("killed session should be reaped")
        .unwrap()
        .unwrap();
    assert_eq!(status_a.signal(), Some(9));

    assert!(registry.contains(&b), "other session must stay registered");
    assert_eq!(registry.pid(&b), Some(pid_b));
    assert!(is_alive(pid_b), "other session's process must keep running");

    let status_b = tracked_b.wait().await.unwrap();
    assert_eq!(status_b.code(), Some(4));
    tracked_b.release();
    assert!(registry.is_empty());
    assert!(registry.is_open(&b));
    assert!(!registry.is_open(&a));
}

#[tokio::test]
async fn test_track_after_close_kills_child() {
    let id = SessionId::from("closed-first");
    let registry = registry_with(&[&id]);
    assert!(!registry.kill_and_forget(&id));

    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("marker");
    let script = format!("sleep 0.3; echo survived > {}", marker.display());
    let err = registry
        .track(id.clone(), spawn("/bin/sh", &["-c", &script]))
        .err()
        .expect("a closed session must not accept a process");
    assert_eq!(err, RegistryError::Closed(id.clone()));
    assert!(registry.is_empty());

    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(!marker.exists(), "refused process kept running");
}
