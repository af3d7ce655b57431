// ConnectionSupervisor: every way a connection ends reclaims its process.

use std::os::unix::process::ExitStatusExt;
use std::sync::Arc;
use std::time::Duration;

use fleetsshd::audit::AuditLogger;
use fleetsshd::session::registry::ProcessRegistry;
use fleetsshd::session::SessionId;
use fleetsshd::ssh::supervisor::{ConnectionSupervisor, ConnectionTable};
use tokio::process::Command;

struct Fixture {
    registry: Arc<ProcessRegistry>,
    table: Arc<ConnectionTable>,
    audit: Arc<AuditLogger>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            registry: Arc::new(ProcessRegistry::new()),
            table: Arc::new(ConnectionTable::new()),
            audit: Arc::new(AuditLogger::new_noop()),
        }
    }

    fn supervisor(&self, id: &str) -> ConnectionSupervisor {
        ConnectionSupervisor::new(
            SessionId::from(id),
            "198.51.100.7:40022".parse().unwrap(),
            Arc::clone(&self.registry),
            Arc::clone(&self.table),
            Arc::clone(&self.audit),
        )
    }

    /// Start `sleep 30` as the session's process; the returned task reaps it.
    /// The connection's supervisor must already exist.
    fn start_process(&self, id: &str) -> tokio::task::JoinHandle<std::process::ExitStatus> {
        let child = Command::new("/bin/sleep")
            .arg("30")
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let mut tracked = self.registry.track(SessionId::from(id), child).unwrap();
        tokio::spawn(async move {
            let status = tracked.wait().await.unwrap();
            tracked.release();
            status
        })
    }

    fn event_types(&self) -> Vec<&'static str> {
        self.audit
            .get_recent_events(100)
            .iter()
            .map(|e| e.event_type())
            .collect()
    }
}

async fn reaped(task: tokio::task::JoinHandle<std::process::ExitStatus>) -> std::process::ExitStatus {
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("process should be killed")
        .unwrap()
}

#[tokio::test]
async fn test_transport_end_kills_orphaned_process() {
    let f = Fixture::new();
    let sup = f.supervisor("dropped");
    let waiter = f.start_process("dropped");

    // The connection future finishing stands in for the peer vanishing.
    let result: Result<(), std::io::Error> = sup
        .run(async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Err(std::io::Error::from(std::io::ErrorKind::ConnectionReset))
        })
        .await;
    assert!(result.is_err());

    assert_eq!(reaped(waiter).await.signal(), Some(9));
    assert!(f.registry.is_empty());
    assert!(f.table.is_empty());
    assert_eq!(
        f.event_types(),
        vec!["connection.new", "process.killed", "connection.closed"]
    );
}

#[tokio::test]
async fn test_table_close_ends_connection_and_process() {
    let f = Fixture::new();
    let sup = f.supervisor("admin-close");
    let waiter = f.start_process("admin-close");
    let connection = tokio::spawn(sup.run(std::future::pending::<Result<(), ()>>()));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(f.table.contains(&SessionId::from("admin-close")));
    assert!(f.table.close(&SessionId::from("admin-close")));

    connection.await.unwrap().unwrap();
    assert_eq!(reaped(waiter).await.signal(), Some(9));
    assert!(f.registry.is_empty());
}

#[tokio::test]
async fn test_close_all_reaches_every_connection() {
    let f = Fixture::new();
    let mut waiters = Vec::new();
    let mut connections = Vec::new();
    for id in ["a", "b", "c"] {
        let sup = f.supervisor(id);
        waiters.push(f.start_process(id));
        connections.push(tokio::spawn(sup.run(std::future::pending::<Result<(), ()>>())));
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(f.table.len(), 3);

    f.table.close_all();
    for c in connections {
        c.await.unwrap().unwrap();
    }
    for w in waiters {
        reaped(w).await;
    }
    assert!(f.table.is_empty());
    assert!(f.registry.is_empty());
}

#[tokio::test]
async fn test_clean_exit_then_close_is_noop() {
    let f = Fixture::new();
    let sup = f.supervisor("clean");
    let r: Result<(), ()> = sup.run(async { Ok(()) }).await;
    r.unwrap();
    assert_eq!(f.event_types(), vec!["connection.new", "connection.closed"]);
}

#[tokio::test]
async fn test_aborted_task_still_closes() {
    let f = Fixture::new();
    let sup = f.supervisor("aborted");
    let waiter = f.start_process("aborted");
    let connection = tokio::spawn(sup.run(std::future::pending::<Result<(), ()>>()));
    tokio::time::sleep(Duration::from_millis(20)).await;

    connection.abort();
    let _ = connection.await;
    assert_eq!(reaped(waiter).await.signal(), Some(9));
    assert!(f.table.is_empty());
}

#[tokio::test]
async fn test_process_started_after_close_is_refused() {
    let f = Fixture::new();
    let sup = f.supervisor("late");
    let r: Result<(), ()> = sup.run(async { Ok(()) }).await;
    r.unwrap();

    let child = Command::new("/bin/sleep")
        .arg("30")
        .process_group(0)
        .kill_on_drop(true)
        .spawn()
        .unwrap();
    let pid = child.id().unwrap();
    assert!(f.registry.track(SessionId::from("late"), child).is_err());
    assert!(f.registry.is_empty());

    let gone = async {
        while nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), gone)
        .await
        .expect("refused process should be killed and reaped");
}
