// Exec path: real processes behind an in-memory duplex channel.

mod test_support;

use std::sync::Arc;
use std::time::Duration;

use fleetsshd::os::utmp::NoLoginAccounting;
use fleetsshd::session::command::DEFAULT_PATH;
use fleetsshd::session::exec::ExecSessionHandler;
use fleetsshd::session::registry::ProcessRegistry;
use fleetsshd::session::{ChannelHold, DispatchError, Session, SessionIo};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf};
use test_support::*;

struct Harness {
    handler: ExecSessionHandler,
    registry: Arc<ProcessRegistry>,
    control: Arc<RecordingControl>,
    _dir: tempfile::TempDir,
}

fn harness(shell_body: Option<&str>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let shell = shell_body.map(|body| script(dir.path(), "login-shell", body));
    let registry = Arc::new(ProcessRegistry::new());
    let ctx = handler_context(Arc::clone(&registry), Arc::new(NoLoginAccounting), shell.as_deref());
    Harness {
        handler: ExecSessionHandler::new(Arc::new(ctx)),
        registry,
        control: RecordingControl::new(),
        _dir: dir,
    }
}

/// Read until EOF or until no more bytes arrive for a short while.
async fn collect(reader: &mut ReadHalf<DuplexStream>) -> String {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match tokio::time::timeout(Duration::from_millis(300), reader.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
            Ok(Ok(n)) => out.extend_from_slice(&buf[..n]),
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

async fn run(h: &Harness, session: &Session, stdin: &[u8]) -> (Result<u32, DispatchError>, String) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (server_r, server_w) = tokio::io::split(server);
    let (mut client_r, mut client_w) = tokio::io::split(client);

    client_w.write_all(stdin).await.unwrap();
    client_w.shutdown().await.unwrap();

    h.registry.open_session(session.id.clone());
    let mut hold = ChannelHold::new(SessionIo::new(server_r, server_w));
    let result = tokio::time::timeout(
        Duration::from_secs(10),
        h.handler.run(session, &mut hold, h.control.clone()),
    )
    .await
    .expect("exec session should finish");
    let output = collect(&mut client_r).await;
    hold.release();
    (result, output)
}

#[tokio::test]
async fn test_argv_runs_verbatim() {
    let h = harness(None);
    let session = exec_session("argv", &["/bin/echo", "hello", "  spaced  "]);
    let (result, output) = run(&h, &session, b"").await;
    assert_eq!(result.unwrap(), 0);
    assert_eq!(output, "hello   spaced  \n");
    assert!(h.control.stderr_text().is_empty());
}

#[tokio::test]
async fn test_stdin_is_relayed_and_eof_delivered() {
    let h = harness(None);
    let session = exec_session("cat", &["/bin/cat"]);
    let (result, output) = run(&h, &session, b"ping\npong\n").await;
    assert_eq!(result.unwrap(), 0);
    assert_eq!(output, "ping\npong\n");
}

#[tokio::test]
async fn test_stderr_goes_to_extended_data_and_exit_code_propagates() {
    let h = harness(None);
    let session = exec_session("err", &["/bin/sh", "-c", "echo out; echo oops >&2; exit 7"]);
    let (result, output) = run(&h, &session, b"").await;
    assert_eq!(result.unwrap(), 7);
    assert_eq!(output, "out\n");
    assert_eq!(h.control.stderr_text(), "oops\n");
}

#[tokio::test]
async fn test_signal_death_maps_to_128_plus_signal() {
    let h = harness(None);
    let session = exec_session("sig", &["/bin/sh", "-c", "kill -TERM $$"]);
    let (result, _) = run(&h, &session, b"").await;
    assert_eq!(result.unwrap(), 128 + 15);
}

#[tokio::test]
async fn test_environment_is_rebuilt() {
    let h = harness(None);
    let session = exec_session("env", &["/bin/sh", "-c", "env"]);
    let (result, output) = run(&h, &session, b"").await;
    assert_eq!(result.unwrap(), 0);

    let user = current_user();
    assert!(output.contains(&format!("USER={}\n", user.name)), "{output}");
    assert!(output.contains(&format!("LOGNAME={}\n", user.name)), "{output}");
    assert!(output.contains(&format!("PATH={}\n", DEFAULT_PATH)), "{output}");
    assert!(output.contains(&format!("FLEETSSHD_DEVICE={}\n", DEVICE)), "{output}");
    assert!(!output.contains("\nTERM="), "exec sessions get no TERM: {output}");
}

#[tokio::test]
async fn test_empty_argv_runs_login_shell_without_terminal() {
    let h = harness(Some(r#"echo "args:$*"; test -t 0 && echo tty || echo notty"#));
    let session = exec_session("shell", &[]);
    let (result, output) = run(&h, &session, b"").await;
    assert_eq!(result.unwrap(), 0);
    assert_eq!(output, "args:--login\nnotty\n");
}

#[tokio::test]
async fn test_process_registered_while_running() {
    let h = harness(None);
    let session = exec_session("registered", &["/bin/sleep", "0.3"]);
    let registry = Arc::clone(&h.registry);
    let id = session.id.clone();
    let seen = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        registry.contains(&id)
    });
    let (result, _) = run(&h, &session, b"").await;
    assert_eq!(result.unwrap(), 0);
    assert!(seen.await.unwrap(), "process should be registered while it runs");
    assert!(h.registry.is_empty());
}

#[tokio::test]
async fn test_unknown_user_is_dispatch_failure() {
    let h = harness(None);
    let mut session = exec_session("nouser", &["/bin/true"]);
    session.user = "no-such-user".to_string();
    let (result, _) = run(&h, &session, b"").await;
    assert!(matches!(result, Err(DispatchError::UnknownUser(ref u)) if u == "no-such-user"));
    assert!(h.registry.is_empty());
}

#[tokio::test]
async fn test_missing_program_is_spawn_failure() {
    let h = harness(None);
    let session = exec_session("missing", &["/nonexistent/fleetsshd-test-bin"]);
    let (result, _) = run(&h, &session, b"").await;
    match result {
        Err(DispatchError::Spawn { program, .. }) => {
            assert_eq!(program, "/nonexistent/fleetsshd-test-bin")
        }
        other => panic!("expected spawn failure, got {other:?}"),
    }
    assert!(h.registry.is_empty());
}

#[tokio::test]
async fn test_channel_halves_survive_the_process() {
    let h = harness(None);
    let session = exec_session("halves", &["/bin/echo", "done"]);
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (server_r, server_w) = tokio::io::split(server);
    let (mut client_r, _client_w) = tokio::io::split(client);

    h.registry.open_session(session.id.clone());
    let mut hold = ChannelHold::new(SessionIo::new(server_r, server_w));
    let result = h.handler.run(&session, &mut hold, h.control.clone()).await;
    assert_eq!(result.unwrap(), 0);
    assert!(hold.held() >= 1);

    let mut buf = [0u8; 64];
    let n = client_r.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"done\n");
    // Still open: the next read waits instead of seeing EOF.
    assert!(
        tokio::time::timeout(Duration::from_millis(100), client_r.read(&mut buf))
            .await
            .is_err(),
        "channel was closed before the hold was released"
    );

    hold.release();
    let n = tokio::time::timeout(Duration::from_secs(2), client_r.read(&mut buf))
        .await
        .expect("release should close the channel")
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_closed_connection_refuses_exec() {
    let h = harness(None);
    let session = exec_session("closed", &["/bin/echo", "never"]);
    let (_client, server) = tokio::io::duplex(1024);
    let (server_r, server_w) = tokio::io::split(server);
    let mut hold = ChannelHold::new(SessionIo::new(server_r, server_w));

    // No open slot: the connection has already been torn down.
    let result = h.handler.run(&session, &mut hold, h.control.clone()).await;
    assert!(matches!(result, Err(DispatchError::Registry(_))), "{result:?}");
    assert!(h.registry.is_empty());
}
