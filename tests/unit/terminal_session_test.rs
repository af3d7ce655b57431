// PTY path: a login-shell script on a real pseudo-terminal.

mod test_support;

use std::sync::Arc;
use std::time::Duration;

use fleetsshd::session::registry::ProcessRegistry;
use fleetsshd::session::terminal::TerminalSessionHandler;
use fleetsshd::session::{ChannelHold, DispatchError, Session, SessionIo, WindowSize};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use test_support::*;

struct Harness {
    handler: Arc<TerminalSessionHandler>,
    accounting: Arc<RecordingAccounting>,
    registry: Arc<ProcessRegistry>,
    _dir: tempfile::TempDir,
}

fn harness(shell_body: &str) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let shell = script(dir.path(), "login-shell", shell_body);
    let registry = Arc::new(ProcessRegistry::new());
    let accounting = RecordingAccounting::new();
    let ctx = handler_context(Arc::clone(&registry), accounting.clone(), Some(&shell));
    Harness {
        handler: Arc::new(TerminalSessionHandler::new(Arc::new(ctx))),
        accounting,
        registry,
        _dir: dir,
    }
}

struct Client {
    reader: ReadHalf<DuplexStream>,
    writer: WriteHalf<DuplexStream>,
    resize: mpsc::UnboundedSender<WindowSize>,
    task: tokio::task::JoinHandle<Result<u32, DispatchError>>,
}

fn start(h: &Harness, session: Session) -> Client {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (server_r, server_w) = tokio::io::split(server);
    let (reader, writer) = tokio::io::split(client);
    let (resize, resize_rx) = mpsc::unbounded_channel();
    let handler = Arc::clone(&h.handler);
    h.registry.open_session(session.id.clone());
    let task = tokio::spawn(async move {
        let mut hold = ChannelHold::new(SessionIo::new(server_r, server_w));
        let result = handler.run(&session, &mut hold, resize_rx).await;
        hold.release();
        result
    });
    Client {
        reader,
        writer,
        resize,
        task,
    }
}

impl Client {
    async fn finish(mut self) -> (Result<u32, DispatchError>, String) {
        let result = tokio::time::timeout(Duration::from_secs(10), self.task)
            .await
            .expect("terminal session should finish")
            .unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match tokio::time::timeout(Duration::from_millis(300), self.reader.read(&mut buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
                Ok(Ok(n)) => out.extend_from_slice(&buf[..n]),
            }
        }
        (result, String::from_utf8_lossy(&out).into_owned())
    }
}

#[tokio::test]
async fn test_login_shell_runs_on_terminal() {
    let h = harness(r#"echo "args:$*"; echo "term:$TERM"; test -t 0 && echo has-tty; stty size; exit 4"#);
    let client = start(&h, pty_session("pty-basic", "xterm-256color", 80, 24));
    let (result, output) = client.finish().await;

    assert_eq!(result.unwrap(), 4);
    assert!(output.contains("args:--login"), "{output}");
    assert!(output.contains("term:xterm-256color"), "{output}");
    assert!(output.contains("has-tty"), "{output}");
    assert!(output.contains("24 80"), "initial size should be applied: {output}");
    assert!(h.registry.is_empty());
}

#[tokio::test]
async fn test_login_accounting_start_and_end() {
    let h = harness("exit 0");
    let client = start(&h, pty_session("pty-utmp", "vt100", 80, 24));
    let (result, _) = client.finish().await;
    assert_eq!(result.unwrap(), 0);

    let started = h.accounting.started();
    let ended = h.accounting.ended();
    assert_eq!(started.len(), 1);
    assert_eq!(ended, started);
    let entry = &started[0];
    assert_eq!(entry.user, current_user().name);
    assert_eq!(entry.remote_host, peer().ip().to_string());
    assert!(entry.tty.starts_with("/dev/pts"), "{:?}", entry.tty);
    assert!(entry.pid > 0);
}

#[tokio::test]
async fn test_empty_terminal_type_defaults_to_xterm() {
    let h = harness(r#"echo "term:$TERM""#);
    let client = start(&h, pty_session("pty-term", "", 80, 24));
    let (result, output) = client.finish().await;
    assert_eq!(result.unwrap(), 0);
    assert!(output.contains("term:xterm\r\n"), "{output}");
}

#[tokio::test]
async fn test_input_and_window_change_reach_terminal() {
    let h = harness("read line; echo \"got:$line\"; stty size");
    let mut client = start(&h, pty_session("pty-resize", "xterm", 80, 24));

    tokio::time::sleep(Duration::from_millis(200)).await;
    client
        .resize
        .send(WindowSize {
            cols: 132,
            rows: 50,
            ..Default::default()
        })
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    client.writer.write_all(b"hello\n").await.unwrap();

    let (result, output) = client.finish().await;
    assert_eq!(result.unwrap(), 0);
    assert!(output.contains("got:hello"), "{output}");
    assert!(output.contains("50 132"), "resize should be applied: {output}");
}

#[tokio::test]
async fn test_session_without_pty_is_refused() {
    let h = harness("exit 0");
    let client = start(&h, exec_session("no-pty", &[]));
    let (result, _) = client.finish().await;
    assert!(matches!(result, Err(DispatchError::NoTerminal)));
    assert!(h.accounting.started().is_empty());
}

#[tokio::test]
async fn test_unknown_user_writes_no_login_record() {
    let h = harness("exit 0");
    let mut session = pty_session("pty-nouser", "xterm", 80, 24);
    session.user = "no-such-user".to_string();
    let client = start(&h, session);
    let (result, _) = client.finish().await;
    assert!(matches!(result, Err(DispatchError::UnknownUser(_))));
    assert!(h.accounting.started().is_empty());
    assert!(h.registry.is_empty());
}

#[tokio::test]
async fn test_closed_connection_refuses_shell() {
    let h = harness("exit 0");
    let session = pty_session("pty-closed", "xterm", 80, 24);
    let (_client, server) = tokio::io::duplex(1024);
    let (server_r, server_w) = tokio::io::split(server);
    let (_resize, resize_rx) = mpsc::unbounded_channel();
    let mut hold = ChannelHold::new(SessionIo::new(server_r, server_w));

    let result = h.handler.run(&session, &mut hold, resize_rx).await;
    assert!(matches!(result, Err(DispatchError::Registry(_))), "{result:?}");
    assert!(h.accounting.started().is_empty());
    assert!(h.registry.is_empty());
}
