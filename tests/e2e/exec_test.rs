#[allow(dead_code, unused_imports)]
mod helpers;

use std::os::unix::fs::PermissionsExt;
use std::time::Duration;

use helpers::*;
use russh::ChannelMsg;

#[tokio::test]
async fn test_exec_returns_output_and_status() {
    let broker = start_broker().await;
    let handle = login(broker.addr).await;
    let out = exec(&handle, "echo hello from the device").await;
    assert_eq!(out.stdout, "hello from the device\n");
    assert_eq!(out.stderr, "");
    assert_eq!(out.exit_status, Some(0));
}

#[tokio::test]
async fn test_exec_separates_stderr_and_propagates_exit_code() {
    let broker = start_broker().await;
    let handle = login(broker.addr).await;
    let out = exec(&handle, "/bin/sh -c 'echo out; echo err >&2; exit 42'").await;
    assert_eq!(out.stdout, "out\n");
    assert_eq!(out.stderr, "err\n");
    assert_eq!(out.exit_status, Some(42));
}

#[tokio::test]
async fn test_exec_quoting_reaches_argv() {
    let broker = start_broker().await;
    let handle = login(broker.addr).await;
    let out = exec(&handle, r#"printf '%s|' "two words" plain 'single q'"#).await;
    assert_eq!(out.stdout, "two words|plain|single q|");
}

#[tokio::test]
async fn test_exec_environment_names_device() {
    let broker = start_broker().await;
    let handle = login(broker.addr).await;
    let out = exec(&handle, "/bin/sh -c 'echo $FLEETSSHD_DEVICE $USER'").await;
    assert_eq!(out.stdout, format!("e2e-device {}\n", current_user().name));
}

#[tokio::test]
async fn test_unknown_program_reports_dispatch_failure() {
    let broker = start_broker().await;
    let handle = login(broker.addr).await;
    let out = exec(&handle, "/nonexistent/fleetsshd-e2e").await;
    assert_eq!(out.exit_status, Some(255));
    assert!(out.stderr.starts_with("fleetsshd: "), "{}", out.stderr);
}

#[tokio::test]
async fn test_malformed_command_is_refused() {
    let broker = start_broker().await;
    let handle = login(broker.addr).await;
    let mut channel = handle.channel_open_session().await.unwrap();
    channel.exec(true, "echo 'unterminated").await.unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Failure) => return true,
                Some(ChannelMsg::Success) | None => return false,
                Some(_) => {}
            }
        }
    })
    .await
    .unwrap();
    assert!(reply, "exec with unbalanced quotes should get channel failure");
    assert!(broker.ctx.registry.is_empty());
}

#[tokio::test]
async fn test_second_session_channel_is_refused() {
    let broker = start_broker().await;
    let handle = login(broker.addr).await;
    let first = handle.channel_open_session().await.unwrap();
    first.exec(true, "sleep 5").await.unwrap();

    assert!(handle.channel_open_session().await.is_err());
    first.close().await.unwrap();
}

#[tokio::test]
async fn test_pty_shell_session() {
    let dir = tempfile::tempdir().unwrap();
    let shell = dir.path().join("login-shell");
    std::fs::write(
        &shell,
        "#!/bin/sh\necho \"ready $TERM\"\nread line\necho \"got:$line\"\nexit 6\n",
    )
    .unwrap();
    std::fs::set_permissions(&shell, std::fs::Permissions::from_mode(0o755)).unwrap();

    let broker = start_broker_with(|cfg| {
        cfg.session.shell = Some(shell.to_string_lossy().into_owned());
    })
    .await;
    let handle = login(broker.addr).await;
    let mut channel = handle.channel_open_session().await.unwrap();
    channel
        .request_pty(true, "vt100", 80, 24, 0, 0, &[])
        .await
        .unwrap();
    channel.request_shell(true).await.unwrap();

    let mut output = String::new();
    let mut exit_status = None;
    let mut sent = false;
    let _ = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => {
                    output.push_str(&String::from_utf8_lossy(&data));
                    if !sent && output.contains("ready") {
                        sent = true;
                        channel.data(&b"ping\n"[..]).await.unwrap();
                    }
                }
                ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
                ChannelMsg::Close => break,
                _ => {}
            }
        }
    })
    .await;

    assert!(output.contains("ready vt100"), "{output}");
    assert!(output.contains("got:ping"), "{output}");
    assert_eq!(exit_status, Some(6));
}
