//! Non-interactive sessions: argv with piped standard streams.

use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::command::{exit_code, CommandSpec};
use super::{ChannelControl, ChannelHold, DispatchError, HandlerContext, Session, SessionIo};
use crate::os::users::LocalUser;

/// Runs the client's command with stdin/stdout pipes relayed to the channel
/// and stderr forwarded as extended data.
pub struct ExecSessionHandler {
    ctx: Arc<HandlerContext>,
}

impl ExecSessionHandler {
    pub fn new(ctx: Arc<HandlerContext>) -> Self {
        Self { ctx }
    }

    fn prepare(&self, session: &Session) -> Result<(LocalUser, CommandSpec), DispatchError> {
        let user = self
            .ctx
            .users
            .lookup(&session.user)
            .ok_or_else(|| DispatchError::UnknownUser(session.user.clone()))?;
        let spec = CommandSpec::exec(&user, &self.ctx, &session.command);
        Ok((user, spec))
    }

    /// Run to completion and return the exit code. The channel halves end up
    /// back in `hold`, still open.
    pub async fn run<R, W>(
        &self,
        session: &Session,
        hold: &mut ChannelHold<R, W>,
        control: Arc<dyn ChannelControl>,
    ) -> Result<u32, DispatchError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (user, spec) = self.prepare(session)?;

        let spawn_err = |source| DispatchError::Spawn {
            program: spec.program.clone(),
            source,
        };
        let mut cmd = spec.build(&user).map_err(spawn_err)?;
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn().map_err(spawn_err)?;
        drop(cmd);

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let mut tracked = self.ctx.registry.track(session.id.clone(), child)?;
        info!(
            session_id = %session.id,
            user = %session.user,
            pid = ?tracked.pid(),
            argv = ?spec.argv(),
            "Exec session started"
        );

        let SessionIo { input, output } = hold.take_io().ok_or(DispatchError::ChannelUnavailable)?;
        let sid = session.id.to_string();
        let input_task = match stdin {
            Some(stdin) => tokio::spawn(relay_input(input, stdin, sid.clone())),
            None => tokio::spawn(async move { input }),
        };
        let output_task = match stdout {
            Some(stdout) => tokio::spawn(relay_output(stdout, output, sid.clone())),
            None => tokio::spawn(async move { output }),
        };
        let stderr_task =
            stderr.map(|stderr| tokio::spawn(relay_stderr(stderr, control, sid.clone())));
        hold.keep_relay(input_task);

        let status = tracked.wait().await;
        tracked.release();

        self.drain_output(output_task, hold).await;
        if let Some(mut task) = stderr_task {
            if tokio::time::timeout(self.ctx.output_drain_timeout, &mut task)
                .await
                .is_err()
            {
                debug!(session_id = %session.id, "Stderr still open after process exit, abandoning relay");
                task.abort();
            }
        }

        let status = status.map_err(DispatchError::Wait)?;
        let code = exit_code(status);
        if status.success() {
            debug!(session_id = %session.id, "Exec process exited");
        } else {
            warn!(session_id = %session.id, exit_code = code, "Exec process exited with error");
        }
        Ok(code)
    }

    async fn drain_output<R, W>(&self, mut task: JoinHandle<W>, hold: &mut ChannelHold<R, W>)
    where
        R: Send + 'static,
        W: Send + 'static,
    {
        match tokio::time::timeout(self.ctx.output_drain_timeout, &mut task).await {
            Ok(Ok(output)) => hold.keep(output),
            Ok(Err(e)) => debug!(error = %e, "Stdout relay task failed"),
            Err(_) => {
                debug!("Output still open after process exit, abandoning relay");
                hold.keep_relay(task);
            }
        }
    }
}

/// Channel to process stdin. Dropping the pipe at channel EOF delivers EOF to the process.
/// Returns the channel half.
async fn relay_input<R, W>(mut input: R, mut stdin: W, session_id: String) -> R
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match tokio::io::copy(&mut input, &mut stdin).await {
        Ok(bytes) => debug!(session_id = %session_id, bytes, "Stdin relay finished"),
        Err(e) => warn!(session_id = %session_id, error = %e, "Stdin relay ended with error"),
    }
    let _ = stdin.shutdown().await;
    input
}

/// Process stdout to channel. Returns the channel half.
async fn relay_output<R, W>(mut stdout: R, mut output: W, session_id: String) -> W
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match tokio::io::copy(&mut stdout, &mut output).await {
        Ok(bytes) => debug!(session_id = %session_id, bytes, "Stdout relay finished"),
        Err(e) => warn!(session_id = %session_id, error = %e, "Stdout relay ended with error"),
    }
    let _ = output.flush().await;
    output
}

async fn relay_stderr<R>(mut stderr: R, control: Arc<dyn ChannelControl>, session_id: String)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 8192];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = control.write_stderr(&buf[..n]).await {
                    warn!(session_id = %session_id, error = %e, "Stderr relay ended with error");
                    break;
                }
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Stderr read failed");
                break;
            }
        }
    }
}
