//! Interactive sessions: login shell on a pseudo-terminal.

use std::sync::Arc;

use nix::unistd::{chown, Uid};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::command::{exit_code, CommandSpec};
use super::{ChannelHold, DispatchError, HandlerContext, Session, SessionIo, WindowSize};
use crate::os::pty::{self, Pty, PtyMaster};
use crate::os::users::LocalUser;
use crate::os::utmp::LoginEntry;

pub struct TerminalSessionHandler {
    ctx: Arc<HandlerContext>,
}

impl TerminalSessionHandler {
    pub fn new(ctx: Arc<HandlerContext>) -> Self {
        Self { ctx }
    }

    fn prepare(&self, session: &Session) -> Result<(LocalUser, CommandSpec), DispatchError> {
        let term = session.terminal_type().ok_or(DispatchError::NoTerminal)?;
        let user = self
            .ctx
            .users
            .lookup(&session.user)
            .ok_or_else(|| DispatchError::UnknownUser(session.user.clone()))?;
        let spec = CommandSpec::login_shell(&user, &self.ctx, term);
        Ok((user, spec))
    }

    /// Run the login shell until it exits and return its exit code.
    /// `resize` carries window-change events for the session's lifetime.
    /// The channel halves end up back in `hold`, still open.
    pub async fn run<R, W>(
        &self,
        session: &Session,
        hold: &mut ChannelHold<R, W>,
        mut resize: mpsc::UnboundedReceiver<WindowSize>,
    ) -> Result<u32, DispatchError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (user, spec) = self.prepare(session)?;
        let size = session.pty.as_ref().map(|p| p.size).unwrap_or_default();

        let pty = Pty::open(size).map_err(DispatchError::Pty)?;
        let spawn_err = |source| DispatchError::Spawn {
            program: spec.program.clone(),
            source,
        };
        let mut cmd = spec.build(&user).map_err(spawn_err)?;
        cmd.stdin(pty.slave().try_clone().map_err(DispatchError::Pty)?)
            .stdout(pty.slave().try_clone().map_err(DispatchError::Pty)?)
            .stderr(pty.slave().try_clone().map_err(DispatchError::Pty)?);
        let child = cmd.spawn().map_err(spawn_err)?;
        drop(cmd);
        let pid = child.id().unwrap_or_default();
        let (master, tty_path) = pty.into_master();

        let mut tracked = self.ctx.registry.track(session.id.clone(), child)?;
        let master = PtyMaster::new(master).map_err(DispatchError::Pty)?;
        let io = hold.take_io().ok_or(DispatchError::ChannelUnavailable)?;

        if let Err(e) = chown(&tty_path, Some(Uid::from_raw(user.uid)), None) {
            warn!(tty = %tty_path.display(), user = %user.name, error = %e, "Failed to chown terminal");
        }

        let login = self.ctx.accounting.session_start(LoginEntry {
            tty: tty_path.clone(),
            user: user.name.clone(),
            remote_host: session.remote_addr.ip().to_string(),
            pid,
        });
        info!(
            session_id = %session.id,
            user = %session.user,
            pid,
            tty = %tty_path.display(),
            "Terminal session started"
        );

        let relays = Relays::start(&master, io, session.id.to_string());
        let resize_task = tokio::spawn(async move {
            while let Some(size) = resize.recv().await {
                if let Err(e) = master.set_window_size(size) {
                    debug!(error = %e, "Window resize failed");
                }
            }
        });

        let status = tracked.wait().await;
        self.ctx.accounting.session_end(login);
        tracked.release();

        resize_task.abort();
        relays.finish(self.ctx.output_drain_timeout, hold).await;

        let status = status.map_err(DispatchError::Wait)?;
        let code = exit_code(status);
        if status.success() {
            debug!(session_id = %session.id, "Shell exited");
        } else {
            warn!(session_id = %session.id, exit_code = code, "Shell exited with error");
        }
        Ok(code)
    }
}

/// Byte pumps between the channel and the terminal master. Each returns the
/// channel half it owned.
struct Relays<R, W> {
    input: JoinHandle<R>,
    output: JoinHandle<W>,
}

impl<R, W> Relays<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn start(master: &PtyMaster, io: SessionIo<R, W>, session_id: String) -> Self {
        let mut reader = master.clone();
        let mut writer = master.clone();
        let SessionIo {
            mut input,
            mut output,
        } = io;

        let sid = session_id.clone();
        let input_task = tokio::spawn(async move {
            match tokio::io::copy(&mut input, &mut writer).await {
                Ok(bytes) => debug!(session_id = %sid, bytes, "Terminal input relay finished"),
                Err(e) => warn!(session_id = %sid, error = %e, "Terminal input relay ended with error"),
            }
            input
        });
        let output_task = tokio::spawn(async move {
            match tokio::io::copy(&mut reader, &mut output).await {
                Ok(bytes) => debug!(session_id = %session_id, bytes, "Terminal output relay finished"),
                Err(e) if pty::is_hangup(&e) => {
                    debug!(session_id = %session_id, "Terminal hung up")
                }
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Terminal output relay ended with error")
                }
            }
            let _ = output.flush().await;
            output
        });
        Self {
            input: input_task,
            output: output_task,
        }
    }

    /// Wait for the output relay to drain, then hand both relays to `hold`.
    async fn finish(self, drain_timeout: std::time::Duration, hold: &mut ChannelHold<R, W>) {
        hold.keep_relay(self.input);
        let mut output = self.output;
        match tokio::time::timeout(drain_timeout, &mut output).await {
            Ok(Ok(half)) => hold.keep(half),
            Ok(Err(e)) => debug!(error = %e, "Terminal output relay task failed"),
            Err(_) => {
                debug!("Terminal output still open after shell exit, abandoning relay");
                hold.keep_relay(output);
            }
        }
    }
}
