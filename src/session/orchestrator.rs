//! Per-session state machine: dispatch to the terminal or exec handler,
//! run the keepalive alongside, report the exit status and close.

use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::exec::ExecSessionHandler;
use super::keepalive::KeepAliveMonitor;
use super::terminal::TerminalSessionHandler;
use super::{
    ChannelControl, ChannelHold, HandlerContext, Session, SessionIo, SessionMode, SessionPhase,
    WindowSize,
};
use crate::audit::AuditLogger;

/// Exit status reported when the session could not be started.
pub const DISPATCH_FAILURE_EXIT: u32 = 255;

/// Result of one session, as reported to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub mode: SessionMode,
    pub exit_code: u32,
    /// Dispatch failure message, if the process never ran to completion.
    pub error: Option<String>,
}

pub struct SessionOrchestrator {
    terminal: TerminalSessionHandler,
    exec: ExecSessionHandler,
    keepalive: KeepAliveMonitor,
    audit: Arc<AuditLogger>,
}

impl SessionOrchestrator {
    pub fn new(ctx: Arc<HandlerContext>, keepalive: KeepAliveMonitor, audit: Arc<AuditLogger>) -> Self {
        Self {
            terminal: TerminalSessionHandler::new(Arc::clone(&ctx)),
            exec: ExecSessionHandler::new(ctx),
            keepalive,
            audit,
        }
    }

    /// The handler a session goes to: a negotiated terminal wins over everything else.
    pub fn mode_for(session: &Session) -> SessionMode {
        if session.wants_pty() {
            SessionMode::Pty
        } else {
            SessionMode::Exec
        }
    }

    /// Drive a session from dispatch to close. Never fails: dispatch errors are
    /// reported on the channel's stderr with exit status 255. The channel
    /// halves stay open until the exit status and close have been sent.
    pub async fn run<R, W>(
        &self,
        session: Session,
        io: SessionIo<R, W>,
        control: Arc<dyn ChannelControl>,
        resize: mpsc::UnboundedReceiver<WindowSize>,
    ) -> SessionOutcome
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let started = Instant::now();
        let mode = Self::mode_for(&session);
        let mut phase = PhaseTracker::new(&session);

        phase.advance(SessionPhase::Dispatched(mode));
        self.audit.log_session_started(&session, mode);

        let keepalive_done = CancellationToken::new();
        let keepalive = self.keepalive.spawn(
            session.id.clone(),
            Arc::clone(&control),
            keepalive_done.clone(),
        );

        phase.advance(SessionPhase::Running);
        let mut hold = ChannelHold::new(io);
        let result = match mode {
            SessionMode::Pty => self.terminal.run(&session, &mut hold, resize).await,
            SessionMode::Exec => {
                self.exec
                    .run(&session, &mut hold, Arc::clone(&control))
                    .await
            }
        };

        phase.advance(SessionPhase::Terminating);
        keepalive_done.cancel();
        if let Some(task) = keepalive {
            if let Err(e) = task.await {
                debug!(session_id = %session.id, error = %e, "Keepalive task ended abnormally");
            }
        }

        let outcome = match result {
            Ok(exit_code) => SessionOutcome {
                mode,
                exit_code,
                error: None,
            },
            Err(e) => {
                error!(
                    session_id = %session.id,
                    user = %session.user,
                    mode = %mode,
                    error = %e,
                    "Session dispatch failed"
                );
                let message = format!("fleetsshd: {}\r\n", e);
                if let Err(e) = control.write_stderr(message.as_bytes()).await {
                    debug!(session_id = %session.id, error = %e, "Could not report dispatch failure");
                }
                SessionOutcome {
                    mode,
                    exit_code: DISPATCH_FAILURE_EXIT,
                    error: Some(e.to_string()),
                }
            }
        };

        if let Err(e) = control.exit_status(outcome.exit_code).await {
            debug!(session_id = %session.id, error = %e, "Could not send exit status");
        }
        if let Err(e) = control.close().await {
            debug!(session_id = %session.id, error = %e, "Could not close channel");
        }
        hold.release();
        phase.advance(SessionPhase::Closed);

        let duration_ms = started.elapsed().as_millis() as u64;
        self.audit.log_session_ended(
            &session,
            mode,
            outcome.exit_code,
            duration_ms,
            outcome.error.clone(),
        );
        info!(
            session_id = %session.id,
            user = %session.user,
            mode = %mode,
            exit_code = outcome.exit_code,
            duration_ms,
            "Session closed"
        );
        outcome
    }
}

/// Current phase of one session; only forward moves are accepted.
struct PhaseTracker<'a> {
    session: &'a Session,
    current: SessionPhase,
}

impl<'a> PhaseTracker<'a> {
    fn new(session: &'a Session) -> Self {
        Self {
            session,
            current: SessionPhase::Authenticated,
        }
    }

    fn advance(&mut self, next: SessionPhase) {
        if !self.current.can_advance_to(next) {
            warn!(
                session_id = %self.session.id,
                from = %self.current,
                to = %next,
                "Ignoring backwards session phase change"
            );
            return;
        }
        debug!(session_id = %self.session.id, from = %self.current, to = %next, "Session phase");
        self.current = next;
    }
}
