use std::net::SocketAddr;
use std::sync::Arc;

use russh::server::{Auth, Msg, Session as RusshSession};
use russh::{Channel, ChannelId, MethodKind, MethodSet};
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::auth::pubkey;
use crate::context::AppContext;
use crate::session::{ChannelControl, PtyRequest, Session, SessionId, SessionIo, WindowSize};
use crate::ssh::channel::RusshChannel;
use crate::ssh::session::ClientSession;

/// Longest command line accepted in an `exec` request.
pub const MAX_EXEC_COMMAND_LEN: usize = 32 * 1024;

/// Per-connection SSH handler
pub struct SshHandler {
    ctx: Arc<AppContext>,
    session_id: SessionId,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    session_state: ClientSession,
    /// The one session channel of this connection, until its process is dispatched.
    channel: Option<Channel<Msg>>,
    channel_id: Option<ChannelId>,
    resize_tx: Option<mpsc::UnboundedSender<WindowSize>>,
    total_auth_attempts: u32,
}

impl SshHandler {
    pub fn new(
        ctx: Arc<AppContext>,
        session_id: SessionId,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
    ) -> Self {
        Self {
            ctx,
            session_id,
            peer_addr,
            local_addr,
            session_state: ClientSession::new(),
            channel: None,
            channel_id: None,
            resize_tx: None,
            total_auth_attempts: 0,
        }
    }

    fn attempts_exhausted(&self) -> bool {
        self.total_auth_attempts >= self.ctx.config.server.max_auth_attempts
    }

    /// Refuse without consulting any verifier once the attempt budget is spent.
    fn reject_exhausted(&self, username: &str, method: &str) -> Auth {
        warn!(
            session_id = %self.session_id,
            user = %username,
            ip = %self.peer_addr,
            method = %method,
            max = self.ctx.config.server.max_auth_attempts,
            "Auth attempt limit reached"
        );
        Auth::Reject {
            proceed_with_methods: Some(MethodSet::empty()),
            partial_success: false,
        }
    }

    fn accept(&mut self, user: &str, method: &str) -> Auth {
        info!(
            session_id = %self.session_id,
            user = %user,
            ip = %self.peer_addr,
            method = %method,
            "Auth accepted"
        );
        self.session_state.authenticate(user, method);
        self.ctx
            .audit
            .log_auth_success(user, &self.peer_addr, method, self.session_id.as_str());
        Auth::Accept
    }

    fn record_auth_failure(&mut self, username: &str, method: &str) -> Auth {
        let attempts = self.total_auth_attempts;
        warn!(
            session_id = %self.session_id,
            user = %username,
            ip = %self.peer_addr,
            attempt = attempts,
            method = %method,
            "Auth denied"
        );
        self.ctx.audit.log_auth_failure(
            username,
            &self.peer_addr,
            method,
            attempts,
            self.session_id.as_str(),
        );

        if self.attempts_exhausted() {
            return Auth::Reject {
                proceed_with_methods: Some(MethodSet::empty()),
                partial_success: false,
            };
        }
        Auth::Reject {
            proceed_with_methods: Some(MethodSet::from(
                [MethodKind::Password, MethodKind::PublicKey].as_slice(),
            )),
            partial_success: false,
        }
    }

    /// Whether `channel` is this connection's session channel and still awaiting dispatch.
    fn is_pending(&self, channel: ChannelId) -> bool {
        self.session_state.authenticated
            && !self.session_state.dispatched
            && self.channel_id == Some(channel)
    }

    /// Hand the channel to the orchestrator and start the session's process.
    fn dispatch(&mut self, channel_id: ChannelId, command: Vec<String>, session: &mut RusshSession) {
        let (Some(channel), Some(user)) =
            (self.channel.take(), self.session_state.username.clone())
        else {
            let _ = session.channel_failure(channel_id);
            return;
        };
        self.session_state.dispatched = true;

        let request = Session {
            id: self.session_id.clone(),
            user,
            remote_addr: self.peer_addr,
            local_addr: self.local_addr,
            pty: self.session_state.pty.clone(),
            command,
        };
        let (resize_tx, resize_rx) = mpsc::unbounded_channel();
        self.resize_tx = Some(resize_tx);

        let control: Arc<dyn ChannelControl> =
            Arc::new(RusshChannel::new(session.handle(), channel_id));
        let (input, output) = tokio::io::split(channel.into_stream());
        let orchestrator = Arc::clone(&self.ctx.orchestrator);
        let span = info_span!("session", session_id = %request.id, user = %request.user);

        info!(
            session_id = %request.id,
            user = %request.user,
            auth_method = %self.session_state.auth_method,
            key_fingerprint = ?self.session_state.ssh_key_fingerprint,
            pty = request.pty.is_some(),
            "Session dispatched"
        );
        let _ = session.channel_success(channel_id);
        tokio::spawn(
            async move {
                orchestrator
                    .run(request, SessionIo::new(input, output), control, resize_rx)
                    .await;
            }
            .instrument(span),
        );
    }
}

impl russh::server::Handler for SshHandler {
    type Error = anyhow::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if self.attempts_exhausted() {
            return Ok(self.reject_exhausted(user, "password"));
        }
        self.total_auth_attempts += 1;
        if self.ctx.auth.auth_password(user, password) {
            Ok(self.accept(user, "password"))
        } else {
            Ok(self.record_auth_failure(user, "password"))
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &russh::keys::PublicKey,
    ) -> Result<Auth, Self::Error> {
        if self.attempts_exhausted() {
            return Ok(self.reject_exhausted(user, "publickey"));
        }
        self.total_auth_attempts += 1;
        let fingerprint = match pubkey::md5_fingerprint(public_key) {
            Ok(fingerprint) => fingerprint,
            Err(e) => {
                debug!(session_id = %self.session_id, user = %user, error = %e, "Unencodable public key");
                return Ok(self.record_auth_failure(user, "publickey"));
            }
        };
        match self.ctx.auth.authorize_public_key(user, public_key).await {
            Ok(()) => {
                self.session_state.ssh_key_fingerprint = Some(fingerprint);
                Ok(self.accept(user, "publickey"))
            }
            Err(e) => {
                debug!(
                    session_id = %self.session_id,
                    user = %user,
                    fingerprint = %fingerprint,
                    reason = %e,
                    "Public key not authorized"
                );
                Ok(self.record_auth_failure(user, "publickey"))
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut RusshSession,
    ) -> Result<bool, Self::Error> {
        if !self.session_state.authenticated {
            return Ok(false);
        }
        if self.channel_id.is_some() {
            warn!(
                session_id = %self.session_id,
                "Refusing second session channel on connection"
            );
            return Ok(false);
        }
        self.channel_id = Some(channel.id());
        self.channel = Some(channel);
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut RusshSession,
    ) -> Result<(), Self::Error> {
        if !self.is_pending(channel) {
            let _ = session.channel_failure(channel);
            return Ok(());
        }
        debug!(session_id = %self.session_id, term = %term, cols = col_width, rows = row_height, "PTY requested");
        self.session_state.pty = Some(PtyRequest {
            term: term.to_string(),
            size: WindowSize::from_wire(col_width, row_height, pix_width, pix_height),
        });
        let _ = session.channel_success(channel);
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _session: &mut RusshSession,
    ) -> Result<(), Self::Error> {
        if self.channel_id != Some(channel) {
            return Ok(());
        }
        let size = WindowSize::from_wire(col_width, row_height, pix_width, pix_height);
        if let Some(tx) = &self.resize_tx {
            let _ = tx.send(size);
        } else if let Some(pty) = self.session_state.pty.as_mut() {
            pty.size = size;
        }
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut RusshSession,
    ) -> Result<(), Self::Error> {
        if !self.is_pending(channel) {
            let _ = session.channel_failure(channel);
            return Ok(());
        }
        self.dispatch(channel, Vec::new(), session);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut RusshSession,
    ) -> Result<(), Self::Error> {
        if !self.is_pending(channel) {
            let _ = session.channel_failure(channel);
            return Ok(());
        }

        if data.len() > MAX_EXEC_COMMAND_LEN {
            warn!(
                session_id = %self.session_id,
                data_len = data.len(),
                "exec_request data too large, rejecting"
            );
            let _ = session.channel_failure(channel);
            return Ok(());
        }

        let argv = std::str::from_utf8(data).ok().and_then(shlex::split);
        let Some(argv) = argv else {
            warn!(session_id = %self.session_id, "Malformed exec command line, rejecting");
            let _ = session.channel_failure(channel);
            return Ok(());
        };
        debug!(session_id = %self.session_id, argv = ?argv, "exec_request received");
        self.dispatch(channel, argv, session);
        Ok(())
    }

    /// Subsystems (sftp) are not offered.
    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut RusshSession,
    ) -> Result<(), Self::Error> {
        warn!(
            session_id = %self.session_id,
            subsystem = %name,
            user = ?self.session_state.username,
            "Subsystem denied"
        );
        let _ = session.channel_failure(channel);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut RusshSession,
    ) -> Result<(), Self::Error> {
        if self.channel_id != Some(channel) {
            return Ok(());
        }
        self.channel = None;
        self.resize_tx = None;
        if self.ctx.registry.kill_and_forget(&self.session_id) {
            info!(session_id = %self.session_id, "Client closed channel, killed session process");
            self.ctx.audit.log_process_killed(
                &self.peer_addr,
                "channel closed",
                self.session_id.as_str(),
            );
        }
        Ok(())
    }
}
