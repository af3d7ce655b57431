//! Connection teardown: every way a connection can end goes through
//! [`ConnectionSupervisor::close`], which reclaims the session's process
//! before the transport is released.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::audit::AuditLogger;
use crate::session::registry::ProcessRegistry;
use crate::session::SessionId;

/// Live connections by session id, each with a token that closes it.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    connections: DashMap<SessionId, CancellationToken>,
    shutdown: CancellationToken,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection. Its token is also cancelled by [`Self::close_all`].
    pub fn register(&self, id: SessionId) -> CancellationToken {
        let token = self.shutdown.child_token();
        self.connections.insert(id, token.clone());
        token
    }

    /// Close one connection. Returns whether it was live.
    pub fn close(&self, id: &SessionId) -> bool {
        match self.connections.remove(id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn close_all(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn forget(&self, id: &SessionId) {
        self.connections.remove(id);
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.connections.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

}

/// Owns the lifetime of one accepted connection.
pub struct ConnectionSupervisor {
    session_id: SessionId,
    peer_addr: SocketAddr,
    registry: Arc<ProcessRegistry>,
    connections: Arc<ConnectionTable>,
    audit: Arc<AuditLogger>,
    closed: CancellationToken,
    opened_at: Instant,
    done: bool,
}

impl ConnectionSupervisor {
    pub fn new(
        session_id: SessionId,
        peer_addr: SocketAddr,
        registry: Arc<ProcessRegistry>,
        connections: Arc<ConnectionTable>,
        audit: Arc<AuditLogger>,
    ) -> Self {
        let closed = connections.register(session_id.clone());
        registry.open_session(session_id.clone());
        audit.log_connection_new(&peer_addr, session_id.as_str());
        Self {
            session_id,
            peer_addr,
            registry,
            connections,
            audit,
            closed,
            opened_at: Instant::now(),
            done: false,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Drive `connection` until it finishes or the connection is closed from
    /// the table. The session's process is killed before `connection` is dropped.
    pub async fn run<F, E>(mut self, connection: F) -> Result<(), E>
    where
        F: Future<Output = Result<(), E>>,
    {
        tokio::pin!(connection);
        let result = tokio::select! {
            result = &mut connection => result,
            _ = self.closed.cancelled() => {
                debug!(session_id = %self.session_id, "Connection closed by server");
                Ok(())
            }
        };
        self.close();
        result
    }

    /// Close the session's registry slot, killing its process if one is still
    /// registered, and forget the connection. Idempotent. Returns whether a
    /// process was killed.
    pub fn close(&mut self) -> bool {
        if self.done {
            return false;
        }
        self.done = true;

        let killed = self.registry.kill_and_forget(&self.session_id);
        if killed {
            info!(
                session_id = %self.session_id,
                peer = %self.peer_addr,
                "Killed session process on connection close"
            );
            self.audit.log_process_killed(
                &self.peer_addr,
                "connection closed",
                self.session_id.as_str(),
            );
        }
        self.connections.forget(&self.session_id);

        let duration_ms = self.opened_at.elapsed().as_millis() as u64;
        self.audit
            .log_connection_closed(&self.peer_addr, duration_ms, self.session_id.as_str());
        debug!(session_id = %self.session_id, duration_ms, "Connection closed");
        killed
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        self.close();
    }
}
