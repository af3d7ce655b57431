pub mod events;

use events::AuditEvent;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::session::{Session, SessionMode};

const AUDIT_CHANNEL_CAPACITY: usize = 10_000;
const RECENT_EVENTS_CAPACITY: usize = 100;

/// Asynchronous JSON-lines audit trail
pub struct AuditLogger {
    sender: mpsc::Sender<AuditEvent>,
    dropped_count: AtomicU64,
    recent_events: Arc<Mutex<VecDeque<AuditEvent>>>,
}

impl AuditLogger {
    /// Spawns the writer task; must be called inside a tokio runtime.
    pub fn new(log_path: Option<PathBuf>) -> Self {
        let (sender, receiver) = mpsc::channel(AUDIT_CHANNEL_CAPACITY);
        tokio::spawn(audit_writer_task(receiver, log_path));
        Self {
            sender,
            dropped_count: AtomicU64::new(0),
            recent_events: Arc::new(Mutex::new(VecDeque::with_capacity(RECENT_EVENTS_CAPACITY))),
        }
    }

    /// Logger without a writer (no tokio runtime required).
    /// Events still reach the in-memory ring buffer.
    pub fn new_noop() -> Self {
        let (sender, _receiver) = mpsc::channel(1);
        Self {
            sender,
            dropped_count: AtomicU64::new(0),
            recent_events: Arc::new(Mutex::new(VecDeque::with_capacity(RECENT_EVENTS_CAPACITY))),
        }
    }

    /// Number of audit events dropped due to channel overflow
    pub fn dropped_count(&self) -> u64 {
        self.dropped_count.load(Ordering::Relaxed)
    }

    pub fn log_auth_success(&self, username: &str, source: &SocketAddr, method: &str, sid: &str) {
        self.try_send(AuditEvent::auth_success(username, source, method, sid));
    }

    pub fn log_auth_failure(
        &self,
        username: &str,
        source: &SocketAddr,
        method: &str,
        attempt: u32,
        sid: &str,
    ) {
        self.try_send(AuditEvent::auth_failure(
            username, source, method, attempt, sid,
        ));
    }

    pub fn log_connection_new(&self, source: &SocketAddr, sid: &str) {
        self.try_send(AuditEvent::connection_new(source, sid));
    }

    pub fn log_connection_closed(&self, source: &SocketAddr, duration_ms: u64, sid: &str) {
        self.try_send(AuditEvent::connection_closed(source, duration_ms, sid));
    }

    pub fn log_session_started(&self, session: &Session, mode: SessionMode) {
        self.try_send(AuditEvent::session_started(
            &session.user,
            &session.remote_addr,
            &mode.to_string(),
            &session.command,
            session.terminal_type(),
            session.id.as_str(),
        ));
    }

    pub fn log_session_ended(
        &self,
        session: &Session,
        mode: SessionMode,
        exit_code: u32,
        duration_ms: u64,
        error: Option<String>,
    ) {
        self.try_send(AuditEvent::session_ended(
            &session.user,
            &session.remote_addr,
            &mode.to_string(),
            exit_code,
            duration_ms,
            error,
            session.id.as_str(),
        ));
    }

    pub fn log_process_killed(&self, source: &SocketAddr, reason: &str, sid: &str) {
        self.try_send(AuditEvent::process_killed(source, reason, sid));
    }

    /// Return the most recent audit events (up to `max`), newest last.
    pub fn get_recent_events(&self, max: usize) -> Vec<AuditEvent> {
        let buf = self
            .recent_events
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let skip = buf.len().saturating_sub(max);
        buf.iter().skip(skip).cloned().collect()
    }

    fn try_send(&self, event: AuditEvent) {
        {
            let mut buf = self
                .recent_events
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if buf.len() >= RECENT_EVENTS_CAPACITY {
                buf.pop_front();
            }
            buf.push_back(event.clone());
        }

        let event = match self.sender.try_send(event) {
            Ok(()) => return,
            Err(mpsc::error::TrySendError::Full(event)) => event,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.record_drop();
                return;
            }
        };

        // Critical events get one more chance through a reserved slot.
        if event.is_critical() {
            if let Ok(permit) = self.sender.try_reserve() {
                permit.send(event);
                return;
            }
        }
        self.record_drop();
    }

    fn record_drop(&self) {
        let dropped = self.dropped_count.fetch_add(1, Ordering::Relaxed) + 1;
        if dropped % 100 == 1 {
            warn!(
                total_dropped = dropped,
                "Audit events being dropped due to channel overflow"
            );
        }
    }
}

async fn audit_writer_task(mut receiver: mpsc::Receiver<AuditEvent>, log_path: Option<PathBuf>) {
    let mut file = if let Some(path) = &log_path {
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
        {
            Ok(f) => Some(f),
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to open audit log");
                None
            }
        }
    } else {
        None
    };

    while let Some(event) = receiver.recv().await {
        match serde_json::to_string(&event) {
            Ok(json) => {
                debug!(event = %json, "Audit event");
                if let Some(ref mut f) = file {
                    let line = format!("{}\n", json);
                    if let Err(e) = f.write_all(line.as_bytes()).await {
                        error!(error = %e, "Failed to write audit log");
                        continue;
                    }
                    if let Err(e) = f.flush().await {
                        error!(error = %e, "Failed to flush audit log");
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to serialize audit event");
            }
        }
    }
}
