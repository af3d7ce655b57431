use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event_type")]
pub enum AuditEvent {
    #[serde(rename = "auth.success")]
    AuthSuccess {
        timestamp: DateTime<Utc>,
        session_id: String,
        username: String,
        source_ip: String,
        method: String,
    },
    #[serde(rename = "auth.failure")]
    AuthFailure {
        timestamp: DateTime<Utc>,
        session_id: String,
        username: String,
        source_ip: String,
        method: String,
        attempt: u32,
    },
    #[serde(rename = "connection.new")]
    ConnectionNew {
        timestamp: DateTime<Utc>,
        session_id: String,
        source_ip: String,
    },
    #[serde(rename = "connection.closed")]
    ConnectionClosed {
        timestamp: DateTime<Utc>,
        session_id: String,
        source_ip: String,
        duration_ms: u64,
    },
    #[serde(rename = "session.started")]
    SessionStarted {
        timestamp: DateTime<Utc>,
        session_id: String,
        username: String,
        source_ip: String,
        mode: String,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        command: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        term: Option<String>,
    },
    #[serde(rename = "session.ended")]
    SessionEnded {
        timestamp: DateTime<Utc>,
        session_id: String,
        username: String,
        source_ip: String,
        mode: String,
        exit_code: u32,
        duration_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename = "process.killed")]
    ProcessKilled {
        timestamp: DateTime<Utc>,
        session_id: String,
        source_ip: String,
        reason: String,
    },
}

impl AuditEvent {
    pub fn auth_success(username: &str, source: &SocketAddr, method: &str, sid: &str) -> Self {
        Self::AuthSuccess {
            timestamp: Utc::now(),
            session_id: sid.to_string(),
            username: username.to_string(),
            source_ip: source.ip().to_string(),
            method: method.to_string(),
        }
    }

    pub fn auth_failure(
        username: &str,
        source: &SocketAddr,
        method: &str,
        attempt: u32,
        sid: &str,
    ) -> Self {
        Self::AuthFailure {
            timestamp: Utc::now(),
            session_id: sid.to_string(),
            username: username.to_string(),
            source_ip: source.ip().to_string(),
            method: method.to_string(),
            attempt,
        }
    }

    pub fn connection_new(source: &SocketAddr, sid: &str) -> Self {
        Self::ConnectionNew {
            timestamp: Utc::now(),
            session_id: sid.to_string(),
            source_ip: source.ip().to_string(),
        }
    }

    pub fn connection_closed(source: &SocketAddr, duration_ms: u64, sid: &str) -> Self {
        Self::ConnectionClosed {
            timestamp: Utc::now(),
            session_id: sid.to_string(),
            source_ip: source.ip().to_string(),
            duration_ms,
        }
    }

    pub fn session_started(
        username: &str,
        source: &SocketAddr,
        mode: &str,
        command: &[String],
        term: Option<&str>,
        sid: &str,
    ) -> Self {
        Self::SessionStarted {
            timestamp: Utc::now(),
            session_id: sid.to_string(),
            username: username.to_string(),
            source_ip: source.ip().to_string(),
            mode: mode.to_string(),
            command: command.to_vec(),
            term: term.map(str::to_string),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn session_ended(
        username: &str,
        source: &SocketAddr,
        mode: &str,
        exit_code: u32,
        duration_ms: u64,
        error: Option<String>,
        sid: &str,
    ) -> Self {
        Self::SessionEnded {
            timestamp: Utc::now(),
            session_id: sid.to_string(),
            username: username.to_string(),
            source_ip: source.ip().to_string(),
            mode: mode.to_string(),
            exit_code,
            duration_ms,
            error,
        }
    }

    pub fn process_killed(source: &SocketAddr, reason: &str, sid: &str) -> Self {
        Self::ProcessKilled {
            timestamp: Utc::now(),
            session_id: sid.to_string(),
            source_ip: source.ip().to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::AuthSuccess { .. } => "auth.success",
            Self::AuthFailure { .. } => "auth.failure",
            Self::ConnectionNew { .. } => "connection.new",
            Self::ConnectionClosed { .. } => "connection.closed",
            Self::SessionStarted { .. } => "session.started",
            Self::SessionEnded { .. } => "session.ended",
            Self::ProcessKilled { .. } => "process.killed",
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            Self::AuthSuccess { session_id, .. }
            | Self::AuthFailure { session_id, .. }
            | Self::ConnectionNew { session_id, .. }
            | Self::ConnectionClosed { session_id, .. }
            | Self::SessionStarted { session_id, .. }
            | Self::SessionEnded { session_id, .. }
            | Self::ProcessKilled { session_id, .. } => session_id,
        }
    }

    /// Critical events use priority delivery: auth outcomes and forced kills.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Self::AuthSuccess { .. } | Self::AuthFailure { .. } | Self::ProcessKilled { .. }
        )
    }
}
