use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Log level enum (replaces stringly-typed field)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

/// Log format enum (replaces stringly-typed field)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub backend: BackendConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Name exported to spawned processes as `FLEETSSHD_DEVICE`.
    pub fn device_name(&self) -> &str {
        self.server
            .device_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.backend.namespace)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_host_key_path")]
    pub host_key_path: PathBuf,
    #[serde(default = "default_server_id")]
    pub server_id: String,
    /// Device name; defaults to the backend namespace.
    #[serde(default)]
    pub device_name: Option<String>,
    /// Seconds between keepalive requests (0 disables).
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
    /// Unanswered transport keepalives before the connection is dropped.
    #[serde(default = "default_keepalive_max")]
    pub keepalive_max: u32,
    #[serde(default = "default_max_auth_attempts")]
    pub max_auth_attempts: u32,
    #[serde(default = "default_auth_rejection_time_ms")]
    pub auth_rejection_time_ms: u64,
    /// Seconds to wait for connections to drain on shutdown.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            host_key_path: default_host_key_path(),
            server_id: default_server_id(),
            device_name: None,
            keepalive_interval_secs: default_keepalive_interval_secs(),
            keepalive_max: default_keepalive_max(),
            max_auth_attempts: default_max_auth_attempts(),
            auth_rejection_time_ms: default_auth_rejection_time_ms(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:2222".to_string()
}

fn default_host_key_path() -> PathBuf {
    PathBuf::from("host_key")
}

fn default_server_id() -> String {
    format!("SSH-2.0-fleetsshd_{}", env!("CARGO_PKG_VERSION"))
}

fn default_keepalive_interval_secs() -> u64 {
    30
}

fn default_keepalive_max() -> u32 {
    3
}

fn default_max_auth_attempts() -> u32 {
    6
}

fn default_auth_rejection_time_ms() -> u64 {
    1000
}

fn default_shutdown_timeout() -> u64 {
    30
}

/// Fleet-management backend the device is enrolled with.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    pub api_url: String,
    /// Device token sent as bearer credential.
    pub token: String,
    pub namespace: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    /// When set, every password login is checked against this hash alone.
    #[serde(default)]
    pub single_user_password_hash: Option<String>,
    #[serde(default = "default_shadow_path")]
    pub shadow_path: PathBuf,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            single_user_password_hash: None,
            shadow_path: default_shadow_path(),
        }
    }
}

fn default_shadow_path() -> PathBuf {
    PathBuf::from("/etc/shadow")
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Login shell used instead of the account's registered shell.
    #[serde(default)]
    pub shell: Option<String>,
    /// Write utmp records for terminal sessions.
    #[serde(default = "default_true")]
    pub login_accounting: bool,
    /// How long to keep relaying output after the process exits.
    #[serde(default = "default_output_drain_timeout_ms")]
    pub output_drain_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            shell: None,
            login_accounting: default_true(),
            output_drain_timeout_ms: default_output_drain_timeout_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_output_drain_timeout_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    pub audit_log_path: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            audit_log_path: None,
        }
    }
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}
