//! Environment variable configuration support.
//!
//! Provides three modes:
//! 1. `FLEETSSHD_CONFIG` env var to specify config file path
//! 2. Full config from env vars (container / image-baked devices)
//! 3. Hybrid: file + env var overrides

use crate::config::types::*;
use std::path::PathBuf;

/// Secrets that are removed from the process environment once read.
const SENSITIVE_VARS: &[&str] = &[
    "FLEETSSHD_TOKEN",
    "FLEETSSHD_TOKEN_FILE",
    "FLEETSSHD_SINGLE_USER_PASSWORD_HASH",
    "FLEETSSHD_SINGLE_USER_PASSWORD_HASH_FILE",
];

/// Check if enough env vars are set to build a full config without a file.
/// Requires at minimum the backend URL, the namespace and a device token.
pub fn can_build_from_env() -> bool {
    std::env::var("FLEETSSHD_API_URL").is_ok()
        && std::env::var("FLEETSSHD_NAMESPACE").is_ok()
        && (std::env::var("FLEETSSHD_TOKEN").is_ok()
            || std::env::var("FLEETSSHD_TOKEN_FILE").is_ok())
}

/// Build a complete AppConfig from environment variables.
pub fn build_config_from_env() -> anyhow::Result<AppConfig> {
    let defaults = ServerConfig::default();
    let config = AppConfig {
        server: ServerConfig {
            listen: opt_env("FLEETSSHD_LISTEN").unwrap_or(defaults.listen),
            host_key_path: opt_env("FLEETSSHD_HOST_KEY_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.host_key_path),
            server_id: opt_env("FLEETSSHD_SERVER_ID").unwrap_or(defaults.server_id),
            device_name: opt_env("FLEETSSHD_DEVICE_NAME"),
            keepalive_interval_secs: parse_env(
                "FLEETSSHD_KEEPALIVE_INTERVAL",
                defaults.keepalive_interval_secs,
            ),
            keepalive_max: parse_env("FLEETSSHD_KEEPALIVE_MAX", defaults.keepalive_max),
            max_auth_attempts: parse_env("FLEETSSHD_MAX_AUTH_ATTEMPTS", defaults.max_auth_attempts),
            auth_rejection_time_ms: parse_env(
                "FLEETSSHD_AUTH_REJECTION_TIME_MS",
                defaults.auth_rejection_time_ms,
            ),
            shutdown_timeout: parse_env("FLEETSSHD_SHUTDOWN_TIMEOUT", defaults.shutdown_timeout),
        },
        backend: BackendConfig {
            api_url: require_env("FLEETSSHD_API_URL")?,
            token: resolve_env_or_file("FLEETSSHD_TOKEN")?
                .ok_or_else(|| anyhow::anyhow!("required env var FLEETSSHD_TOKEN is not set"))?,
            namespace: require_env("FLEETSSHD_NAMESPACE")?,
            request_timeout_secs: parse_env("FLEETSSHD_REQUEST_TIMEOUT", 10),
        },
        auth: AuthConfig {
            single_user_password_hash: resolve_env_or_file(
                "FLEETSSHD_SINGLE_USER_PASSWORD_HASH",
            )?,
            shadow_path: opt_env("FLEETSSHD_SHADOW_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/etc/shadow")),
        },
        session: SessionConfig {
            shell: opt_env("FLEETSSHD_SHELL"),
            login_accounting: parse_bool_env("FLEETSSHD_LOGIN_ACCOUNTING", true),
            output_drain_timeout_ms: parse_env("FLEETSSHD_OUTPUT_DRAIN_TIMEOUT_MS", 2000),
        },
        logging: LoggingConfig {
            level: opt_env("FLEETSSHD_LOG_LEVEL")
                .map(|s| parse_log_level(&s))
                .transpose()?
                .unwrap_or(LogLevel::Info),
            format: opt_env("FLEETSSHD_LOG_FORMAT")
                .map(|s| parse_log_format(&s))
                .transpose()?
                .unwrap_or(LogFormat::Pretty),
            audit_log_path: opt_env("FLEETSSHD_AUDIT_LOG_PATH").map(PathBuf::from),
        },
    };

    clear_sensitive_env_vars();
    Ok(config)
}

/// Apply env var overrides on top of a file-loaded config.
pub fn apply_env_overrides(config: &mut AppConfig) -> anyhow::Result<()> {
    if let Some(v) = opt_env("FLEETSSHD_LISTEN") {
        config.server.listen = v;
    }
    if let Some(v) = opt_env("FLEETSSHD_HOST_KEY_PATH") {
        config.server.host_key_path = PathBuf::from(v);
    }
    if std::env::var("FLEETSSHD_KEEPALIVE_INTERVAL").is_ok() {
        config.server.keepalive_interval_secs = parse_env(
            "FLEETSSHD_KEEPALIVE_INTERVAL",
            config.server.keepalive_interval_secs,
        );
    }

    if let Some(v) = opt_env("FLEETSSHD_API_URL") {
        config.backend.api_url = v;
    }
    if let Some(v) = resolve_env_or_file("FLEETSSHD_TOKEN")? {
        config.backend.token = v;
    }
    if let Some(v) = opt_env("FLEETSSHD_NAMESPACE") {
        config.backend.namespace = v;
    }

    if let Some(v) = resolve_env_or_file("FLEETSSHD_SINGLE_USER_PASSWORD_HASH")? {
        config.auth.single_user_password_hash = Some(v);
    }

    if let Some(v) = opt_env("FLEETSSHD_SHELL") {
        config.session.shell = Some(v);
    }

    if let Some(v) = opt_env("FLEETSSHD_LOG_LEVEL") {
        if let Ok(level) = parse_log_level(&v) {
            config.logging.level = level;
        }
    }
    if let Some(v) = opt_env("FLEETSSHD_LOG_FORMAT") {
        if let Ok(format) = parse_log_format(&v) {
            config.logging.format = format;
        }
    }

    clear_sensitive_env_vars();
    Ok(())
}

/// Remove secrets from the process environment so spawned sessions and
/// /proc/pid/environ readers never see them.
fn clear_sensitive_env_vars() {
    for key in SENSITIVE_VARS {
        if std::env::var_os(key).is_some() {
            std::env::remove_var(key);
        }
    }
}

fn opt_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Resolve a value from an env var, with _FILE fallback for container secrets.
/// Priority: direct env var > _FILE (read file content, trimmed) > None.
fn resolve_env_or_file(key: &str) -> anyhow::Result<Option<String>> {
    if let Some(val) = opt_env(key) {
        return Ok(Some(val));
    }
    let file_key = format!("{key}_FILE");
    if let Some(path) = opt_env(&file_key) {
        let content = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("reading {file_key}={path}: {e}"))?;
        let trimmed = content.trim().to_string();
        if trimmed.is_empty() {
            anyhow::bail!("{file_key}={path} is empty");
        }
        return Ok(Some(trimmed));
    }
    Ok(None)
}

fn require_env(key: &str) -> anyhow::Result<String> {
    opt_env(key).ok_or_else(|| anyhow::anyhow!("required env var {key} is not set"))
}

fn parse_env<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    opt_env(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn parse_bool_env(key: &str, default: bool) -> bool {
    opt_env(key)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

fn parse_log_level(s: &str) -> anyhow::Result<LogLevel> {
    match s.to_ascii_lowercase().as_str() {
        "trace" => Ok(LogLevel::Trace),
        "debug" => Ok(LogLevel::Debug),
        "info" => Ok(LogLevel::Info),
        "warn" => Ok(LogLevel::Warn),
        "error" => Ok(LogLevel::Error),
        _ => anyhow::bail!("invalid log level: '{s}'"),
    }
}

fn parse_log_format(s: &str) -> anyhow::Result<LogFormat> {
    match s.to_ascii_lowercase().as_str() {
        "pretty" => Ok(LogFormat::Pretty),
        "json" => Ok(LogFormat::Json),
        _ => anyhow::bail!("invalid log format: '{s}'"),
    }
}
