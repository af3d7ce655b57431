use crate::config::types::AppConfig;

/// Redact sensitive fields in a config for safe display.
/// Replaces the backend token and the shared password hash with "***".
pub fn redact_config(cfg: &AppConfig) -> AppConfig {
    let mut redacted = cfg.clone();

    if !redacted.backend.token.is_empty() {
        redacted.backend.token = "***".to_string();
    }

    if redacted.auth.single_user_password_hash.is_some() {
        redacted.auth.single_user_password_hash = Some("***".to_string());
    }

    redacted
}
