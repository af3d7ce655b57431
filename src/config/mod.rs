pub mod env;
pub mod redact;
pub mod types;

use anyhow::{Context, Result};
use std::path::Path;
use types::AppConfig;

/// Maximum config file size (1 MB)
const MAX_CONFIG_SIZE: u64 = 1_048_576;

/// Load and validate configuration from a TOML file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("reading config metadata: {}", path.display()))?;
    if metadata.len() > MAX_CONFIG_SIZE {
        anyhow::bail!(
            "config file too large: {} bytes (max {} bytes)",
            metadata.len(),
            MAX_CONFIG_SIZE
        );
    }

    check_config_file_permissions(path);

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading config: {}", path.display()))?;
    let mut config: AppConfig =
        toml::from_str(&content).context("parsing TOML configuration")?;
    env::apply_env_overrides(&mut config)?;
    validate_config(&config)?;
    Ok(config)
}

/// Load from `path` when it exists, otherwise build entirely from the environment.
pub fn load_config_or_env(path: &Path) -> Result<AppConfig> {
    if !path.exists() && env::can_build_from_env() {
        tracing::info!("No config file, building configuration from environment");
        let config = env::build_config_from_env()?;
        validate_config(&config)?;
        return Ok(config);
    }
    load_config(path)
}

/// Warn if the config file is readable by group or others,
/// since it holds the device token.
fn check_config_file_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    match std::fs::metadata(path) {
        Ok(meta) => {
            let mode = meta.permissions().mode();
            if mode & 0o077 != 0 {
                tracing::warn!(
                    path = %path.display(),
                    mode = format!("{:04o}", mode & 0o7777),
                    "Config file is readable by group/others. \
                     Consider restricting permissions to 0600 \
                     since it contains the device token."
                );
            }
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Could not check config file permissions"
            );
        }
    }
}

/// Parse configuration from a TOML string
pub fn parse_config(content: &str) -> Result<AppConfig> {
    let config: AppConfig = toml::from_str(content).context("parsing TOML configuration")?;
    validate_config(&config)?;
    Ok(config)
}

/// Validate an already-constructed AppConfig (e.g. built from env vars).
pub fn parse_config_validate(config: &AppConfig) -> Result<()> {
    validate_config(config)
}

fn validate_config(config: &AppConfig) -> Result<()> {
    validate_server(config)?;
    validate_backend(config)?;
    validate_auth(config)?;
    Ok(())
}

fn validate_server(config: &AppConfig) -> Result<()> {
    if config.server.listen.is_empty() {
        anyhow::bail!("server.listen must not be empty");
    }
    if !config.server.server_id.starts_with("SSH-2.0-") {
        anyhow::bail!(
            "server.server_id must start with 'SSH-2.0-' (got '{}')",
            config.server.server_id
        );
    }
    if config.server.max_auth_attempts < 1 {
        anyhow::bail!("server.max_auth_attempts must be >= 1");
    }
    Ok(())
}

fn validate_backend(config: &AppConfig) -> Result<()> {
    let url = &config.backend.api_url;
    if !(url.starts_with("https://") || url.starts_with("http://")) {
        anyhow::bail!("backend.api_url must be an http(s) URL (got '{}')", url);
    }
    if url.starts_with("http://") {
        tracing::warn!(
            api_url = %url,
            "backend.api_url is plain HTTP; the device token is sent in clear text"
        );
    }
    if config.backend.token.is_empty() {
        anyhow::bail!("backend.token must not be empty");
    }
    if config.backend.namespace.is_empty() {
        anyhow::bail!("backend.namespace must not be empty");
    }
    if config.backend.request_timeout_secs == 0 {
        anyhow::bail!("backend.request_timeout_secs must be > 0");
    }
    Ok(())
}

fn validate_auth(config: &AppConfig) -> Result<()> {
    if let Some(hash) = &config.auth.single_user_password_hash {
        if !hash.starts_with('$') {
            anyhow::bail!("auth.single_user_password_hash must be a crypt or PHC hash string");
        }
    }
    Ok(())
}
