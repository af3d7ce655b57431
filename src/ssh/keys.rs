use anyhow::{Context, Result};
use russh::keys::{Algorithm, PrivateKey};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;
use tracing::{info, warn};

/// Load the device host key, generating an Ed25519 key on first start.
pub fn load_or_generate_host_key(path: &Path) -> Result<PrivateKey> {
    if path.exists() {
        check_key_permissions(path);
        let pem = std::fs::read_to_string(path)
            .with_context(|| format!("reading host key: {}", path.display()))?;
        return russh::keys::decode_secret_key(&pem, None)
            .map_err(|e| anyhow::anyhow!("decoding host key {}: {}", path.display(), e));
    }

    let key = PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519)
        .map_err(|e| anyhow::anyhow!("Ed25519 key generation failed: {}", e))?;
    write_host_key(&key, path)?;
    info!(path = %path.display(), "Generated new host key");
    Ok(key)
}

fn write_host_key(key: &PrivateKey, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating directory: {}", parent.display()))?;
    }

    let mut pem = Vec::new();
    russh::keys::encode_pkcs8_pem(key, &mut pem)
        .map_err(|e| anyhow::anyhow!("encoding host key: {}", e))?;

    // Created 0600 so the key is never readable by others, even briefly.
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("creating host key file: {}", path.display()))?;
    file.write_all(&pem)
        .with_context(|| format!("writing host key: {}", path.display()))?;
    Ok(())
}

fn check_key_permissions(path: &Path) {
    if let Ok(meta) = std::fs::metadata(path) {
        let mode = meta.permissions().mode();
        if mode & 0o077 != 0 {
            warn!(
                path = %path.display(),
                mode = format!("{:04o}", mode & 0o7777),
                "Host key is accessible by group/others"
            );
        }
    }
}
