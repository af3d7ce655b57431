use anyhow::Result;
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use zeroize::Zeroizing;

/// Hash a password using Argon2id with configurable parameters.
///
/// - `memory_cost`: memory in KiB (default 19456 = 19 MiB)
/// - `time_cost`: number of iterations (default 2)
/// - `parallelism`: number of lanes (default 1)
pub fn hash_password_with_params(
    password: &str,
    memory_cost: u32,
    time_cost: u32,
    parallelism: u32,
) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::new(
        argon2::Algorithm::Argon2id,
        argon2::Version::V0x13,
        argon2::Params::new(memory_cost, time_cost, parallelism, None)
            .map_err(|e| anyhow::anyhow!("invalid argon2 params: {}", e))?,
    );
    let hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("failed to hash password: {}", e))?;
    Ok(hash.to_string())
}

/// Hash a password using Argon2id with default OWASP-recommended parameters.
pub fn hash_password(password: &str) -> Result<String> {
    hash_password_with_params(password, 19456, 2, 1)
}

/// Verify a password against an Argon2 PHC string
pub fn verify_password(password: &str, hash: &str) -> bool {
    let parsed = match PasswordHash::new(hash) {
        Ok(h) => h,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to parse password hash");
            return false;
        }
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Hash schemes understood by [`verify_crypt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashScheme {
    Argon2,
    Sha512Crypt,
    Sha256Crypt,
    /// `!`, `*` or empty: the account cannot log in with a password.
    Locked,
    Unsupported,
}

impl HashScheme {
    pub fn detect(hash: &str) -> Self {
        if hash.is_empty() || hash.starts_with('!') || hash.starts_with('*') {
            HashScheme::Locked
        } else if hash.starts_with("$argon2") {
            HashScheme::Argon2
        } else if hash.starts_with("$6$") {
            HashScheme::Sha512Crypt
        } else if hash.starts_with("$5$") {
            HashScheme::Sha256Crypt
        } else {
            HashScheme::Unsupported
        }
    }
}

/// Verify a password against a crypt(3)-style hash as found in the shadow
/// database or the single-user configuration.
pub fn verify_crypt(password: &str, hash: &str) -> bool {
    match HashScheme::detect(hash) {
        HashScheme::Argon2 => verify_password(password, hash),
        HashScheme::Sha512Crypt => sha_crypt::sha512_check(password, hash).is_ok(),
        HashScheme::Sha256Crypt => sha_crypt::sha256_check(password, hash).is_ok(),
        HashScheme::Locked => false,
        HashScheme::Unsupported => {
            let scheme = hash.split('$').nth(1).unwrap_or_default();
            tracing::warn!(scheme = %scheme, "Unsupported password hash scheme");
            false
        }
    }
}

/// CLI entrypoint for hash-password subcommand
pub fn hash_password_cli(password: Option<&str>) -> Result<()> {
    let password = match password {
        Some(p) => Zeroizing::new(p.to_string()),
        None => {
            eprintln!("Enter password: ");
            let mut input = Zeroizing::new(String::new());
            std::io::stdin().read_line(&mut input)?;
            Zeroizing::new(input.trim().to_string())
        }
    };

    if password.is_empty() {
        anyhow::bail!("password must not be empty");
    }

    let hash = hash_password(&password)?;
    println!("{}", hash);
    Ok(())
}
