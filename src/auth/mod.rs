pub mod challenge;
pub mod oracle;
pub mod password;
pub mod pubkey;

use std::fmt;
use std::sync::Arc;

use base64::Engine;
use russh::keys::PublicKey;
use tracing::{debug, warn};

use crate::os::users::UserDirectory;
use challenge::AuthChallenge;
use oracle::{CredentialOracle, OracleError, PublicKeyAuthRequest};

/// Dummy hash for timing-safe user enumeration prevention
const DUMMY_HASH: &str = "$argon2id$v=19$m=19456,t=2,p=1$AAAAAAAAAAAAAAAAAAAAAA$AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";

/// Credentials identifying this device to the backend.
#[derive(Clone)]
pub struct AuthenticationContext {
    pub token: String,
    pub namespace: String,
}

impl AuthenticationContext {
    pub fn new(token: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            namespace: namespace.into(),
        }
    }
}

impl fmt::Debug for AuthenticationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticationContext")
            .field("token", &"***")
            .field("namespace", &self.namespace)
            .finish()
    }
}

/// Which credential database the password method checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PasswordMode {
    /// One shared password hash, whatever the claimed username.
    SingleUser { hash: String },
    /// The local account's own password.
    LocalUsers,
}

/// Why a public key was refused.
#[derive(Debug, thiserror::Error)]
pub enum PublicKeyDenial {
    #[error("user '{0}' has no local account")]
    UnknownUser(String),

    #[error("challenge encoding failed: {0}")]
    Challenge(#[from] serde_json::Error),

    #[error("key authorization failed: {0}")]
    Oracle(#[from] OracleError),

    #[error("public key cannot be encoded: {0}")]
    KeyEncoding(#[from] russh::keys::ssh_key::Error),

    #[error("signature is not valid base64")]
    SignatureEncoding,

    #[error("key type {0} cannot verify backend signatures")]
    UnsupportedKey(String),

    #[error("backend signature does not match the presented key")]
    Verification,
}

/// Grants or denies SSH authentication attempts.
pub struct AuthenticationGateway {
    context: AuthenticationContext,
    password_mode: PasswordMode,
    users: Arc<dyn UserDirectory>,
    oracle: Arc<dyn CredentialOracle>,
}

impl AuthenticationGateway {
    pub fn new(
        context: AuthenticationContext,
        password_mode: PasswordMode,
        users: Arc<dyn UserDirectory>,
        oracle: Arc<dyn CredentialOracle>,
    ) -> Self {
        Self {
            context,
            password_mode,
            users,
            oracle,
        }
    }

    /// Authenticate with password
    pub fn auth_password(&self, username: &str, password: &str) -> bool {
        match &self.password_mode {
            PasswordMode::SingleUser { hash } => password::verify_crypt(password, hash),
            PasswordMode::LocalUsers => {
                if self.users.lookup(username).is_none() {
                    debug!(username = %username, "User not found, performing dummy verification");
                    let _ = password::verify_password(password, DUMMY_HASH);
                    return false;
                }
                self.users.verify_password(username, password)
            }
        }
    }

    /// Authenticate with a public key whose possession the transport already proved.
    pub async fn auth_publickey(&self, username: &str, key: &PublicKey) -> bool {
        match self.authorize_public_key(username, key).await {
            Ok(()) => true,
            Err(e) => {
                warn!(user = %username, reason = %e, "Public key denied");
                false
            }
        }
    }

    /// Ask the backend to sign the challenge for this key, then check the
    /// signature against the key itself.
    pub async fn authorize_public_key(
        &self,
        username: &str,
        key: &PublicKey,
    ) -> Result<(), PublicKeyDenial> {
        if self.users.lookup(username).is_none() {
            return Err(PublicKeyDenial::UnknownUser(username.to_string()));
        }

        let challenge = AuthChallenge::new(username, &self.context.namespace);
        let digest = challenge.digest()?;
        let request = PublicKeyAuthRequest {
            fingerprint: pubkey::md5_fingerprint(key)?,
            data: challenge.to_canonical_json()?,
        };

        let response = self
            .oracle
            .authorize_public_key(&request, &self.context.token)
            .await?;

        let signature = base64::engine::general_purpose::STANDARD
            .decode(response.signature.trim())
            .map_err(|_| PublicKeyDenial::SignatureEncoding)?;

        let rsa = pubkey::rsa_public_key(key)
            .ok_or_else(|| PublicKeyDenial::UnsupportedKey(key.algorithm().to_string()))?;

        if !pubkey::verify_sha256_signature(&rsa, &digest, &signature) {
            return Err(PublicKeyDenial::Verification);
        }
        debug!(user = %username, fingerprint = %request.fingerprint, "Backend authorized key");
        Ok(())
    }
}
