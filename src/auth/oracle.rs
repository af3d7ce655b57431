//! Client side of the fleet backend's key authorization endpoint.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Path of the authorization endpoint below the backend base URL.
pub const AUTHORIZE_PATH: &str = "/api/auth/ssh";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyAuthRequest {
    pub fingerprint: String,
    /// Canonical challenge JSON, sent as a string.
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyAuthResponse {
    /// Base64 (standard alphabet) detached signature over the challenge digest.
    pub signature: String,
}

#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("backend request failed: {0}")]
    Transport(String),

    #[error("backend answered with status {0}")]
    Status(u16),

    #[error("backend response is invalid: {0}")]
    InvalidResponse(String),
}

/// Remote authority deciding which keys may enter the namespace.
#[async_trait]
pub trait CredentialOracle: Send + Sync {
    async fn authorize_public_key(
        &self,
        request: &PublicKeyAuthRequest,
        token: &str,
    ) -> Result<PublicKeyAuthResponse, OracleError>;
}

/// [`CredentialOracle`] over HTTPS.
#[derive(Debug, Clone)]
pub struct HttpOracle {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpOracle {
    pub fn new(api_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout.min(Duration::from_secs(5)))
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}{}", api_url.trim_end_matches('/'), AUTHORIZE_PATH),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl CredentialOracle for HttpOracle {
    async fn authorize_public_key(
        &self,
        request: &PublicKeyAuthRequest,
        token: &str,
    ) -> Result<PublicKeyAuthResponse, OracleError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(token)
            .json(request)
            .send()
            .await
            .map_err(|e| OracleError::Transport(e.to_string()))?;

        let status = resp.status();
        debug!(endpoint = %self.endpoint, status = status.as_u16(), "Key authorization response");
        if !status.is_success() {
            return Err(OracleError::Status(status.as_u16()));
        }
        resp.json::<PublicKeyAuthResponse>()
            .await
            .map_err(|e| OracleError::InvalidResponse(e.to_string()))
    }
}
