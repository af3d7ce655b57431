use serde::Serialize;
use sha2::{Digest, Sha256};

/// The record the backend signs when it authorizes a key for a namespace.
///
/// Serialized as `{"Username":..,"Namespace":..}` with no whitespace; field
/// order is part of the wire contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuthChallenge {
    pub username: String,
    pub namespace: String,
}

impl AuthChallenge {
    pub fn new(username: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            namespace: namespace.into(),
        }
    }

    pub fn to_canonical_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// SHA-256 of the canonical JSON.
    pub fn digest(&self) -> Result<[u8; 32], serde_json::Error> {
        let json = self.to_canonical_json()?;
        Ok(Sha256::digest(json.as_bytes()).into())
    }
}
