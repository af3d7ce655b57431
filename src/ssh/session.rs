use crate::session::PtyRequest;

/// Per-connection state gathered before a process is dispatched.
#[derive(Debug, Default)]
pub struct ClientSession {
    pub username: Option<String>,
    pub authenticated: bool,
    pub auth_method: String,
    /// Legacy MD5 fingerprint of the accepted public key.
    pub ssh_key_fingerprint: Option<String>,
    pub pty: Option<PtyRequest>,
    /// Set once a shell or exec request has started the session's process.
    pub dispatched: bool,
}

impl ClientSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn authenticate(&mut self, username: &str, method: &str) {
        self.username = Some(username.to_string());
        self.authenticated = true;
        self.auth_method = method.to_string();
    }
}
