use std::collections::HashMap;
use std::path::PathBuf;

use nix::unistd::User;
use tracing::{debug, warn};

use crate::auth::password;

/// A local account a session can run as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalUser {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
    pub shell: String,
}

impl LocalUser {
    pub fn new(
        name: impl Into<String>,
        uid: u32,
        gid: u32,
        home: impl Into<PathBuf>,
        shell: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            uid,
            gid,
            home: home.into(),
            shell: shell.into(),
        }
    }
}

/// Local account database.
pub trait UserDirectory: Send + Sync {
    fn lookup(&self, username: &str) -> Option<LocalUser>;

    /// Check a password against the account's stored hash. Never errors: any
    /// failure is a denial.
    fn verify_password(&self, username: &str, password: &str) -> bool;
}

/// The operating system's passwd and shadow databases.
#[derive(Debug, Clone)]
pub struct SystemUsers {
    shadow_path: PathBuf,
}

impl SystemUsers {
    pub fn new(shadow_path: impl Into<PathBuf>) -> Self {
        Self {
            shadow_path: shadow_path.into(),
        }
    }
}

impl UserDirectory for SystemUsers {
    fn lookup(&self, username: &str) -> Option<LocalUser> {
        match User::from_name(username) {
            Ok(Some(u)) => Some(LocalUser {
                name: u.name,
                uid: u.uid.as_raw(),
                gid: u.gid.as_raw(),
                home: u.dir,
                shell: u.shell.to_string_lossy().into_owned(),
            }),
            Ok(None) => None,
            Err(e) => {
                warn!(user = %username, error = %e, "User lookup failed");
                None
            }
        }
    }

    fn verify_password(&self, username: &str, password: &str) -> bool {
        let content = match std::fs::read_to_string(&self.shadow_path) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    path = %self.shadow_path.display(),
                    error = %e,
                    "Cannot read shadow database"
                );
                return false;
            }
        };
        match shadow_hash(&content, username) {
            Some(hash) => password::verify_crypt(password, hash),
            None => {
                debug!(user = %username, "No shadow entry");
                false
            }
        }
    }
}

/// Password field of `username` in shadow(5) formatted text.
pub fn shadow_hash<'a>(content: &'a str, username: &str) -> Option<&'a str> {
    content.lines().find_map(|line| {
        let mut fields = line.splitn(3, ':');
        let name = fields.next()?;
        if name != username {
            return None;
        }
        fields.next()
    })
}

/// In-memory directory, for fixed single-purpose devices and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticUsers {
    users: HashMap<String, (LocalUser, Option<String>)>,
}

impl StaticUsers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an account with an optional password hash (Argon2 PHC or SHA-crypt).
    pub fn with_user(mut self, user: LocalUser, password_hash: Option<&str>) -> Self {
        self.users.insert(
            user.name.clone(),
            (user, password_hash.map(|h| h.to_string())),
        );
        self
    }
}

impl UserDirectory for StaticUsers {
    fn lookup(&self, username: &str) -> Option<LocalUser> {
        self.users.get(username).map(|(user, _)| user.clone())
    }

    fn verify_password(&self, username: &str, password: &str) -> bool {
        match self.users.get(username) {
            Some((_, Some(hash))) => password::verify_crypt(password, hash),
            _ => false,
        }
    }
}
