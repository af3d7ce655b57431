use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::audit::AuditLogger;
use crate::auth::oracle::{CredentialOracle, HttpOracle};
use crate::auth::{AuthenticationContext, AuthenticationGateway, PasswordMode};
use crate::config::types::AppConfig;
use crate::os::users::{SystemUsers, UserDirectory};
use crate::os::utmp::{LoginAccounting, NoLoginAccounting, Utmp};
use crate::session::keepalive::KeepAliveMonitor;
use crate::session::orchestrator::SessionOrchestrator;
use crate::session::registry::ProcessRegistry;
use crate::session::HandlerContext;
use crate::ssh::supervisor::ConnectionTable;

/// Shared application context, handed to every connection
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub auth: Arc<AuthenticationGateway>,
    pub orchestrator: Arc<SessionOrchestrator>,
    pub registry: Arc<ProcessRegistry>,
    pub connections: Arc<ConnectionTable>,
    pub audit: Arc<AuditLogger>,
}

impl AppContext {
    /// Wire the broker from explicit collaborators.
    pub fn new(
        config: AppConfig,
        users: Arc<dyn UserDirectory>,
        oracle: Arc<dyn CredentialOracle>,
        accounting: Arc<dyn LoginAccounting>,
        audit: Arc<AuditLogger>,
    ) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(ProcessRegistry::new());

        let password_mode = match &config.auth.single_user_password_hash {
            Some(hash) => PasswordMode::SingleUser { hash: hash.clone() },
            None => PasswordMode::LocalUsers,
        };
        let auth = AuthenticationGateway::new(
            AuthenticationContext::new(&config.backend.token, &config.backend.namespace),
            password_mode,
            Arc::clone(&users),
            oracle,
        );

        let handlers = HandlerContext::new(users, Arc::clone(&registry), accounting, config.device_name())
            .with_shell_override(config.session.shell.clone())
            .with_output_drain_timeout(Duration::from_millis(config.session.output_drain_timeout_ms));
        let keepalive = KeepAliveMonitor::new(Duration::from_secs(config.server.keepalive_interval_secs));
        let orchestrator = SessionOrchestrator::new(Arc::new(handlers), keepalive, Arc::clone(&audit));

        Self {
            config,
            auth: Arc::new(auth),
            orchestrator: Arc::new(orchestrator),
            registry,
            connections: Arc::new(ConnectionTable::new()),
            audit,
        }
    }

    /// Production wiring: system accounts, the HTTP backend and utmp.
    /// Must be called inside a tokio runtime (the audit writer is spawned).
    pub fn from_config(mut config: AppConfig) -> Result<Self> {
        if config.session.shell.is_none() {
            config.session.shell = std::env::var("SHELL").ok().filter(|s| !s.is_empty());
        }

        let users: Arc<dyn UserDirectory> = Arc::new(SystemUsers::new(config.auth.shadow_path.clone()));
        let oracle: Arc<dyn CredentialOracle> = Arc::new(HttpOracle::new(
            &config.backend.api_url,
            Duration::from_secs(config.backend.request_timeout_secs),
        )?);
        let accounting: Arc<dyn LoginAccounting> = if config.session.login_accounting {
            Arc::new(Utmp)
        } else {
            Arc::new(NoLoginAccounting)
        };
        let audit = Arc::new(AuditLogger::new(config.logging.audit_log_path.clone()));

        Ok(Self::new(config, users, oracle, accounting, audit))
    }
}
