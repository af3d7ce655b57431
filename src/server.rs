use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::keys::PrivateKey;
use russh::{MethodKind, MethodSet};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::types::AppConfig;
use crate::context::AppContext;
use crate::session::SessionId;
use crate::ssh::handler::SshHandler;
use crate::ssh::keys;
use crate::ssh::supervisor::ConnectionSupervisor;

/// Run the broker until SIGTERM or SIGINT, then drain connections.
pub async fn run(config: AppConfig) -> Result<()> {
    let ctx = Arc::new(AppContext::from_config(config)?);

    let host_key = keys::load_or_generate_host_key(&ctx.config.server.host_key_path)?;
    info!(path = %ctx.config.server.host_key_path.display(), "Host key loaded");
    let ssh_config = Arc::new(build_ssh_config(&ctx.config, host_key));

    let listener = TcpListener::bind(&ctx.config.server.listen)
        .await
        .with_context(|| format!("binding {}", ctx.config.server.listen))?;
    info!(
        addr = %ctx.config.server.listen,
        device = %ctx.config.device_name(),
        "SSH server listening"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(handle_signals(shutdown.clone()));

    serve(listener, ssh_config, Arc::clone(&ctx), shutdown).await?;
    drain(&ctx).await;
    info!("Graceful shutdown complete");
    Ok(())
}

/// russh server configuration for the broker.
pub fn build_ssh_config(config: &AppConfig, host_key: PrivateKey) -> russh::server::Config {
    let mut ssh_config = russh::server::Config::default();
    ssh_config.keys.push(host_key);
    ssh_config.server_id = russh::SshId::Standard(config.server.server_id.clone());
    ssh_config.methods = MethodSet::from([MethodKind::Password, MethodKind::PublicKey].as_slice());
    ssh_config.max_auth_attempts = config.server.max_auth_attempts as usize;
    ssh_config.auth_rejection_time = Duration::from_millis(config.server.auth_rejection_time_ms);
    ssh_config.auth_rejection_time_initial = Some(Duration::from_secs(0));

    // Transport-level keepalive@openssh.com requests; the per-session monitor
    // runs on the same interval.
    if config.server.keepalive_interval_secs > 0 {
        ssh_config.keepalive_interval =
            Some(Duration::from_secs(config.server.keepalive_interval_secs));
        ssh_config.keepalive_max = config.server.keepalive_max as usize;
    }
    ssh_config
}

/// Accept connections until `shutdown` is cancelled, then close every live
/// connection. Does not wait for them to finish.
pub async fn serve(
    listener: TcpListener,
    ssh_config: Arc<russh::server::Config>,
    ctx: Arc<AppContext>,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    spawn_connection(stream, peer, Arc::clone(&ssh_config), Arc::clone(&ctx));
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }

    info!(
        active_connections = ctx.connections.len(),
        "Stopped accepting connections"
    );
    ctx.connections.close_all();
    Ok(())
}

fn spawn_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ssh_config: Arc<russh::server::Config>,
    ctx: Arc<AppContext>,
) {
    let session_id = SessionId::generate();
    let local = stream
        .local_addr()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
    let _ = stream.set_nodelay(true);

    let handler = SshHandler::new(Arc::clone(&ctx), session_id.clone(), peer, local);
    let supervisor = ConnectionSupervisor::new(
        session_id.clone(),
        peer,
        Arc::clone(&ctx.registry),
        Arc::clone(&ctx.connections),
        Arc::clone(&ctx.audit),
    );
    info!(peer = %peer, session_id = %session_id, "New SSH connection");

    let span = info_span!("connection", session_id = %session_id, peer = %peer);
    tokio::spawn(
        async move {
            let result = supervisor
                .run(async move {
                    let running = russh::server::run_stream(ssh_config, stream, handler).await?;
                    running.await
                })
                .await;
            match result {
                Ok(()) => debug!("SSH connection finished"),
                Err(e) => debug!(error = %e, "SSH connection ended with error"),
            }
        }
        .instrument(span),
    );
}

/// Wait up to `server.shutdown_timeout` for closed connections to finish.
async fn drain(ctx: &AppContext) {
    let deadline = tokio::time::Instant::now()
        + Duration::from_secs(ctx.config.server.shutdown_timeout);
    loop {
        let active = ctx.connections.len();
        if active == 0 {
            info!("All connections drained");
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(
                active_connections = active,
                processes = ctx.registry.len(),
                "Shutdown timeout reached, forcing exit"
            );
            break;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

#[cfg(unix)]
async fn handle_signals(shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to install SIGTERM handler");
            return;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to install SIGINT handler");
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("SIGTERM received, initiating graceful shutdown"),
        _ = sigint.recv() => info!("SIGINT received, initiating graceful shutdown"),
    }
    shutdown.cancel();
}
