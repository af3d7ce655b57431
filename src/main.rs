use anyhow::Result;
use clap::{CommandFactory, Parser};
use tracing::{error, info};

use fleetsshd::cli::{Cli, Command, ConfigFormat};
use fleetsshd::config;

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Command::HashPassword { password }) => {
            return fleetsshd::auth::password::hash_password_cli(password.as_deref());
        }
        Some(Command::CheckConfig) => {
            let cfg = config::load_config_or_env(&cli.config)?;
            println!("Configuration is valid.");
            println!("  Listen: {}", cfg.server.listen);
            println!("  Device: {}", cfg.device_name());
            println!("  Backend: {}", cfg.backend.api_url);
            let mode = if cfg.auth.single_user_password_hash.is_some() {
                "single shared password"
            } else {
                "local accounts"
            };
            println!("  Password auth: {}", mode);
            return Ok(());
        }
        Some(Command::ShowConfig { format }) => {
            let cfg = config::load_config_or_env(&cli.config)?;
            let redacted = config::redact::redact_config(&cfg);
            match format {
                ConfigFormat::Json => println!("{}", serde_json::to_string_pretty(&redacted)?),
                ConfigFormat::Toml => println!("{}", toml::to_string_pretty(&redacted)?),
            }
            return Ok(());
        }
        Some(Command::HealthCheck { addr, timeout }) => {
            use std::net::{SocketAddr, TcpStream};
            use std::time::Duration;

            let target: SocketAddr = addr
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid address '{}': {}", addr, e))?;
            match TcpStream::connect_timeout(&target, Duration::from_secs(*timeout)) {
                Ok(_) => {
                    println!("OK: {} is reachable", addr);
                    return Ok(());
                }
                Err(e) => {
                    eprintln!("FAIL: {} is not reachable: {}", addr, e);
                    std::process::exit(1);
                }
            }
        }
        Some(Command::Completions { shell }) => {
            let mut cmd = Cli::command();
            clap_complete::generate(*shell, &mut cmd, "fleetsshd", &mut std::io::stdout());
            return Ok(());
        }
        Some(Command::Manpage) => {
            let man = clap_mangen::Man::new(Cli::command());
            man.render(&mut std::io::stdout())?;
            return Ok(());
        }
        None => {}
    }

    let app_config = config::load_config_or_env(&cli.config)?;

    let log_level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| app_config.logging.level.to_string());
    fleetsshd::logging::setup_logging(&log_level, app_config.logging.format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %app_config.server.listen,
        device = %app_config.device_name(),
        "Starting fleetsshd"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        if let Err(e) = fleetsshd::server::run(app_config).await {
            error!(error = %e, "Server error");
            std::process::exit(1);
        }
    });

    Ok(())
}
