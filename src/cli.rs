use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "fleetsshd",
    version,
    about = "Device-side SSH access broker for fleet-managed hosts"
)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "fleetsshd.toml", env = "FLEETSSHD_CONFIG")]
    pub config: PathBuf,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ConfigFormat {
    Toml,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Hash a password with Argon2id for `auth.single_user_password_hash`
    HashPassword {
        /// Password to hash (read from stdin if omitted)
        #[arg(short, long)]
        password: Option<String>,
    },
    /// Validate the configuration and exit
    CheckConfig,
    /// Print the effective configuration with secrets redacted
    ShowConfig {
        #[arg(long, value_enum, default_value = "toml")]
        format: ConfigFormat,
    },
    /// Check that a broker accepts TCP connections
    HealthCheck {
        /// Address to check (host:port)
        #[arg(long, default_value = "127.0.0.1:2222")]
        addr: String,
        /// Timeout in seconds
        #[arg(long, default_value = "5")]
        timeout: u64,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate a man page (roff)
    Manpage,
}
