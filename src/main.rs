use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use bskit::config::BskitToml;

mod cmd;

#[derive(Parser)]
#[command(name = "bskit")]
#[command(version, about = "Run container builds and stream their logs")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to bskit.toml (default: <config dir>/bskit/bskit.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build a directory and stream the build output
    Build {
        /// Directory containing the application source
        directory: PathBuf,
        /// Target platform: arm64 or amd64 (default: this machine's)
        #[arg(short, long)]
        platform: Option<String>,
        /// Fail the build after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Serve the build API and log WebSocket
    Serve {
        /// Port to listen on (default: [server].port, 3141)
        #[arg(long)]
        port: Option<u16>,
        /// Address to bind (default: [server].host, 127.0.0.1)
        #[arg(long)]
        host: Option<String>,
        /// Development mode: permissive CORS for a separately served UI
        #[arg(long)]
        dev: bool,
    },
    /// View, validate or create configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate the configuration file
    Validate,
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(BskitToml::default_path);

    match &cli.command {
        Commands::Build {
            directory,
            platform,
            timeout,
        } => {
            let config = BskitToml::load_or_default(&config_path)?;
            let _log_guard = bskit::logging::init(&config.logging, cli.verbose, "warn")?;
            let succeeded =
                cmd::cmd_build(&config, directory, platform.as_deref(), *timeout).await?;
            if !succeeded {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Serve { port, host, dev } => {
            let config = BskitToml::load_or_default(&config_path)?;
            let _log_guard = bskit::logging::init(&config.logging, cli.verbose, "info")?;
            cmd::cmd_serve(&config, *port, host.clone(), *dev).await?;
        }
        Commands::Config { command } => cmd::cmd_config(&config_path, command.clone())?,
    }

    Ok(ExitCode::SUCCESS)
}
