//! nucleus-authority - certificate authority service for nucleus clusters
//!
//! # Examples
//!
//! ```bash
//! # Run the authority with the default configuration
//! nucleus-authority serve
//!
//! # Print the pin new hosts use to recognise this cluster
//! nucleus-authority pin /var/lib/nucleus/host-ca.pem
//!
//! # Validate a configuration file
//! nucleus-authority --config authority.toml check-config
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;
mod pin;
mod serve;

/// Certificate authority rotation and credential issuance
#[derive(Parser)]
#[command(name = "nucleus-authority")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "NUCLEUS_AUTHORITY_CONFIG")]
    #[arg(default_value = "authority.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bootstrap the cluster CAs and run until interrupted
    Serve(serve::ServeArgs),

    /// Print the CA pins of a PEM certificate file
    Pin(pin::PinArgs),

    /// Load, validate and print the effective configuration
    CheckConfig,
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("nucleus_authority=debug,info"))
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("nucleus_authority=info,warn"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    info!(config_path = %cli.config.display(), "Starting nucleus-authority");

    match cli.command {
        Commands::Serve(args) => serve::execute(args, &cli.config).await,
        Commands::Pin(args) => pin::execute(args),
        Commands::CheckConfig => config::show(&cli.config),
    }
}
