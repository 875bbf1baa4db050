use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::prelude::*;

mod api;
mod commands;
mod config;

use crate::config::MonitorConfig;

#[derive(Parser)]
#[command(name = "fleet")]
#[command(about = "Follow the ATM fleet's real-time feeds from the terminal")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config.toml (defaults to the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Backend base URL, e.g. http://localhost:8000
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Fleet-wide counters and alerts
    Dashboard,

    /// ATM list with recent status changes
    Atms,

    /// Live telemetry for one ATM
    Atm(AtmArgs),
}

#[derive(Parser)]
struct AtmArgs {
    /// ATM identifier
    id: String,

    /// Ask the server to resend telemetry history once connected
    #[arg(long)]
    request_history: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "fleet=debug,fleet_sync=debug,info"
    } else {
        "info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let config = MonitorConfig::new(cli.config, cli.base_url)?;

    match cli.command {
        Commands::Dashboard => commands::dashboard_command(&config).await,
        Commands::Atms => commands::atms_command(&config).await,
        Commands::Atm(args) => {
            commands::atm_command(&config, &args.id, args.request_history).await
        }
    }
}
