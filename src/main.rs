//! CLI entry point for scan-daq.
//!
//! # Usage
//!
//! Serve commands from stdin against the simulated board:
//! ```bash
//! scan-daq run --config config/scan.toml
//! ```
//!
//! Each stdin line is `<topic> <json>`, e.g. `scan/start {}`. Publications are
//! written to stdout in the same form; logs go to stderr.
//!
//! Print the effective configuration:
//! ```bash
//! SCAN_DAQ_TIMING__POLL_INTERVAL_MS=250 scan-daq check-config
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use scan_daq::config::{ScanConfig, DEFAULT_CONFIG_PATH};
use scan_daq::hardware::SimulatedBoard;
use scan_daq::logging;
use scan_daq::transport::StdioTransport;
use scan_daq::ScanServer;

#[derive(Parser)]
#[command(name = "scan-daq")]
#[command(about = "Triggered waveform output and acquisition controller", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve scan commands over stdin/stdout using the simulated board
    Run {
        /// Configuration file (defaults to config/scan.toml)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Report the simulated board as unavailable
        #[arg(long)]
        simulate_unavailable: bool,
    },

    /// Validate and print the effective configuration as TOML
    CheckConfig {
        /// Configuration file (defaults to config/scan.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            simulate_unavailable,
        } => run(load_config(config)?, simulate_unavailable).await,
        Commands::CheckConfig { config } => check_config(load_config(config)?),
    }
}

fn load_config(path: Option<PathBuf>) -> Result<ScanConfig> {
    let path = path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = ScanConfig::load_from(&path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;
    config
        .validate()
        .map_err(anyhow::Error::msg)
        .context("invalid configuration")?;
    Ok(config)
}

async fn run(config: ScanConfig, simulate_unavailable: bool) -> Result<()> {
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;
    info!(name = %config.application.name, "Starting scan controller");

    let board = SimulatedBoard::from_config(&config.simulation);
    if simulate_unavailable {
        board.set_available(false);
    }

    let server = ScanServer::new(config, Arc::new(StdioTransport::new()), Box::new(board));
    server.run(shutdown_signal()).await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Cannot listen for Ctrl+C, running until stdin closes");
        std::future::pending::<()>().await;
    }
}

fn check_config(config: ScanConfig) -> Result<()> {
    let rendered = toml::to_string_pretty(&config).context("failed to render configuration")?;
    print!("{}", rendered);
    Ok(())
}
