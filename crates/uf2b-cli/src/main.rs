//! uf2b - Command-line tool for the UF2 batch flasher
//!
//! Flashes one UF2 image onto a bank of USB targets through a batch flasher
//! controller, and inspects the controller's port status and console.

mod commands;
mod config;
mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uf2b_client::{DeviceRange, FlashConfig, FlashSequencer, HttpController};

use crate::config::{Config, MergedConfig, DEFAULT_SERVER};
use crate::output::{OutputContext, OutputFormat};

#[derive(Parser)]
#[command(name = "uf2b")]
#[command(author, version, about = "UF2 Batch Flasher CLI")]
#[command(propagate_version = true)]
struct Cli {
    /// Controller URL
    #[arg(short, long, env = "UF2B_SERVER")]
    server: Option<String>,

    /// Configuration file path
    #[arg(short, long, env = "UF2B_CONFIG")]
    config: Option<PathBuf>,

    /// Board configuration (YAML: endpoints, ports, timeouts)
    #[arg(short, long, env = "UF2B_BOARD")]
    board: Option<PathBuf>,

    /// Number of USB ports on the controller
    #[arg(long)]
    capacity: Option<usize>,

    /// Output format
    #[arg(short, long, value_enum)]
    output: Option<OutputFormat>,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Minimal output (for scripting)
    #[arg(short, long)]
    quiet: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Flash a UF2 image to a range of USB ports
    Flash {
        /// Firmware file path
        file: PathBuf,

        /// Flash only this port
        #[arg(long, conflicts_with_all = ["start_with", "end_with"])]
        single: Option<usize>,

        /// First port to flash
        #[arg(long)]
        start_with: Option<usize>,

        /// Last port to flash (inclusive)
        #[arg(long)]
        end_with: Option<usize>,

        /// Soft-reboot the controller once done
        #[arg(long)]
        reboot: bool,
    },

    /// Show the status of every USB port
    Status,

    /// Print the board console output
    Console {
        /// Keep printing until Ctrl+C
        #[arg(short, long)]
        follow: bool,
    },

    /// Reboot the controller
    Reboot {
        /// Reboot into the BOOTSEL bootloader
        #[arg(long)]
        bootsel: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    // Load config file
    let config = if let Some(config_path) = &cli.config {
        Config::load_from(config_path)?
    } else {
        Config::load().unwrap_or_default()
    };

    // Merge CLI args with config
    let merged = config.merge_with_args(
        cli.server.as_deref(),
        cli.board.as_deref(),
        cli.capacity,
        cli.no_color,
    );
    let format = cli
        .output
        .or_else(|| {
            config
                .output
                .as_deref()
                .and_then(|s| OutputFormat::from_str(s, true).ok())
        })
        .unwrap_or_default();

    // Create output context
    let ctx = OutputContext::new(format, merged.no_color, cli.quiet);

    let flash_config = flash_config(&merged)?;
    let controller = Arc::new(
        HttpController::new(flash_config.clone())
            .context("Failed to create controller client")?,
    );

    // Execute command
    match &cli.command {
        Commands::Flash {
            file,
            single,
            start_with,
            end_with,
            reboot,
        } => {
            let range = DeviceRange::resolve(
                *single,
                start_with.or(flash_config.devices.first),
                end_with.or(flash_config.devices.last),
                flash_config.devices.capacity,
            )?;
            let sequencer = FlashSequencer::new(controller.clone(), &flash_config)?;

            let failed =
                commands::flash(&sequencer, controller.as_ref(), file, range, *reboot, &ctx).await?;
            if failed > 0 {
                std::process::exit(1);
            }
        }

        Commands::Status => {
            commands::status(controller.as_ref(), &ctx).await?;
        }

        Commands::Console { follow } => {
            commands::console(controller.as_ref(), *follow, &ctx).await?;
        }

        Commands::Reboot { bootsel } => {
            commands::reboot(controller.as_ref(), *bootsel, &ctx).await?;
        }
    }

    Ok(())
}

/// Build the controller configuration from the board file and merged args
fn flash_config(merged: &MergedConfig) -> Result<FlashConfig> {
    let mut config = match &merged.board {
        Some(path) => FlashConfig::from_yaml_file(path)
            .with_context(|| format!("Failed to load board config: {}", path.display()))?,
        None => FlashConfig::builder(DEFAULT_SERVER).build(),
    };

    if let Some(server) = &merged.server {
        config.connection.base_url = server.clone();
    }
    if let Some(capacity) = merged.capacity {
        config.devices.capacity = capacity;
    }
    config.validate()?;
    Ok(config)
}
