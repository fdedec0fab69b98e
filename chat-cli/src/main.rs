//! # parley
//!
//! CLI tool for exercising the Parley sync engine.
//!
//! ## Commands
//!
//! - `demo`: Send a message while offline, reconnect, watch it drain
//! - `outbox`: List entries persisted in a data directory
//! - `config`: Load, validate and print the effective configuration
//!
//! ## Example
//!
//! ```bash
//! # Run the offline-send scenario, persisting the outbox to ./data
//! parley --data-dir ./data demo
//!
//! # Inspect what is still queued
//! parley --data-dir ./data outbox
//!
//! # Check a config file
//! parley --config parley.toml config
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use parley_engine::EngineConfig;
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;

use commands::{config, demo, outbox};

/// CLI tool for exercising the Parley sync engine.
#[derive(Parser, Debug)]
#[command(name = "parley")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Data directory for the persisted outbox
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Engine configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Queue a message offline, reconnect and watch it sync
    Demo {
        /// Message text
        #[arg(long, default_value = "hello")]
        text: String,
    },

    /// List persisted outbox entries
    Outbox,

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Demo { text } => {
            let data_dir = prepare_data_dir(cli.data_dir).await?;
            demo::run(&data_dir, config, &text).await?;
        }
        Commands::Outbox => {
            let data_dir = prepare_data_dir(cli.data_dir).await?;
            outbox::run(&data_dir, &config).await?;
        }
        Commands::Config => {
            config::run(&config)?;
        }
    }

    Ok(())
}

/// Load and validate the configuration, or use defaults.
fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let config = match path {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn prepare_data_dir(explicit: Option<PathBuf>) -> Result<PathBuf> {
    let data_dir = match explicit {
        Some(dir) => dir,
        None => default_data_dir()?,
    };
    tokio::fs::create_dir_all(&data_dir)
        .await
        .context("Failed to create data directory")?;
    Ok(data_dir)
}

/// Get the default data directory for parley.
fn default_data_dir() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("io", "parley", "parley")
        .context("Could not determine home directory")?;
    Ok(dirs.data_dir().to_path_buf())
}
