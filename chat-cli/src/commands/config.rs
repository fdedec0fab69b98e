//! Print the effective configuration.

use anyhow::{Context, Result};
use parley_engine::EngineConfig;

/// Render the configuration as TOML.
pub fn render(config: &EngineConfig) -> Result<String> {
    toml::to_string_pretty(config).context("Failed to encode configuration")
}

/// Run the config command.
pub fn run(config: &EngineConfig) -> Result<()> {
    println!("{}", render(config)?);
    Ok(())
}
