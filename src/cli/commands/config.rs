//! Config command implementation.

use crate::core::config::Config;
use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::path::Path;

/// Inspect and validate configuration.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

/// Config subcommands.
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Parse and validate a configuration file.
    Validate,
}

/// Run the config command with the given config path.
pub fn run_config(args: ConfigArgs, config_path: &Path) -> Result<()> {
    match args.command {
        ConfigCommand::Validate => {
            let config = Config::from_file(config_path)
                .with_context(|| format!("failed to load {}", config_path.display()))?;
            config.validate().context("invalid configuration")?;
            println!("configuration ok: {}", config_path.display());
            println!("  cluster_id = {}", config.server.cluster_id);
            println!("  advertise_addr = {}", config.server.advertise_addr);
            println!(
                "  redo = {}",
                if config.consistent.is_enabled() {
                    config.consistent.storage.as_str()
                } else {
                    "disabled"
                }
            );
            println!("  changefeeds = {}", config.changefeeds.len());
            Ok(())
        }
    }
}
