//! Command-line interface.

pub mod commands;

use clap::{Parser, Subcommand};
use commands::{config::ConfigArgs, start::StartArgs};

/// Sluice CDC capture server.
#[derive(Parser, Debug)]
#[command(name = "sluice", version, about)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a capture server.
    Start(StartArgs),
    /// Inspect and validate configuration.
    Config(ConfigArgs),
}
