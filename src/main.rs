//! Sluice - unified CLI entrypoint.
//!
//! Usage:
//!   sluice start --config config/sluice.toml
//!   sluice config validate --config config/sluice.toml

use anyhow::Result;
use clap::Parser;
use sluice::cli::commands::{run_config, run_start};
use sluice::cli::{Cli, Commands};
use std::path::PathBuf;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config/sluice.toml"));

    match cli.command {
        Commands::Start(_args) => run_start(&config_path).await,
        Commands::Config(args) => run_config(args, &config_path),
    }
}
