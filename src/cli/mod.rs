//! Command-line entrypoint.

pub mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "warden", version, about = "Instance-registry replication and fault recovery")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the control plane.
    Start(commands::start::StartArgs),
    /// Configuration utilities.
    Config(commands::config::ConfigArgs),
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Start(args) => commands::start::run(args).await,
        Commands::Config(args) => commands::config::run(args),
    }
}
