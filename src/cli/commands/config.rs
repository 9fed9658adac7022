//! `warden config`: configuration utilities.

use crate::core::config::Config;
use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::PathBuf;

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Parse and validate a configuration file.
    Validate {
        /// Path to the TOML configuration file.
        #[arg(long, default_value = "warden.toml")]
        config: PathBuf,
    },
}

pub fn run(args: ConfigArgs) -> Result<()> {
    match args.action {
        ConfigAction::Validate { config } => {
            let parsed = Config::from_file(&config)?;
            println!(
                "configuration OK: node {} watching {} endpoint(s)",
                parsed.node.node_id,
                parsed.meta_store.endpoints.len()
            );
            Ok(())
        }
    }
}
