//! `warden start`: run the control plane until interrupted.

use crate::core::config::Config;
use crate::core::runtime::Warden;
use crate::meta::memory::MemoryStore;
use crate::placement::StandalonePlacement;
use crate::reconcile::messages::Role;
use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Args)]
pub struct StartArgs {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "warden.toml")]
    pub config: PathBuf,

    /// Log filter when RUST_LOG is not set, e.g. "info" or "warden=debug".
    #[arg(long, default_value = "info")]
    pub log: String,

    /// Start as leader instead of waiting for a leadership notification.
    #[arg(long)]
    pub leader: bool,
}

pub async fn run(args: StartArgs) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log)),
        )
        .init();

    let config = Config::from_file(&args.config)?;
    tracing::info!(node_id = %config.node.node_id, "starting warden");

    // The embedded store keeps the process self-contained; a deployment
    // wires in a client for the shared metadata store instead.
    let store = Arc::new(MemoryStore::new());
    let placement = Arc::new(StandalonePlacement::new(config.node.advertise_addr.clone()));
    let warden = Warden::start(config, store, placement);

    if args.leader {
        warden
            .set_role(Role::Leader)
            .await
            .context("failed to assume leadership")?;
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");
    warden.shutdown().await;
    Ok(())
}
