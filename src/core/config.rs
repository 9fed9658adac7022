//! Configuration parsing and validation.
//!
//! Warden configuration is loaded from TOML files with CLI overrides.
//! Every timing knob of the reconciliation loop lives here so tests can
//! shrink the intervals without touching component code.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level Warden configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Identity of this control-plane node.
    pub node: NodeConfig,

    /// Metadata-store client configuration.
    #[serde(default)]
    pub meta_store: MetaStoreConfig,

    /// Reconciliation behavior.
    #[serde(default)]
    pub reconcile: ReconcileConfig,

    /// Sync engine timing.
    #[serde(default)]
    pub sync: SyncConfig,
}

/// Identity of the local node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier, also used as the takeover owner marker
    /// suffix when this node is leader.
    pub node_id: String,

    /// Address other replicas use to reach this node.
    #[serde(default)]
    pub advertise_addr: String,
}

/// Metadata-store client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaStoreConfig {
    /// Store endpoints (unused by the embedded in-memory store).
    #[serde(default)]
    pub endpoints: Vec<String>,

    /// How long watch registration may retry before the process gives up
    /// and terminates.
    #[serde(default = "default_watch_timeout_ms")]
    pub watch_timeout_ms: u64,
}

impl Default for MetaStoreConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            watch_timeout_ms: default_watch_timeout_ms(),
        }
    }
}

/// Reconciliation behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Re-submit instances of a faulty node to the placement layer instead
    /// of marking them FATAL.
    #[serde(default)]
    pub runtime_recover_enable: bool,

    /// Interval between kill retries while a record stays non-terminal.
    #[serde(default = "default_kill_retry_interval_ms")]
    pub kill_retry_interval_ms: u64,

    /// Timeout before a cancel-schedule request is re-sent to a fresh
    /// scheduling root.
    #[serde(default = "default_cancel_timeout_ms")]
    pub cancel_timeout_ms: u64,

    /// Expiry after which an abnormal-node marker is garbage collected
    /// from the store.
    #[serde(default = "default_abnormal_expiry_ms")]
    pub abnormal_expiry_ms: u64,

    /// Upper bound on scheduling attempts per instance; beyond it the
    /// instance is marked FATAL instead of re-submitted.
    #[serde(default = "default_max_schedule_times")]
    pub max_schedule_times: u32,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            runtime_recover_enable: false,
            kill_retry_interval_ms: default_kill_retry_interval_ms(),
            cancel_timeout_ms: default_cancel_timeout_ms(),
            abnormal_expiry_ms: default_abnormal_expiry_ms(),
            max_schedule_times: default_max_schedule_times(),
        }
    }
}

/// Sync engine timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Interval between periodic full-prefix resyncs.
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval_ms: default_sync_interval_ms(),
        }
    }
}

fn default_watch_timeout_ms() -> u64 {
    30_000
}

fn default_kill_retry_interval_ms() -> u64 {
    15_000
}

fn default_cancel_timeout_ms() -> u64 {
    5_000
}

fn default_abnormal_expiry_ms() -> u64 {
    2 * 60 * 60 * 1000
}

fn default_max_schedule_times() -> u32 {
    3
}

fn default_sync_interval_ms() -> u64 {
    60_000
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.node.node_id.is_empty(), "node.node_id must be set");
        anyhow::ensure!(
            self.meta_store.watch_timeout_ms > 0,
            "meta_store.watch_timeout_ms must be positive"
        );
        anyhow::ensure!(
            self.reconcile.kill_retry_interval_ms > 0,
            "reconcile.kill_retry_interval_ms must be positive"
        );
        anyhow::ensure!(
            self.sync.sync_interval_ms > 0,
            "sync.sync_interval_ms must be positive"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_applied() {
        let config: Config = toml::from_str(
            r#"
            [node]
            node_id = "master-0"
            "#,
        )
        .unwrap();
        assert_eq!(config.meta_store.watch_timeout_ms, 30_000);
        assert_eq!(config.reconcile.kill_retry_interval_ms, 15_000);
        assert!(!config.reconcile.runtime_recover_enable);
        config.validate().unwrap();
    }

    #[test]
    fn empty_node_id_is_rejected() {
        let config: Config = toml::from_str(
            r#"
            [node]
            node_id = ""
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }
}
