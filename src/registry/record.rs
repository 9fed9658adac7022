//! Instance records, lifecycle status codes and kill signals.
//!
//! Records are stored in the metadata store as JSON under
//! `instances/<function-key>/<instance-id>`. The store-assigned
//! `mod_revision` and `version` are folded into the struct on apply so the
//! reconciler can issue compare-and-swap writes without a re-read.

use crate::core::error::{WardenError, WardenResult};
use serde::{Deserialize, Serialize};

/// Instance lifecycle status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    /// Initial state of every record.
    #[default]
    Scheduling,
    Creating,
    Running,
    Failed,
    Exiting,
    Exited,
    Fatal,
    Evicted,
    ScheduleFailed,
}

impl InstanceStatus {
    /// Terminal states never transition further; a kill against a terminal
    /// record resolves instead of retrying.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Exited | Self::Fatal | Self::Evicted | Self::ScheduleFailed
        )
    }

    /// Whether the instance is already on its way out.
    pub fn is_exiting_or_exited(self) -> bool {
        matches!(self, Self::Exiting | Self::Exited)
    }
}

/// Signal delivered with a kill request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KillSignal {
    /// Cascading kill sent to descendants of a failed ancestor.
    FamilyExit,
    /// Orderly stop of a single instance.
    Shutdown,
    /// Job-scoped kill fanned out to every non-detached instance.
    ShutdownAll,
}

/// A single instance as replicated through the metadata store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub instance_id: String,

    /// Request that created the instance.
    #[serde(default)]
    pub request_id: String,

    /// Node (function proxy) currently owning the instance.
    #[serde(default)]
    pub node_id: String,

    /// Agent on the owning node hosting the process.
    #[serde(default)]
    pub agent_id: String,

    /// Parent instance; empty for roots.
    #[serde(default)]
    pub parent_id: String,

    #[serde(default)]
    pub job_id: String,

    pub function_key: String,

    pub status: InstanceStatus,

    /// Human-readable reason for the latest status transition.
    #[serde(default)]
    pub reason: String,

    /// How many times this instance has been (re)submitted for scheduling.
    #[serde(default)]
    pub schedule_times: u32,

    /// Roots created directly by a frontend act as job drivers.
    #[serde(default)]
    pub created_by_frontend: bool,

    /// Low-reliability instances skip route-key writes.
    #[serde(default)]
    pub low_reliability: bool,

    /// Debug instances carry an extra `debugInstances/` projection.
    #[serde(default)]
    pub debug: bool,

    /// Detached instances survive job-scoped kills.
    #[serde(default)]
    pub detached: bool,

    /// Set when the process ended on its own rather than by fault.
    #[serde(default)]
    pub normal_exit: bool,

    /// Store revision of the last applied mutation.
    #[serde(default)]
    pub mod_revision: i64,

    /// Store key version, used for compare-and-swap writes.
    #[serde(default)]
    pub version: i64,
}

impl InstanceRecord {
    /// Roots have no parent or were created directly by a frontend.
    pub fn is_root(&self) -> bool {
        self.parent_id.is_empty() || self.created_by_frontend
    }

    /// Job drivers are frontend-created roots; a finished driver reaps its
    /// whole family.
    pub fn is_driver(&self) -> bool {
        self.created_by_frontend
    }

    /// A driver that reached FATAL through a normal process exit.
    pub fn is_driver_finished(&self) -> bool {
        self.is_driver() && self.status == InstanceStatus::Fatal && self.normal_exit
    }

    pub fn encode(&self) -> WardenResult<String> {
        serde_json::to_string(self).map_err(|e| WardenError::internal(e.to_string()))
    }

    pub fn decode(key: &str, value: &str) -> WardenResult<Self> {
        serde_json::from_str(value).map_err(|source| WardenError::InvalidRecord {
            key: key.to_string(),
            source,
        })
    }
}

/// Route-only projection written under `instanceRoutes/<instance-id>` for
/// consumers that only need to reach the instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRecord {
    pub instance_id: String,
    pub node_id: String,
    #[serde(default)]
    pub agent_id: String,
}

impl RouteRecord {
    pub fn from_record(record: &InstanceRecord) -> Self {
        Self {
            instance_id: record.instance_id.clone(),
            node_id: record.node_id.clone(),
            agent_id: record.agent_id.clone(),
        }
    }

    pub fn encode(&self) -> WardenResult<String> {
        serde_json::to_string(self).map_err(|e| WardenError::internal(e.to_string()))
    }
}
