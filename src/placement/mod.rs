//! Boundary to the placement layer.
//!
//! Warden never makes placement decisions; it asks the placement layer to
//! re-submit instances, resolves node and leader addresses through it, and
//! dispatches kill/cancel messages to those addresses. The trait keeps the
//! reconciler testable against an in-process double.

use crate::core::error::{WardenError, WardenResult};
use crate::reconcile::messages::{CancelSchedule, KillRequest, KillResponse};
use crate::registry::record::InstanceRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A reachable control-plane or worker node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub node_id: String,
    pub address: String,
}

/// Placement-layer contract.
///
/// Transport failures surface as [`PlacementUnavailable`] and are retried by
/// the caller with its own budget; a remote logical "not found" surfaces as
/// [`NotFound`].
///
/// [`PlacementUnavailable`]: WardenError::PlacementUnavailable
/// [`NotFound`]: WardenError::NotFound
#[async_trait]
pub trait PlacementLayer: Send + Sync {
    /// Current healthy node list, queried on promotion.
    async fn query_nodes(&self) -> WardenResult<Vec<NodeInfo>>;

    /// Address of a specific node.
    async fn node_address(&self, node_id: &str) -> WardenResult<String>;

    /// Address of the current leader (also the scheduling root), used by
    /// followers for forwarding and by cancel-schedule dispatch.
    async fn leader_address(&self) -> WardenResult<String>;

    /// Re-submit an instance for scheduling.
    async fn schedule(&self, record: &InstanceRecord) -> WardenResult<()>;

    /// Deliver a kill signal to a node address.
    async fn send_kill(&self, address: &str, request: &KillRequest) -> WardenResult<KillResponse>;

    /// Deliver a cancel-schedule request to a scheduling root address.
    async fn send_cancel(&self, address: &str, request: &CancelSchedule) -> WardenResult<()>;

    /// Forward a registry query to the leader address.
    async fn forward_query_instances(&self, address: &str) -> WardenResult<Vec<InstanceRecord>>;

    /// Forward a debug-registry query to the leader address.
    async fn forward_query_debug_instances(
        &self,
        address: &str,
    ) -> WardenResult<Vec<InstanceRecord>>;
}

/// Placement layer for a single-process deployment with no scheduler
/// attached. Node lookups fail soft and scheduling is reported as
/// unavailable, which routes faulty instances to the FATAL path.
pub struct StandalonePlacement {
    leader_address: String,
}

impl StandalonePlacement {
    pub fn new(leader_address: impl Into<String>) -> Self {
        Self {
            leader_address: leader_address.into(),
        }
    }
}

#[async_trait]
impl PlacementLayer for StandalonePlacement {
    async fn query_nodes(&self) -> WardenResult<Vec<NodeInfo>> {
        Ok(Vec::new())
    }

    async fn node_address(&self, node_id: &str) -> WardenResult<String> {
        Err(WardenError::not_found(node_id))
    }

    async fn leader_address(&self) -> WardenResult<String> {
        Ok(self.leader_address.clone())
    }

    async fn schedule(&self, _record: &InstanceRecord) -> WardenResult<()> {
        Err(WardenError::PlacementUnavailable {
            message: "no scheduler attached".to_string(),
        })
    }

    async fn send_kill(&self, _address: &str, request: &KillRequest) -> WardenResult<KillResponse> {
        Err(WardenError::PlacementUnavailable {
            message: format!("no transport for kill {}", request.request_id),
        })
    }

    async fn send_cancel(&self, _address: &str, _request: &CancelSchedule) -> WardenResult<()> {
        Ok(())
    }

    async fn forward_query_instances(&self, _address: &str) -> WardenResult<Vec<InstanceRecord>> {
        Err(WardenError::PlacementUnavailable {
            message: "no transport for query forwarding".to_string(),
        })
    }

    async fn forward_query_debug_instances(
        &self,
        _address: &str,
    ) -> WardenResult<Vec<InstanceRecord>> {
        Err(WardenError::PlacementUnavailable {
            message: "no transport for query forwarding".to_string(),
        })
    }
}
