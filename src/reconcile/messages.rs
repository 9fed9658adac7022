//! Request, response and control-task command types.

use crate::core::error::WardenResult;
use crate::placement::NodeInfo;
use crate::registry::record::{InstanceRecord, KillSignal};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// Target of a kill request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KillTarget {
    Instance(String),
    Job(String),
}

/// Inbound kill request, by instance or by job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KillRequest {
    pub request_id: String,
    pub target: KillTarget,
    pub signal: KillSignal,
    #[serde(default)]
    pub reason: String,
}

impl KillRequest {
    pub fn instance(instance_id: impl Into<String>, signal: KillSignal, reason: &str) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            target: KillTarget::Instance(instance_id.into()),
            signal,
            reason: reason.to_string(),
        }
    }

    pub fn job(job_id: impl Into<String>, reason: &str) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            target: KillTarget::Job(job_id.into()),
            signal: KillSignal::ShutdownAll,
            reason: reason.to_string(),
        }
    }
}

/// Result code of a kill request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KillCode {
    Ok,
    /// The target is unknown. Not an error: the desired end state already
    /// holds.
    NotFound,
    Error,
}

/// Response to a kill request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KillResponse {
    pub request_id: String,
    pub code: KillCode,
    #[serde(default)]
    pub message: String,
}

impl KillResponse {
    pub fn ok(request_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            code: KillCode::Ok,
            message: String::new(),
        }
    }

    pub fn not_found(request_id: &str, message: impl Into<String>) -> Self {
        Self {
            request_id: request_id.to_string(),
            code: KillCode::NotFound,
            message: message.into(),
        }
    }

    pub fn error(request_id: &str, message: impl Into<String>) -> Self {
        Self {
            request_id: request_id.to_string(),
            code: KillCode::Error,
            message: message.into(),
        }
    }
}

/// Scope of a cancel-schedule request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CancelScope {
    /// Cancel pending children of a parent instance.
    Parent,
    /// Cancel everything pending for a job.
    Job,
    /// Cancel everything pending for a function.
    Function,
}

/// Best-effort cancellation of in-flight scheduling work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelSchedule {
    pub request_id: String,
    /// Parent instance, job or function key depending on `scope`.
    pub id: String,
    pub scope: CancelScope,
    #[serde(default)]
    pub reason: String,
}

impl CancelSchedule {
    pub fn new(id: impl Into<String>, scope: CancelScope, reason: &str) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            id: id.into(),
            scope,
            reason: reason.to_string(),
        }
    }
}

/// Replica role assigned by the leadership notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
}

/// One decoded, revision-gated registry event.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    InstancePut {
        key: String,
        record: InstanceRecord,
        prev: Option<InstanceRecord>,
    },
    InstanceDelete {
        key: String,
        instance_id: String,
        revision: i64,
    },
    FunctionMetaPut {
        function_key: String,
    },
    FunctionMetaDeleted {
        function_key: String,
    },
    AbnormalMarker {
        node_id: String,
        present: bool,
    },
    NodeRouteAdded {
        node_id: String,
    },
    NodeRouteRemoved {
        node_id: String,
    },
    DebugInstancePut {
        record: InstanceRecord,
    },
    DebugInstanceDeleted {
        instance_id: String,
    },
}

/// Messages processed by the control task. Timers and spawned I/O re-enter
/// through this queue, so all state mutation stays serialized.
pub enum Command {
    Events(Vec<RegistryEvent>),
    /// Periodic full resync tick (also fired once after every reconnect).
    Resync,
    RoleChanged(Role),
    Kill {
        request: KillRequest,
        reply: oneshot::Sender<KillResponse>,
    },
    QueryInstances {
        reply: oneshot::Sender<Vec<InstanceRecord>>,
    },
    QueryDebugInstances {
        reply: oneshot::Sender<Vec<InstanceRecord>>,
    },
    CancelSchedule {
        request: CancelSchedule,
    },
    /// Placement layer reported a fault on a local node. The reply resolves
    /// when migration of that node's instances finished.
    NodeFault {
        node_id: String,
        reply: oneshot::Sender<()>,
    },
    NodeAdded(NodeInfo),
    NodeRemoved {
        node_id: String,
        force: bool,
    },
    /// Node list refresh completed after a promotion.
    NodesRefreshed(WardenResult<Vec<NodeInfo>>),
    /// Whether a node is currently marked abnormal.
    CheckNodeAbnormal {
        node_id: String,
        reply: oneshot::Sender<bool>,
    },
    /// Re-submission to the placement layer exhausted its retry budget.
    ScheduleDispatchFailed {
        instance_id: String,
        reason: String,
    },
    /// Kill retry timer fired for an instance.
    KillRetryTick {
        instance_id: String,
    },
    /// Outcome of an async kill dispatch to a node address.
    KillDelivery {
        instance_id: String,
        request_id: String,
        result: WardenResult<KillResponse>,
    },
    /// Abnormal-node marker reached its expiry.
    AbnormalExpired {
        node_id: String,
    },
    SetUpgradeWindow(bool),
    Shutdown,
}
