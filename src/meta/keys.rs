//! Logical key layout in the metadata store.
//!
//! Layout:
//! - `instances/<function-key>/<instance-id>` - full instance records
//! - `instanceRoutes/<instance-id>` - route-only projection written for
//!   non-owners (skipped for low-reliability instances)
//! - `abnormalSchedulers/<node-id>` - fault markers, shared by all replicas
//! - `functionMeta/<function-key>` - function definitions
//! - `nodeRoutes/<node-id>` - heartbeat-backed node route keys
//! - `debugInstances/<instance-id>` - debug-instance projections

/// Prefix for full instance records.
pub const INSTANCE_PREFIX: &str = "instances/";

/// Prefix for route-only instance projections.
pub const INSTANCE_ROUTE_PREFIX: &str = "instanceRoutes/";

/// Prefix for abnormal-node fault markers.
pub const ABNORMAL_SCHEDULER_PREFIX: &str = "abnormalSchedulers/";

/// Prefix for function definitions.
pub const FUNCTION_META_PREFIX: &str = "functionMeta/";

/// Prefix for node heartbeat routes.
pub const NODE_ROUTE_PREFIX: &str = "nodeRoutes/";

/// Prefix for debug-instance projections.
pub const DEBUG_INSTANCE_PREFIX: &str = "debugInstances/";

/// Build the record key for an instance of a function.
pub fn instance_key(function_key: &str, instance_id: &str) -> String {
    format!("{INSTANCE_PREFIX}{function_key}/{instance_id}")
}

/// Build the route key for an instance.
pub fn instance_route_key(instance_id: &str) -> String {
    format!("{INSTANCE_ROUTE_PREFIX}{instance_id}")
}

/// Build the abnormal marker key for a node.
pub fn abnormal_scheduler_key(node_id: &str) -> String {
    format!("{ABNORMAL_SCHEDULER_PREFIX}{node_id}")
}

/// Build the node route key for a node.
pub fn node_route_key(node_id: &str) -> String {
    format!("{NODE_ROUTE_PREFIX}{node_id}")
}

/// Build the debug-instance key for an instance.
pub fn debug_instance_key(instance_id: &str) -> String {
    format!("{DEBUG_INSTANCE_PREFIX}{instance_id}")
}

/// Extract the instance id from an instance or route key.
///
/// Both layouts keep the instance id as the final path segment.
pub fn instance_id_from_key(key: &str) -> Option<&str> {
    key.rsplit('/').next().filter(|id| !id.is_empty())
}

/// Extract the function key from an instance record key.
pub fn function_key_from_instance_key(key: &str) -> Option<&str> {
    let rest = key.strip_prefix(INSTANCE_PREFIX)?;
    let (function_key, _) = rest.rsplit_once('/')?;
    if function_key.is_empty() {
        None
    } else {
        Some(function_key)
    }
}

/// Extract the function key from a function-meta key.
pub fn function_key_from_meta_key(key: &str) -> Option<&str> {
    key.strip_prefix(FUNCTION_META_PREFIX)
        .filter(|f| !f.is_empty())
}

/// Extract the node id from a node-route key.
pub fn node_id_from_route_key(key: &str) -> Option<&str> {
    key.strip_prefix(NODE_ROUTE_PREFIX).filter(|n| !n.is_empty())
}
