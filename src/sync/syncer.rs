//! Periodic full resync and replay.
//!
//! Watches are the fast path; the syncer is the safety net. On every cycle
//! (and once after each watch reconnect) the replicated prefixes are
//! re-read and compared against local state: store-newer entries are
//! reapplied, replica-only instance entries are either dropped or, for
//! self-owned records that may have lost a write, re-created, and marker,
//! debug and function-meta divergence is closed with synthetic events. A
//! successful pass ends by replaying the operation buffer.

use crate::core::error::WardenError;
use crate::meta::keys;
use crate::meta::replay::PendingPut;
use crate::meta::store::GetResponse;
use crate::reconcile::business::{Ctx, Member};
use crate::reconcile::kill;
use crate::reconcile::leader::spawn_schedule;
use crate::reconcile::messages::{Command, RegistryEvent};
use crate::registry::record::{InstanceRecord, InstanceStatus, RouteRecord};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Fire a resync command on a fixed interval.
pub fn spawn_timer(tx: mpsc::Sender<Command>, interval_ms: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if tx.send(Command::Resync).await.is_err() {
                break;
            }
        }
    })
}

/// Compare the store against local state and produce the synthetic events
/// that close the gap. Self-owned records missing from the store are
/// repaired in place. Returns `None` when a read failed; the next cycle
/// retries.
pub async fn resync(ctx: &Ctx, member: &mut Member) -> Option<Vec<RegistryEvent>> {
    let response = read_prefix(ctx, keys::INSTANCE_PREFIX).await?;
    let markers = read_prefix(ctx, keys::ABNORMAL_SCHEDULER_PREFIX).await?;
    let metas = read_prefix(ctx, keys::FUNCTION_META_PREFIX).await?;
    let debug = read_prefix(ctx, keys::DEBUG_INSTANCE_PREFIX).await?;

    let mut store_keys = HashSet::with_capacity(response.kvs.len());
    let mut events = Vec::new();
    for kv in &response.kvs {
        store_keys.insert(kv.key.clone());
        let mut record = match InstanceRecord::decode(&kv.key, &kv.value) {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(key = %kv.key, %err, "undecodable record skipped in resync");
                continue;
            }
        };
        record.mod_revision = kv.mod_revision;
        record.version = kv.version;
        let newer = member
            .gate
            .last(&record.instance_id)
            .map_or(true, |last| kv.mod_revision > last);
        if newer {
            events.push(RegistryEvent::InstancePut {
                key: kv.key.clone(),
                record,
                prev: None,
            });
        }
    }

    let mut repairs = Vec::new();
    for (key, record) in member.replica.entries() {
        if store_keys.contains(key) {
            continue;
        }
        let self_owned = record.node_id == ctx.node_id();
        let repairable =
            self_owned && !record.low_reliability && record.status != InstanceStatus::Scheduling;
        if repairable {
            repairs.push((key.to_string(), record.clone()));
        } else {
            events.push(RegistryEvent::InstanceDelete {
                key: key.to_string(),
                instance_id: record.instance_id.clone(),
                revision: response.revision,
            });
        }
    }

    for (key, record) in repairs {
        repair_lost_write(ctx, member, &key, record).await;
    }

    let mut marker_nodes = HashSet::new();
    for kv in &markers.kvs {
        if let Some(node_id) = kv.key.strip_prefix(keys::ABNORMAL_SCHEDULER_PREFIX) {
            marker_nodes.insert(node_id.to_string());
        }
    }
    for node_id in &marker_nodes {
        if !member.abnormal.contains(node_id) {
            events.push(RegistryEvent::AbnormalMarker {
                node_id: node_id.clone(),
                present: true,
            });
        }
    }
    for node_id in &member.abnormal {
        // A marker whose write is still parked for replay is not missing.
        if !marker_nodes.contains(node_id)
            && !member
                .replay
                .has_pending_put(&keys::abnormal_scheduler_key(node_id))
        {
            events.push(RegistryEvent::AbnormalMarker {
                node_id: node_id.clone(),
                present: false,
            });
        }
    }

    let mut debug_ids = HashSet::new();
    for kv in &debug.kvs {
        let mut record = match InstanceRecord::decode(&kv.key, &kv.value) {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(key = %kv.key, %err, "undecodable debug record skipped in resync");
                continue;
            }
        };
        record.mod_revision = kv.mod_revision;
        record.version = kv.version;
        debug_ids.insert(record.instance_id.clone());
        let known = member
            .debug_instances
            .get(&record.instance_id)
            .map_or(false, |r| r.mod_revision >= kv.mod_revision);
        if !known {
            events.push(RegistryEvent::DebugInstancePut { record });
        }
    }
    for instance_id in member.debug_instances.keys() {
        if !debug_ids.contains(instance_id) {
            events.push(RegistryEvent::DebugInstanceDeleted {
                instance_id: instance_id.clone(),
            });
        }
    }

    let mut meta_keys = HashSet::new();
    for kv in &metas.kvs {
        if let Some(function_key) = keys::function_key_from_meta_key(&kv.key) {
            meta_keys.insert(function_key.to_string());
        }
    }
    for function_key in &meta_keys {
        if !member.function_meta.contains(function_key) {
            events.push(RegistryEvent::FunctionMetaPut {
                function_key: function_key.clone(),
            });
        }
    }
    for function_key in &member.function_meta {
        if !meta_keys.contains(function_key) {
            events.push(RegistryEvent::FunctionMetaDeleted {
                function_key: function_key.clone(),
            });
        }
    }

    // Tombstones older than a full cycle can no longer fence anything a
    // live watch could still deliver.
    member
        .gate
        .prune(member.resync_floor, |id| member.replica.contains(id));
    member.resync_floor = response.revision;

    tracing::debug!(
        store_entries = store_keys.len(),
        events = events.len(),
        "resync pass computed"
    );
    Some(events)
}

async fn read_prefix(ctx: &Ctx, prefix: &str) -> Option<GetResponse> {
    match ctx.store.get_prefix(prefix).await {
        Ok(response) => Some(response),
        Err(err) => {
            tracing::warn!(prefix, %err, "resync read failed");
            None
        }
    }
}

/// Re-create a record the store lost, starting its version over. A version
/// conflict means someone else re-created the key first; the watch event
/// for that write reconciles the replica.
async fn repair_lost_write(ctx: &Ctx, member: &mut Member, key: &str, record: InstanceRecord) {
    let mut next = record;
    next.version = 1;
    let value = match next.encode() {
        Ok(value) => value,
        Err(err) => {
            tracing::error!(key, %err, "lost-write repair failed to encode");
            return;
        }
    };
    tracing::warn!(key, instance_id = %next.instance_id, "re-creating record missing from store");
    match ctx.store.put(key, &value, Some(0)).await {
        Ok(_) => {
            // The route projection shares the record's fate.
            let route_key = keys::instance_route_key(&next.instance_id);
            match RouteRecord::from_record(&next).encode() {
                Ok(route) => match ctx.store.put(&route_key, &route, None).await {
                    Ok(_) => {}
                    Err(err) if err.is_retryable() => {
                        member.replay.record_raw_put(&route_key, route);
                    }
                    Err(err) => tracing::warn!(key = route_key, %err, "route repair failed"),
                },
                Err(err) => tracing::warn!(key = route_key, %err, "route failed to encode"),
            }
        }
        Err(WardenError::VersionConflict { .. }) => {}
        Err(err) if err.is_retryable() => member.replay.record_put(key, next),
        Err(err) => tracing::warn!(key, %err, "lost-write repair failed"),
    }
}

/// Replay buffered operations after a successful resync. An entry leaves
/// the buffer only when the identical operation succeeds or its instance is
/// gone; a replayed SCHEDULING record re-triggers the reschedule.
pub async fn replay(ctx: &Ctx, member: &mut Member) {
    if member.replay.is_empty() {
        return;
    }
    tracing::info!(pending = member.replay.len(), "replaying buffered operations");

    for (key, pending) in member.replay.pending_puts() {
        match pending {
            PendingPut::Record(record) => {
                if !member.replica.contains(&record.instance_id) {
                    tracing::info!(key, "buffered put dropped, instance vanished");
                    member.replay.resolve_put(&key);
                    continue;
                }
                if kill::buffered_put(ctx, member, &key, &record).await
                    && record.status == InstanceStatus::Scheduling
                {
                    spawn_schedule(ctx, record);
                }
            }
            PendingPut::Raw(value) => match ctx.store.put(&key, &value, None).await {
                Ok(_) => member.replay.resolve_put(&key),
                Err(err) if err.is_retryable() => {
                    tracing::warn!(key, %err, "buffered put still failing");
                }
                Err(err) => {
                    tracing::warn!(key, %err, "buffered put rejected, dropping");
                    member.replay.resolve_put(&key);
                }
            },
        }
    }

    for key in member.replay.pending_deletes() {
        match ctx.store.delete(&key, None).await {
            Ok(()) => member.replay.resolve_delete(&key),
            Err(err) if err.is_retryable() => {
                tracing::warn!(key, %err, "buffered delete still failing");
            }
            Err(err) => {
                tracing::warn!(key, %err, "buffered delete rejected, dropping");
                member.replay.resolve_delete(&key);
            }
        }
    }
}
