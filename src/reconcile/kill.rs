//! Kill and cancel-schedule coordination.
//!
//! Kills are eventually idempotent, never exactly-once: a signal is sent to
//! the owning node and re-sent on a fixed interval until the record reaches
//! a terminal state or disappears. A remote "not found" means the desired
//! end state already holds, so the record is force-deleted to converge the
//! store.

use crate::core::error::{WardenError, WardenResult};
use crate::meta::keys;
use crate::reconcile::business::{Ctx, KillTicket, Member};
use crate::reconcile::messages::{CancelSchedule, Command, KillCode, KillRequest, KillResponse};
use crate::registry::record::{InstanceRecord, InstanceStatus, KillSignal};
use std::time::Duration;
use tokio::sync::oneshot;

/// Begin (or join) a kill of one instance.
///
/// An existing in-flight kill absorbs the new request: the waiter is
/// attached and no second signal is sent unless the signal itself changed,
/// in which case the newer request supersedes the older one.
pub fn start_kill(
    ctx: &Ctx,
    member: &mut Member,
    record: &InstanceRecord,
    signal: KillSignal,
    reason: &str,
    waiter: Option<oneshot::Sender<KillResponse>>,
) {
    let instance_id = record.instance_id.clone();
    if let Some(ticket) = member.kills.get_mut(&instance_id) {
        if let Some(waiter) = waiter {
            ticket.waiters.push(waiter);
        }
        if ticket.signal == signal {
            return;
        }
        ticket.signal = signal;
        ticket.reason = reason.to_string();
        ticket.request_id = uuid::Uuid::new_v4().to_string();
        let request_id = ticket.request_id.clone();
        dispatch_signal(ctx, record, signal, reason, &request_id);
        return;
    }

    member.exiting.insert(instance_id.clone());

    // An unplaced instance has nowhere to receive the signal; converge by
    // deleting the record outright.
    if record.node_id.is_empty() {
        tracing::info!(instance_id, "killing unplaced instance by force delete");
        member.kills.insert(
            instance_id.clone(),
            KillTicket {
                request_id: uuid::Uuid::new_v4().to_string(),
                signal,
                reason: reason.to_string(),
                waiters: waiter.into_iter().collect(),
            },
        );
        let record = record.clone();
        let ctx2 = ctx.clone();
        let request_id = member.kills[&instance_id].request_id.clone();
        tokio::spawn(async move {
            let _ = ctx2
                .tx
                .send(Command::KillDelivery {
                    instance_id: record.instance_id.clone(),
                    request_id,
                    result: Err(WardenError::not_found(record.instance_id.clone())),
                })
                .await;
        });
        return;
    }

    let request_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(
        instance_id,
        node_id = %record.node_id,
        ?signal,
        reason,
        "killing instance"
    );
    member.kills.insert(
        instance_id.clone(),
        KillTicket {
            request_id: request_id.clone(),
            signal,
            reason: reason.to_string(),
            waiters: waiter.into_iter().collect(),
        },
    );
    dispatch_signal(ctx, record, signal, reason, &request_id);
    schedule_retry(ctx, &instance_id);
}

/// Send the signal to the owning node, off the control task. The outcome
/// re-enters through the command queue.
fn dispatch_signal(
    ctx: &Ctx,
    record: &InstanceRecord,
    signal: KillSignal,
    reason: &str,
    request_id: &str,
) {
    let placement = ctx.placement.clone();
    let tx = ctx.tx.clone();
    let node_id = record.node_id.clone();
    let instance_id = record.instance_id.clone();
    let mut request = KillRequest::instance(instance_id.clone(), signal, reason);
    request.request_id = request_id.to_string();
    let request_id = request_id.to_string();
    tokio::spawn(async move {
        let result = async {
            let address = placement.node_address(&node_id).await?;
            placement.send_kill(&address, &request).await
        }
        .await;
        let _ = tx
            .send(Command::KillDelivery {
                instance_id,
                request_id,
                result,
            })
            .await;
    });
}

fn schedule_retry(ctx: &Ctx, instance_id: &str) {
    ctx.schedule(
        Duration::from_millis(ctx.config.reconcile.kill_retry_interval_ms),
        Command::KillRetryTick {
            instance_id: instance_id.to_string(),
        },
    );
}

/// Retry timer fired: re-send while the record is alive and non-terminal.
pub async fn on_retry(ctx: &Ctx, member: &mut Member, instance_id: &str) {
    let Some(ticket) = member.kills.get(instance_id) else {
        return;
    };
    let Some(record) = member.replica.get(instance_id).cloned() else {
        // Record already gone; the delete event resolves the ticket.
        complete_on_delete(member, instance_id);
        return;
    };
    if record.status == InstanceStatus::Fatal {
        complete_on_fatal(ctx, member, &record).await;
        return;
    }
    if record.status.is_terminal() {
        // Terminal but not yet deleted; wait for the delete event instead
        // of re-signalling a finished process.
        schedule_retry(ctx, instance_id);
        return;
    }
    tracing::info!(instance_id, signal = ?ticket.signal, "kill retry");
    dispatch_signal(ctx, &record, ticket.signal, &ticket.reason, &ticket.request_id);
    schedule_retry(ctx, instance_id);
}

/// Outcome of one signal dispatch.
pub async fn on_delivery(
    ctx: &Ctx,
    member: &mut Member,
    instance_id: &str,
    request_id: &str,
    result: WardenResult<KillResponse>,
) {
    let Some(ticket) = member.kills.get(instance_id) else {
        return;
    };
    if ticket.request_id != request_id {
        // A newer kill superseded this dispatch.
        return;
    }
    match result {
        Ok(response) if response.code == KillCode::NotFound => {
            let record = member.replica.get(instance_id).cloned();
            if let Some(record) = record {
                tracing::info!(instance_id, "remote reported instance gone, force deleting");
                force_delete(ctx, member, &record).await;
            }
            resolve(member, instance_id, KillResponse::ok(request_id));
        }
        Ok(_) => {
            // Delivered; the delete or FATAL event closes the loop.
        }
        Err(WardenError::NotFound { .. }) => {
            let record = member.replica.get(instance_id).cloned();
            if let Some(record) = record {
                force_delete(ctx, member, &record).await;
            }
            resolve(member, instance_id, KillResponse::ok(request_id));
        }
        Err(err) => {
            tracing::warn!(instance_id, %err, "kill dispatch failed, will retry");
        }
    }
}

/// The record was deleted from the store: the kill is done.
pub fn complete_on_delete(member: &mut Member, instance_id: &str) {
    member.exiting.remove(instance_id);
    if let Some(ticket) = member.kills.remove(instance_id) {
        for waiter in ticket.waiters {
            let _ = waiter.send(KillResponse::ok(&ticket.request_id));
        }
    }
}

/// The record went FATAL. For a family-exit kill, or when ownership already
/// passed to the takeover path, the leader force-deletes the record to
/// converge and resolves the kill.
pub async fn complete_on_fatal(ctx: &Ctx, member: &mut Member, record: &InstanceRecord) {
    let instance_id = record.instance_id.as_str();
    let Some(ticket) = member.kills.get(instance_id) else {
        return;
    };
    if ticket.signal != KillSignal::FamilyExit && !record.node_id.is_empty() {
        return;
    }
    force_delete(ctx, member, record).await;
    let request_id = member.kills[instance_id].request_id.clone();
    resolve(member, instance_id, KillResponse::ok(&request_id));
}

fn resolve(member: &mut Member, instance_id: &str, response: KillResponse) {
    member.exiting.remove(instance_id);
    if let Some(ticket) = member.kills.remove(instance_id) {
        for waiter in ticket.waiters {
            let _ = waiter.send(response.clone());
        }
    }
}

/// Delete the record key plus its projections. Route keys are skipped for
/// low-reliability instances; debug keys only exist for debug instances.
/// Retryable store failures park the delete in the replay buffer.
pub async fn force_delete(ctx: &Ctx, member: &mut Member, record: &InstanceRecord) {
    let record_key = member
        .replica
        .key_of(&record.instance_id)
        .map(str::to_string)
        .unwrap_or_else(|| keys::instance_key(&record.function_key, &record.instance_id));
    buffered_delete(ctx, member, &record_key).await;
    if !record.low_reliability {
        let route_key = keys::instance_route_key(&record.instance_id);
        buffered_delete(ctx, member, &route_key).await;
    }
    if record.debug {
        let debug_key = keys::debug_instance_key(&record.instance_id);
        buffered_delete(ctx, member, &debug_key).await;
    }
}

async fn buffered_delete(ctx: &Ctx, member: &mut Member, key: &str) {
    match ctx.store.delete(key, None).await {
        Ok(()) => member.replay.resolve_delete(key),
        Err(err) if err.is_retryable() => {
            tracing::warn!(key, %err, "delete buffered for replay");
            member.replay.record_delete(key);
        }
        Err(err) => tracing::warn!(key, %err, "delete failed"),
    }
}

/// Write a record back to the store, parking the intent on a retryable
/// failure. Returns whether the write landed.
pub async fn buffered_put(
    ctx: &Ctx,
    member: &mut Member,
    key: &str,
    record: &InstanceRecord,
) -> bool {
    let value = match record.encode() {
        Ok(value) => value,
        Err(err) => {
            tracing::error!(key, %err, "record failed to encode");
            return false;
        }
    };
    match ctx.store.put(key, &value, None).await {
        Ok(_) => {
            member.replay.resolve_put(key);
            true
        }
        Err(err) if err.is_retryable() => {
            tracing::warn!(key, %err, "put buffered for replay");
            member.replay.record_put(key, record.clone());
            false
        }
        Err(err) => {
            tracing::warn!(key, %err, "put failed");
            false
        }
    }
}

/// Fire a cancel-schedule request at the current scheduling root. A stale
/// root address is retried after a timeout until a response arrives.
pub fn cancel_schedule(ctx: &Ctx, request: CancelSchedule) {
    let placement = ctx.placement.clone();
    let tx = ctx.tx.clone();
    let timeout = Duration::from_millis(ctx.config.reconcile.cancel_timeout_ms);
    tokio::spawn(async move {
        loop {
            let outcome = async {
                let address = placement.leader_address().await?;
                placement.send_cancel(&address, &request).await
            }
            .await;
            match outcome {
                Ok(()) => break,
                Err(err) => {
                    tracing::warn!(
                        id = %request.id,
                        scope = ?request.scope,
                        %err,
                        "cancel schedule failed, retrying"
                    );
                }
            }
            if tx.is_closed() {
                break;
            }
            tokio::time::sleep(timeout).await;
        }
    });
}
