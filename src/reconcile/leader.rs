//! Leader-side reconciliation.
//!
//! The leader is the only role that mutates global state: it takes over
//! instances of faulty nodes, cascades kills through families, re-submits
//! recoverable instances to the placement layer and garbage-collects
//! abnormal-node markers.

use crate::core::error::WardenResult;
use crate::meta::keys;
use crate::placement::NodeInfo;
use crate::reconcile::business::{Business, Ctx, Member};
use crate::reconcile::kill;
use crate::reconcile::messages::{
    CancelSchedule, CancelScope, Command, KillRequest, KillResponse, KillTarget, Role,
};
use crate::registry::record::{InstanceRecord, InstanceStatus, KillSignal};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::oneshot;

const NODE_REFRESH_RETRY: Duration = Duration::from_secs(1);

pub struct LeaderBusiness;

impl LeaderBusiness {
    /// Re-query the healthy node list off the control task.
    fn refresh_nodes(ctx: &Ctx) {
        let placement = ctx.placement.clone();
        let tx = ctx.tx.clone();
        tokio::spawn(async move {
            let result = placement.query_nodes().await;
            let _ = tx.send(Command::NodesRefreshed(result)).await;
        });
    }

    /// Decide what happens to one instance whose owner is gone or faulty.
    ///
    /// Drivers and already-exiting records are force-deleted; with runtime
    /// recovery enabled and retry budget left the instance goes back to
    /// SCHEDULING; otherwise it is marked FATAL.
    async fn reconcile_faulty_instance(
        &self,
        ctx: &Ctx,
        member: &mut Member,
        record: &InstanceRecord,
        reason: &str,
    ) {
        if record.status.is_exiting_or_exited() || record.is_driver() {
            tracing::info!(
                instance_id = %record.instance_id,
                status = ?record.status,
                "force deleting instance on faulty node"
            );
            kill::force_delete(ctx, member, record).await;
            return;
        }
        let recoverable = ctx.config.reconcile.runtime_recover_enable
            && record.schedule_times < ctx.config.reconcile.max_schedule_times;
        if recoverable {
            self.resubmit(ctx, member, record, reason).await;
        } else {
            self.mark_fatal(ctx, member, record, reason).await;
        }
    }

    /// Transition a record back to SCHEDULING and hand it to the placement
    /// layer.
    async fn resubmit(&self, ctx: &Ctx, member: &mut Member, record: &InstanceRecord, reason: &str) {
        let mut next = record.clone();
        next.status = InstanceStatus::Scheduling;
        next.schedule_times += 1;
        next.node_id.clear();
        next.agent_id.clear();
        next.reason = reason.to_string();
        let key = member
            .replica
            .key_of(&record.instance_id)
            .map(str::to_string)
            .unwrap_or_else(|| keys::instance_key(&record.function_key, &record.instance_id));
        tracing::info!(
            instance_id = %record.instance_id,
            schedule_times = next.schedule_times,
            reason,
            "re-submitting instance for scheduling"
        );
        if kill::buffered_put(ctx, member, &key, &next).await {
            spawn_schedule(ctx, next);
        }
    }

    async fn mark_fatal(&self, ctx: &Ctx, member: &mut Member, record: &InstanceRecord, reason: &str) {
        let mut next = record.clone();
        next.status = InstanceStatus::Fatal;
        next.reason = reason.to_string();
        next.node_id.clear();
        next.agent_id.clear();
        let key = member
            .replica
            .key_of(&record.instance_id)
            .map(str::to_string)
            .unwrap_or_else(|| keys::instance_key(&record.function_key, &record.instance_id));
        tracing::info!(instance_id = %record.instance_id, reason, "marking instance fatal");
        kill::buffered_put(ctx, member, &key, &next).await;
    }

    /// Kill every live descendant of an instance, once each.
    async fn cascade_kill(
        &self,
        ctx: &Ctx,
        member: &mut Member,
        instance_id: &str,
        signal: KillSignal,
        reason: &str,
    ) {
        for descendant in member.family.descendants_of(instance_id) {
            let Some(record) = member.replica.get(&descendant).cloned() else {
                continue;
            };
            if record.status.is_exiting_or_exited() && member.kills.contains_key(&descendant) {
                continue;
            }
            kill::start_kill(ctx, member, &record, signal, reason, None);
        }
    }

    /// Migrate every instance owned by a faulty node.
    async fn take_over_node(&self, ctx: &Ctx, member: &mut Member, node_id: &str, reason: &str) {
        member.pending_takeovers.remove(node_id);
        let records = member.replica.snapshot_by_node(node_id);
        tracing::info!(node_id, count = records.len(), reason, "taking over node instances");
        for record in records {
            if member.kills.contains_key(&record.instance_id) {
                continue;
            }
            self.reconcile_faulty_instance(ctx, member, &record, reason)
                .await;
        }
    }

    fn parent_missing_or_exiting(&self, member: &Member, record: &InstanceRecord) -> bool {
        if record.is_root() {
            return false;
        }
        let parent = record.parent_id.as_str();
        if member.exiting.contains(parent) {
            return true;
        }
        match member.replica.get(parent) {
            Some(parent_record) => parent_record.status.is_exiting_or_exited(),
            None => !member.family.exists(parent),
        }
    }

    /// Full sweep over the replica after promotion: cascade kills from
    /// FATAL or finished ancestors, reap orphans.
    async fn reconcile_families(&self, ctx: &Ctx, member: &mut Member) {
        for record in member.replica.snapshot() {
            if record.status != InstanceStatus::Fatal {
                continue;
            }
            if record.is_driver_finished() {
                self.cascade_kill(
                    ctx,
                    member,
                    &record.instance_id,
                    KillSignal::Shutdown,
                    &format!("application driver({}) finished", record.instance_id),
                )
                .await;
                kill::force_delete(ctx, member, &record).await;
            } else {
                self.cascade_kill(
                    ctx,
                    member,
                    &record.instance_id,
                    KillSignal::FamilyExit,
                    &format!("ancestor instance({}) is fatal", record.instance_id),
                )
                .await;
            }
        }
        for record in member.replica.snapshot() {
            if record.status.is_exiting_or_exited() || record.status.is_terminal() {
                continue;
            }
            if self.parent_missing_or_exiting(member, &record) {
                kill::start_kill(
                    ctx,
                    member,
                    &record,
                    KillSignal::Shutdown,
                    &format!("parent instance({}) is gone", record.parent_id),
                    None,
                );
            }
        }
    }
}

#[async_trait]
impl Business for LeaderBusiness {
    fn role(&self) -> Role {
        Role::Leader
    }

    async fn on_activated(&self, ctx: &Ctx, member: &mut Member) {
        tracing::info!("promoted to leader");
        member.nodes.clear();
        member.nodes_synced = false;
        member.pending_takeovers = member.abnormal.clone();
        Self::refresh_nodes(ctx);
        self.reconcile_families(ctx, member).await;
    }

    async fn on_instance_put(
        &self,
        ctx: &Ctx,
        member: &mut Member,
        record: InstanceRecord,
        _prev: Option<InstanceRecord>,
    ) {
        // A child appearing while its parent is being killed must go too.
        if !record.is_root()
            && member.exiting.contains(&record.parent_id)
            && !record.status.is_exiting_or_exited()
        {
            kill::start_kill(
                ctx,
                member,
                &record,
                KillSignal::Shutdown,
                &format!("parent instance({}) is being killed", record.parent_id),
                None,
            );
            return;
        }

        if !record.node_id.is_empty() && !record.status.is_terminal() {
            if member.abnormal.contains(&record.node_id) {
                let reason = format!("{} is abnormal", record.node_id);
                self.reconcile_faulty_instance(ctx, member, &record, &reason)
                    .await;
                return;
            }
            if !self.node_exists(member, &record.node_id) {
                let reason = format!("{} is exited", record.node_id);
                self.reconcile_faulty_instance(ctx, member, &record, &reason)
                    .await;
                return;
            }
        }

        if record.status == InstanceStatus::Fatal {
            kill::complete_on_fatal(ctx, member, &record).await;
            if record.is_driver_finished() {
                self.cascade_kill(
                    ctx,
                    member,
                    &record.instance_id,
                    KillSignal::Shutdown,
                    &format!("application driver({}) finished", record.instance_id),
                )
                .await;
                kill::force_delete(ctx, member, &record).await;
            } else {
                self.cascade_kill(
                    ctx,
                    member,
                    &record.instance_id,
                    KillSignal::FamilyExit,
                    &format!("ancestor instance({}) is fatal", record.instance_id),
                )
                .await;
            }
            return;
        }

        if !record.status.is_exiting_or_exited() && self.parent_missing_or_exiting(member, &record)
        {
            kill::start_kill(
                ctx,
                member,
                &record,
                KillSignal::Shutdown,
                &format!("parent instance({}) is gone", record.parent_id),
                None,
            );
        }
    }

    async fn on_instance_delete(
        &self,
        ctx: &Ctx,
        member: &mut Member,
        instance_id: &str,
        _removed: Option<InstanceRecord>,
    ) {
        self.cascade_kill(
            ctx,
            member,
            instance_id,
            KillSignal::FamilyExit,
            &format!("ancestor instance({instance_id}) exited"),
        )
        .await;
        kill::cancel_schedule(
            ctx,
            CancelSchedule::new(instance_id, CancelScope::Parent, "parent instance deleted"),
        );
    }

    async fn on_function_meta_deleted(&self, ctx: &Ctx, member: &mut Member, function_key: &str) {
        let records = member.replica.instances_of_function(function_key);
        tracing::info!(function_key, count = records.len(), "function removed, killing instances");
        for record in records {
            kill::start_kill(
                ctx,
                member,
                &record,
                KillSignal::Shutdown,
                "function removed",
                None,
            );
        }
        kill::cancel_schedule(
            ctx,
            CancelSchedule::new(function_key, CancelScope::Function, "function removed"),
        );
    }

    async fn on_abnormal_marker(
        &self,
        ctx: &Ctx,
        member: &mut Member,
        node_id: &str,
        present: bool,
    ) {
        if !present {
            return;
        }
        ctx.schedule(
            Duration::from_millis(ctx.config.reconcile.abnormal_expiry_ms),
            Command::AbnormalExpired {
                node_id: node_id.to_string(),
            },
        );
        if member.nodes_synced {
            self.take_over_node(ctx, member, node_id, &format!("{node_id} is abnormal"))
                .await;
        } else {
            member.pending_takeovers.insert(node_id.to_string());
        }
    }

    async fn on_node_added(&self, _ctx: &Ctx, member: &mut Member, node: NodeInfo) {
        member.nodes.insert(node.node_id);
    }

    async fn on_node_removed(&self, ctx: &Ctx, member: &mut Member, node_id: &str, force: bool) {
        if !force {
            // Route expiry may race a live heartbeat; trust a fresh node
            // query over the expired key.
            match ctx.placement.query_nodes().await {
                Ok(nodes) => {
                    member.nodes = nodes.into_iter().map(|n| n.node_id).collect();
                    member.nodes_synced = true;
                    if member.nodes.contains(node_id) {
                        tracing::info!(node_id, "node route expired but heartbeat is alive");
                        return;
                    }
                }
                Err(err) => {
                    tracing::warn!(node_id, %err, "node liveness check failed, skipping takeover");
                    return;
                }
            }
        }
        member.nodes.remove(node_id);
        let reason = format!("{node_id} is exited");
        self.take_over_node(ctx, member, node_id, &reason).await;
    }

    async fn on_node_fault(&self, ctx: &Ctx, member: &mut Member, node_id: &str) {
        tracing::warn!(node_id, "local node fault reported");
        let marker_key = keys::abnormal_scheduler_key(node_id);
        let marker = serde_json::json!({ "nodeId": node_id }).to_string();
        match ctx.store.put(&marker_key, &marker, None).await {
            Ok(_) => member.replay.resolve_put(&marker_key),
            Err(err) if err.is_retryable() => {
                tracing::warn!(node_id, %err, "abnormal marker buffered for replay");
                member.replay.record_raw_put(&marker_key, marker);
            }
            Err(err) => tracing::warn!(node_id, %err, "abnormal marker write failed"),
        }
        member.abnormal.insert(node_id.to_string());
        ctx.schedule(
            Duration::from_millis(ctx.config.reconcile.abnormal_expiry_ms),
            Command::AbnormalExpired {
                node_id: node_id.to_string(),
            },
        );
        self.take_over_node(ctx, member, node_id, &format!("{node_id} is abnormal"))
            .await;
    }

    async fn on_nodes_refreshed(
        &self,
        ctx: &Ctx,
        member: &mut Member,
        result: WardenResult<Vec<NodeInfo>>,
    ) {
        let nodes = match result {
            Ok(nodes) => nodes,
            Err(err) => {
                tracing::warn!(%err, "node refresh failed, retrying");
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(NODE_REFRESH_RETRY).await;
                    Self::refresh_nodes(&ctx);
                });
                return;
            }
        };
        member.nodes = nodes.into_iter().map(|n| n.node_id).collect();
        member.nodes_synced = true;
        tracing::info!(count = member.nodes.len(), "node set refreshed");

        let pending: Vec<String> = member.pending_takeovers.drain().collect();
        for node_id in pending {
            self.take_over_node(ctx, member, &node_id, &format!("{node_id} is abnormal"))
                .await;
        }

        // Instances on nodes that vanished while we were not leader.
        for record in member.replica.snapshot() {
            if record.node_id.is_empty()
                || record.status.is_terminal()
                || member.nodes.contains(&record.node_id)
                || member.abnormal.contains(&record.node_id)
                || member.kills.contains_key(&record.instance_id)
            {
                continue;
            }
            let reason = format!("{} is exited", record.node_id);
            self.reconcile_faulty_instance(ctx, member, &record, &reason)
                .await;
        }
    }

    async fn on_schedule_failed(
        &self,
        ctx: &Ctx,
        member: &mut Member,
        instance_id: &str,
        reason: &str,
    ) {
        let Some(record) = member.replica.get(instance_id).cloned() else {
            return;
        };
        if record.status != InstanceStatus::Scheduling {
            return;
        }
        let mut next = record.clone();
        next.status = InstanceStatus::ScheduleFailed;
        next.reason = reason.to_string();
        let key = member
            .replica
            .key_of(instance_id)
            .map(str::to_string)
            .unwrap_or_else(|| keys::instance_key(&record.function_key, instance_id));
        tracing::warn!(instance_id, reason, "marking instance schedule-failed");
        kill::buffered_put(ctx, member, &key, &next).await;
    }

    async fn handle_kill(
        &self,
        ctx: &Ctx,
        member: &mut Member,
        request: KillRequest,
        reply: oneshot::Sender<KillResponse>,
    ) {
        match &request.target {
            KillTarget::Instance(instance_id) => {
                let Some(record) = member.replica.get(instance_id).cloned() else {
                    let _ = reply.send(KillResponse::not_found(
                        &request.request_id,
                        format!("instance {instance_id} not found"),
                    ));
                    return;
                };
                if record.status == InstanceStatus::Fatal {
                    kill::force_delete(ctx, member, &record).await;
                    let _ = reply.send(KillResponse::ok(&request.request_id));
                    return;
                }
                kill::start_kill(
                    ctx,
                    member,
                    &record,
                    request.signal,
                    &request.reason,
                    Some(reply),
                );
            }
            KillTarget::Job(job_id) => {
                let records = member.replica.instances_of_job(job_id);
                if records.is_empty() {
                    let _ = reply.send(KillResponse::not_found(
                        &request.request_id,
                        format!("job {job_id} not found"),
                    ));
                    return;
                }
                tracing::info!(job_id, count = records.len(), "job kill requested");
                for record in records {
                    if record.detached {
                        continue;
                    }
                    kill::start_kill(ctx, member, &record, request.signal, &request.reason, None);
                }
                kill::cancel_schedule(
                    ctx,
                    CancelSchedule::new(job_id.clone(), CancelScope::Job, &request.reason),
                );
                let _ = reply.send(KillResponse::ok(&request.request_id));
            }
        }
    }

    async fn handle_cancel(&self, ctx: &Ctx, _member: &mut Member, request: CancelSchedule) {
        kill::cancel_schedule(ctx, request);
    }

    async fn query_instances(&self, _ctx: &Ctx, member: &mut Member) -> Vec<InstanceRecord> {
        member.replica.snapshot()
    }

    async fn query_debug_instances(&self, _ctx: &Ctx, member: &mut Member) -> Vec<InstanceRecord> {
        member.debug_instances.values().cloned().collect()
    }

    async fn on_kill_retry(&self, ctx: &Ctx, member: &mut Member, instance_id: &str) {
        kill::on_retry(ctx, member, instance_id).await;
    }

    async fn on_kill_delivery(
        &self,
        ctx: &Ctx,
        member: &mut Member,
        instance_id: &str,
        request_id: &str,
        result: WardenResult<KillResponse>,
    ) {
        kill::on_delivery(ctx, member, instance_id, request_id, result).await;
    }

    async fn on_abnormal_expired(&self, ctx: &Ctx, member: &mut Member, node_id: &str) {
        if !member.abnormal.contains(node_id) {
            return;
        }
        tracing::info!(node_id, "abnormal marker expired, collecting keys");
        member.abnormal.remove(node_id);
        member.pending_takeovers.remove(node_id);
        let marker_key = keys::abnormal_scheduler_key(node_id);
        let route_key = keys::node_route_key(node_id);
        for key in [marker_key, route_key] {
            match ctx.store.delete(&key, None).await {
                Ok(()) => member.replay.resolve_delete(&key),
                Err(err) if err.is_retryable() => {
                    tracing::warn!(key, %err, "marker delete buffered for replay");
                    member.replay.record_delete(&key);
                }
                Err(err) => tracing::warn!(key, %err, "marker delete failed"),
            }
        }
    }

    fn node_exists(&self, member: &Member, node_id: &str) -> bool {
        !member.nodes_synced || member.nodes.contains(node_id)
    }
}

const SCHEDULE_DISPATCH_ATTEMPTS: usize = 3;
const SCHEDULE_DISPATCH_BACKOFF: Duration = Duration::from_millis(200);

/// Hand a record to the placement layer off the control task. Exhausting
/// the retry budget reports back so the record can be marked terminal.
pub(crate) fn spawn_schedule(ctx: &Ctx, record: InstanceRecord) {
    let placement = ctx.placement.clone();
    let tx = ctx.tx.clone();
    tokio::spawn(async move {
        let mut last_err = None;
        for _ in 0..SCHEDULE_DISPATCH_ATTEMPTS {
            match placement.schedule(&record).await {
                Ok(()) => return,
                Err(err) => {
                    tracing::warn!(
                        instance_id = %record.instance_id,
                        %err,
                        "re-submission to placement failed"
                    );
                    last_err = Some(err);
                }
            }
            tokio::time::sleep(SCHEDULE_DISPATCH_BACKOFF).await;
        }
        let Some(err) = last_err else { return };
        let _ = tx
            .send(Command::ScheduleDispatchFailed {
                instance_id: record.instance_id.clone(),
                reason: err.to_string(),
            })
            .await;
    });
}
