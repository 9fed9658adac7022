//! Follower-side reconciliation.
//!
//! Followers keep their replica and family view warm but never mutate
//! global state. Kill and query requests are forwarded to the leader;
//! everything else is a no-op until promotion.

use crate::core::error::WardenResult;
use crate::placement::NodeInfo;
use crate::reconcile::business::{Business, Ctx, Member};
use crate::reconcile::kill;
use crate::reconcile::messages::{
    CancelSchedule, KillRequest, KillResponse, Role,
};
use crate::registry::record::InstanceRecord;
use async_trait::async_trait;
use tokio::sync::oneshot;

pub struct FollowerBusiness;

#[async_trait]
impl Business for FollowerBusiness {
    fn role(&self) -> Role {
        Role::Follower
    }

    async fn on_activated(&self, _ctx: &Ctx, member: &mut Member) {
        tracing::info!("running as follower");
        member.nodes.clear();
        member.nodes_synced = false;
    }

    async fn on_instance_put(
        &self,
        _ctx: &Ctx,
        _member: &mut Member,
        _record: InstanceRecord,
        _prev: Option<InstanceRecord>,
    ) {
    }

    async fn on_instance_delete(
        &self,
        _ctx: &Ctx,
        _member: &mut Member,
        _instance_id: &str,
        _removed: Option<InstanceRecord>,
    ) {
    }

    async fn on_function_meta_deleted(&self, _ctx: &Ctx, _member: &mut Member, _function_key: &str) {
    }

    async fn on_abnormal_marker(
        &self,
        _ctx: &Ctx,
        member: &mut Member,
        node_id: &str,
        present: bool,
    ) {
        // Remembered for replay when this replica is promoted.
        if present {
            member.pending_takeovers.insert(node_id.to_string());
        }
    }

    async fn on_node_added(&self, _ctx: &Ctx, member: &mut Member, node: NodeInfo) {
        member.nodes.insert(node.node_id);
    }

    async fn on_node_removed(&self, _ctx: &Ctx, member: &mut Member, node_id: &str, _force: bool) {
        member.nodes.remove(node_id);
    }

    async fn on_node_fault(&self, _ctx: &Ctx, member: &mut Member, node_id: &str) {
        tracing::warn!(node_id, "node fault reported to follower, deferring to leader");
        member.pending_takeovers.insert(node_id.to_string());
    }

    async fn on_nodes_refreshed(
        &self,
        _ctx: &Ctx,
        member: &mut Member,
        result: WardenResult<Vec<NodeInfo>>,
    ) {
        if let Ok(nodes) = result {
            member.nodes = nodes.into_iter().map(|n| n.node_id).collect();
        }
    }

    async fn on_schedule_failed(
        &self,
        _ctx: &Ctx,
        _member: &mut Member,
        _instance_id: &str,
        _reason: &str,
    ) {
    }

    async fn handle_kill(
        &self,
        ctx: &Ctx,
        _member: &mut Member,
        request: KillRequest,
        reply: oneshot::Sender<KillResponse>,
    ) {
        // Forwarded off the control task; the response relays straight to
        // the caller.
        let placement = ctx.placement.clone();
        tokio::spawn(async move {
            let result = async {
                let address = placement.leader_address().await?;
                placement.send_kill(&address, &request).await
            }
            .await;
            let response = match result {
                Ok(response) => response,
                Err(err) => KillResponse::error(&request.request_id, err.to_string()),
            };
            let _ = reply.send(response);
        });
    }

    async fn handle_cancel(&self, ctx: &Ctx, _member: &mut Member, request: CancelSchedule) {
        kill::cancel_schedule(ctx, request);
    }

    async fn query_instances(&self, ctx: &Ctx, member: &mut Member) -> Vec<InstanceRecord> {
        let forwarded = async {
            let address = ctx.placement.leader_address().await?;
            ctx.placement.forward_query_instances(&address).await
        }
        .await;
        match forwarded {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!(%err, "query forward failed, answering from local replica");
                member.replica.snapshot()
            }
        }
    }

    async fn query_debug_instances(&self, ctx: &Ctx, member: &mut Member) -> Vec<InstanceRecord> {
        let forwarded = async {
            let address = ctx.placement.leader_address().await?;
            ctx.placement.forward_query_debug_instances(&address).await
        }
        .await;
        match forwarded {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!(%err, "debug query forward failed, answering locally");
                member.debug_instances.values().cloned().collect()
            }
        }
    }

    async fn on_kill_retry(&self, _ctx: &Ctx, _member: &mut Member, _instance_id: &str) {}

    async fn on_kill_delivery(
        &self,
        _ctx: &Ctx,
        _member: &mut Member,
        _instance_id: &str,
        _request_id: &str,
        _result: WardenResult<KillResponse>,
    ) {
    }

    async fn on_abnormal_expired(&self, _ctx: &Ctx, _member: &mut Member, _node_id: &str) {}

    fn node_exists(&self, _member: &Member, _node_id: &str) -> bool {
        true
    }
}
