//! Role-dependent reconciliation behavior and the control task.
//!
//! All registry state lives in [`Member`] and is owned by a single control
//! task; leader/follower behavior is a [`Business`] trait object swapped in
//! place when the leadership notification flips. Store and placement I/O
//! runs in spawned tasks whose outcomes re-enter through the command queue,
//! so no state is ever touched concurrently.

use crate::core::config::Config;
use crate::core::error::WardenResult;
use crate::meta::replay::OperationReplayBuffer;
use crate::meta::store::MetaStore;
use crate::placement::{NodeInfo, PlacementLayer};
use crate::reconcile::follower::FollowerBusiness;
use crate::reconcile::kill;
use crate::reconcile::leader::LeaderBusiness;
use crate::reconcile::messages::{
    CancelSchedule, Command, KillRequest, KillResponse, RegistryEvent, Role,
};
use crate::registry::family::FamilyTracker;
use crate::registry::record::{InstanceRecord, KillSignal};
use crate::registry::replica::InstanceRegistryReplica;
use crate::sync::engine::RevisionGate;
use crate::sync::syncer;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// An in-flight kill for one instance.
#[derive(Debug)]
pub struct KillTicket {
    pub request_id: String,
    pub signal: KillSignal,
    pub reason: String,
    pub waiters: Vec<oneshot::Sender<KillResponse>>,
}

/// All mutable reconciliation state, owned exclusively by the control task.
#[derive(Default)]
pub struct Member {
    pub replica: InstanceRegistryReplica,
    pub family: FamilyTracker,
    pub gate: RevisionGate,
    /// Known-healthy nodes from the placement layer.
    pub nodes: HashSet<String>,
    /// False until the first node refresh after promotion completes;
    /// while false every node is presumed alive.
    pub nodes_synced: bool,
    /// Nodes marked faulty via `abnormalSchedulers/` markers.
    pub abnormal: HashSet<String>,
    /// Abnormal nodes whose instances have not been taken over yet.
    pub pending_takeovers: HashSet<String>,
    pub replay: OperationReplayBuffer,
    /// Instances with a kill in flight; a child put while its parent sits
    /// here is killed as well.
    pub exiting: HashSet<String>,
    pub kills: HashMap<String, KillTicket>,
    /// Snapshot map fed from the `debugInstances/` prefix.
    pub debug_instances: HashMap<String, InstanceRecord>,
    /// Function keys with a live `functionMeta/` entry, so a resync can
    /// tell a removed function from one that never had meta.
    pub function_meta: HashSet<String>,
    /// Store revision of the last completed resync pass; fence entries for
    /// instances deleted before it are safe to age out.
    pub resync_floor: i64,
    /// While set, node-fault handling is suspended.
    pub upgrade_window: bool,
}

/// Immutable handles shared by every reconciliation operation.
#[derive(Clone)]
pub struct Ctx {
    pub store: Arc<dyn MetaStore>,
    pub placement: Arc<dyn PlacementLayer>,
    pub tx: mpsc::Sender<Command>,
    pub config: Config,
}

impl Ctx {
    pub fn node_id(&self) -> &str {
        &self.config.node.node_id
    }

    /// Deliver a command back to the control task after a delay. Timers are
    /// just delayed messages.
    pub fn schedule(&self, delay: Duration, command: Command) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(command).await;
        });
    }
}

/// Role-specific reconciliation behavior. The control task applies replica
/// and family updates itself; these hooks run afterwards with the new state
/// already visible.
#[async_trait]
pub trait Business: Send {
    fn role(&self) -> Role;

    /// Called once when this business becomes active.
    async fn on_activated(&self, ctx: &Ctx, member: &mut Member);

    async fn on_instance_put(
        &self,
        ctx: &Ctx,
        member: &mut Member,
        record: InstanceRecord,
        prev: Option<InstanceRecord>,
    );

    async fn on_instance_delete(
        &self,
        ctx: &Ctx,
        member: &mut Member,
        instance_id: &str,
        removed: Option<InstanceRecord>,
    );

    async fn on_function_meta_deleted(&self, ctx: &Ctx, member: &mut Member, function_key: &str);

    async fn on_abnormal_marker(
        &self,
        ctx: &Ctx,
        member: &mut Member,
        node_id: &str,
        present: bool,
    );

    async fn on_node_added(&self, ctx: &Ctx, member: &mut Member, node: NodeInfo);

    async fn on_node_removed(&self, ctx: &Ctx, member: &mut Member, node_id: &str, force: bool);

    /// Local-node fault callback. Returns once every affected record has
    /// been transitioned (or its write parked for replay); signal
    /// deliveries and re-submissions settle asynchronously.
    async fn on_node_fault(&self, ctx: &Ctx, member: &mut Member, node_id: &str);

    async fn on_nodes_refreshed(
        &self,
        ctx: &Ctx,
        member: &mut Member,
        result: WardenResult<Vec<NodeInfo>>,
    );

    /// Re-submission to the placement layer gave up on an instance.
    async fn on_schedule_failed(
        &self,
        ctx: &Ctx,
        member: &mut Member,
        instance_id: &str,
        reason: &str,
    );

    async fn handle_kill(
        &self,
        ctx: &Ctx,
        member: &mut Member,
        request: KillRequest,
        reply: oneshot::Sender<KillResponse>,
    );

    async fn handle_cancel(&self, ctx: &Ctx, member: &mut Member, request: CancelSchedule);

    async fn query_instances(&self, ctx: &Ctx, member: &mut Member) -> Vec<InstanceRecord>;

    async fn query_debug_instances(&self, ctx: &Ctx, member: &mut Member) -> Vec<InstanceRecord>;

    async fn on_kill_retry(&self, ctx: &Ctx, member: &mut Member, instance_id: &str);

    async fn on_kill_delivery(
        &self,
        ctx: &Ctx,
        member: &mut Member,
        instance_id: &str,
        request_id: &str,
        result: WardenResult<KillResponse>,
    );

    async fn on_abnormal_expired(&self, ctx: &Ctx, member: &mut Member, node_id: &str);

    /// Whether a node is believed alive. Followers always answer yes.
    fn node_exists(&self, member: &Member, node_id: &str) -> bool;
}

/// The control task: one serialized loop over [`Command`]s.
pub struct ControlTask {
    ctx: Ctx,
    member: Member,
    business: Box<dyn Business>,
}

impl ControlTask {
    /// Start as follower; leadership arrives as a notification.
    pub fn new(ctx: Ctx) -> Self {
        Self {
            ctx,
            member: Member::default(),
            business: Box::new(FollowerBusiness),
        }
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(command) = rx.recv().await {
            if !self.dispatch(command).await {
                break;
            }
        }
        tracing::info!("control task stopped");
    }

    async fn dispatch(&mut self, command: Command) -> bool {
        let ctx = self.ctx.clone();
        match command {
            Command::Events(events) => self.apply_events(&ctx, events).await,
            Command::Resync => {
                if let Some(events) = syncer::resync(&ctx, &mut self.member).await {
                    self.apply_events(&ctx, events).await;
                    syncer::replay(&ctx, &mut self.member).await;
                }
            }
            Command::RoleChanged(role) => self.switch_role(&ctx, role).await,
            Command::Kill { request, reply } => {
                self.business
                    .handle_kill(&ctx, &mut self.member, request, reply)
                    .await;
            }
            Command::QueryInstances { reply } => {
                let records = self.business.query_instances(&ctx, &mut self.member).await;
                let _ = reply.send(records);
            }
            Command::QueryDebugInstances { reply } => {
                let records = self
                    .business
                    .query_debug_instances(&ctx, &mut self.member)
                    .await;
                let _ = reply.send(records);
            }
            Command::CancelSchedule { request } => {
                self.business
                    .handle_cancel(&ctx, &mut self.member, request)
                    .await;
            }
            Command::NodeFault { node_id, reply } => {
                if self.member.upgrade_window {
                    tracing::warn!(node_id, "upgrade window active, fault handling suspended");
                } else {
                    self.business
                        .on_node_fault(&ctx, &mut self.member, &node_id)
                        .await;
                }
                let _ = reply.send(());
            }
            Command::NodeAdded(node) => {
                self.business
                    .on_node_added(&ctx, &mut self.member, node)
                    .await;
            }
            Command::NodeRemoved { node_id, force } => {
                self.business
                    .on_node_removed(&ctx, &mut self.member, &node_id, force)
                    .await;
            }
            Command::NodesRefreshed(result) => {
                self.business
                    .on_nodes_refreshed(&ctx, &mut self.member, result)
                    .await;
            }
            Command::CheckNodeAbnormal { node_id, reply } => {
                let _ = reply.send(self.member.abnormal.contains(&node_id));
            }
            Command::ScheduleDispatchFailed { instance_id, reason } => {
                self.business
                    .on_schedule_failed(&ctx, &mut self.member, &instance_id, &reason)
                    .await;
            }
            Command::KillRetryTick { instance_id } => {
                self.business
                    .on_kill_retry(&ctx, &mut self.member, &instance_id)
                    .await;
            }
            Command::KillDelivery {
                instance_id,
                request_id,
                result,
            } => {
                self.business
                    .on_kill_delivery(&ctx, &mut self.member, &instance_id, &request_id, result)
                    .await;
            }
            Command::AbnormalExpired { node_id } => {
                self.business
                    .on_abnormal_expired(&ctx, &mut self.member, &node_id)
                    .await;
            }
            Command::SetUpgradeWindow(on) => {
                tracing::info!(on, "upgrade window toggled");
                self.member.upgrade_window = on;
            }
            Command::Shutdown => return false,
        }
        true
    }

    /// Apply a batch of gated registry events, then run the role hooks.
    ///
    /// Family edges for every PUT in the batch are registered first so an
    /// unordered snapshot or batch cannot make a child look orphaned while
    /// its parent sits later in the same batch.
    async fn apply_events(&mut self, ctx: &Ctx, events: Vec<RegistryEvent>) {
        let mut admitted = Vec::with_capacity(events.len());
        for event in events {
            match event {
                RegistryEvent::InstancePut { key, record, prev } => {
                    if !self
                        .member
                        .gate
                        .admit(&record.instance_id, record.mod_revision)
                    {
                        tracing::debug!(
                            instance_id = %record.instance_id,
                            revision = record.mod_revision,
                            "stale put discarded"
                        );
                        continue;
                    }
                    self.member
                        .family
                        .add_or_update(&record.instance_id, &record.parent_id);
                    admitted.push(RegistryEvent::InstancePut { key, record, prev });
                }
                RegistryEvent::InstanceDelete {
                    key,
                    instance_id,
                    revision,
                } => {
                    if !self.member.gate.admit(&instance_id, revision) {
                        tracing::debug!(instance_id, revision, "stale delete discarded");
                        continue;
                    }
                    admitted.push(RegistryEvent::InstanceDelete {
                        key,
                        instance_id,
                        revision,
                    });
                }
                other => admitted.push(other),
            }
        }

        for event in admitted {
            match event {
                RegistryEvent::InstancePut { key, record, prev } => {
                    let local_prev = self.member.replica.apply_put(&key, record.clone());
                    let prev = prev.or(local_prev);
                    self.business
                        .on_instance_put(ctx, &mut self.member, record, prev)
                        .await;
                }
                RegistryEvent::InstanceDelete {
                    key, instance_id, ..
                } => {
                    let removed = self.member.replica.remove_by_key(&key);
                    if removed.is_none() {
                        tracing::warn!(instance_id, key, "delete for unknown instance ignored");
                    }
                    self.member.family.remove(&instance_id);
                    kill::complete_on_delete(&mut self.member, &instance_id);
                    self.business
                        .on_instance_delete(ctx, &mut self.member, &instance_id, removed)
                        .await;
                }
                RegistryEvent::FunctionMetaPut { function_key } => {
                    self.member.function_meta.insert(function_key);
                }
                RegistryEvent::FunctionMetaDeleted { function_key } => {
                    self.member.function_meta.remove(&function_key);
                    self.business
                        .on_function_meta_deleted(ctx, &mut self.member, &function_key)
                        .await;
                }
                RegistryEvent::AbnormalMarker { node_id, present } => {
                    if present {
                        self.member.abnormal.insert(node_id.clone());
                    } else {
                        self.member.abnormal.remove(&node_id);
                        self.member.pending_takeovers.remove(&node_id);
                    }
                    self.business
                        .on_abnormal_marker(ctx, &mut self.member, &node_id, present)
                        .await;
                }
                RegistryEvent::NodeRouteAdded { node_id } => {
                    let node = NodeInfo {
                        node_id,
                        address: String::new(),
                    };
                    self.business
                        .on_node_added(ctx, &mut self.member, node)
                        .await;
                }
                RegistryEvent::NodeRouteRemoved { node_id } => {
                    self.business
                        .on_node_removed(ctx, &mut self.member, &node_id, false)
                        .await;
                }
                RegistryEvent::DebugInstancePut { record } => {
                    self.member
                        .debug_instances
                        .insert(record.instance_id.clone(), record);
                }
                RegistryEvent::DebugInstanceDeleted { instance_id } => {
                    self.member.debug_instances.remove(&instance_id);
                }
            }
        }
    }

    async fn switch_role(&mut self, ctx: &Ctx, role: Role) {
        if self.business.role() == role {
            return;
        }
        tracing::info!(?role, "role changed");
        // Outstanding kill waiters were issued under the old role; fail
        // them so callers re-send against the new topology.
        for (_, ticket) in self.member.kills.drain() {
            for waiter in ticket.waiters {
                let _ = waiter.send(KillResponse::error(
                    &ticket.request_id,
                    "leadership changed",
                ));
            }
        }
        self.member.exiting.clear();
        self.business = match role {
            Role::Leader => Box::new(LeaderBusiness),
            Role::Follower => Box::new(FollowerBusiness),
        };
        self.business.on_activated(ctx, &mut self.member).await;
    }
}
