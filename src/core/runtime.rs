//! Component wiring and the public handle.
//!
//! `Warden::start` spawns the control task, the sync engine and the
//! resync timer, and returns a cloneable handle whose methods are async
//! requests into the serialized control loop.

use crate::core::config::Config;
use crate::core::error::{WardenError, WardenResult};
use crate::meta::store::MetaStore;
use crate::placement::{NodeInfo, PlacementLayer};
use crate::reconcile::business::{ControlTask, Ctx};
use crate::reconcile::messages::{
    CancelSchedule, Command, KillRequest, KillResponse, Role,
};
use crate::registry::record::InstanceRecord;
use crate::sync::engine::SyncEngine;
use crate::sync::syncer;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

const COMMAND_QUEUE_DEPTH: usize = 256;

/// Handle to a running warden control plane.
#[derive(Clone)]
pub struct Warden {
    tx: mpsc::Sender<Command>,
}

impl Warden {
    /// Start all components. The returned handle is the only way in; the
    /// control plane stops when [`Warden::shutdown`] is called or the sync
    /// engine hits a fatal watch failure.
    pub fn start(
        config: Config,
        store: Arc<dyn MetaStore>,
        placement: Arc<dyn PlacementLayer>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let ctx = Ctx {
            store: store.clone(),
            placement,
            tx: tx.clone(),
            config: config.clone(),
        };
        tokio::spawn(ControlTask::new(ctx).run(rx));

        let engine = SyncEngine::new(store, tx.clone(), config.meta_store.watch_timeout_ms);
        let engine_tx = tx.clone();
        tokio::spawn(async move {
            if let Err(err) = engine.run().await {
                tracing::error!(%err, "sync engine failed, stopping control plane");
                let _ = engine_tx.send(Command::Shutdown).await;
            }
        });

        syncer::spawn_timer(tx.clone(), config.sync.sync_interval_ms);

        Self { tx }
    }

    /// Apply a leadership notification.
    pub async fn set_role(&self, role: Role) -> WardenResult<()> {
        self.send(Command::RoleChanged(role)).await
    }

    /// Kill an instance or a job; resolves when the kill converged.
    pub async fn kill(&self, request: KillRequest) -> WardenResult<KillResponse> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Kill { request, reply }).await?;
        rx.await.map_err(|_| WardenError::ControlStopped)
    }

    /// Snapshot of all known instance records.
    pub async fn query_instances(&self) -> WardenResult<Vec<InstanceRecord>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::QueryInstances { reply }).await?;
        rx.await.map_err(|_| WardenError::ControlStopped)
    }

    /// Snapshot of all known debug instances.
    pub async fn query_debug_instances(&self) -> WardenResult<Vec<InstanceRecord>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::QueryDebugInstances { reply }).await?;
        rx.await.map_err(|_| WardenError::ControlStopped)
    }

    /// Best-effort cancellation of in-flight scheduling work.
    pub async fn cancel_schedule(&self, request: CancelSchedule) -> WardenResult<()> {
        self.send(Command::CancelSchedule { request }).await
    }

    /// Report a fault on a local node. Resolves once every affected record
    /// has been transitioned (or its write parked for replay); signal
    /// deliveries and re-submissions settle asynchronously.
    pub async fn node_fault(&self, node_id: &str) -> WardenResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::NodeFault {
            node_id: node_id.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| WardenError::ControlStopped)
    }

    /// Placement callback: a node joined.
    pub async fn node_added(&self, node: NodeInfo) -> WardenResult<()> {
        self.send(Command::NodeAdded(node)).await
    }

    /// Placement callback: a node left. Without `force` the takeover only
    /// happens if a fresh node query confirms the node is gone.
    pub async fn node_removed(&self, node_id: &str, force: bool) -> WardenResult<()> {
        self.send(Command::NodeRemoved {
            node_id: node_id.to_string(),
            force,
        })
        .await
    }

    /// Whether a node is currently marked abnormal.
    pub async fn check_node_abnormal(&self, node_id: &str) -> WardenResult<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::CheckNodeAbnormal {
            node_id: node_id.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| WardenError::ControlStopped)
    }

    /// Suspend or resume fault handling for a system upgrade window.
    pub async fn set_upgrade_window(&self, on: bool) -> WardenResult<()> {
        self.send(Command::SetUpgradeWindow(on)).await
    }

    /// Force a full resync cycle out of schedule.
    pub async fn trigger_resync(&self) -> WardenResult<()> {
        self.send(Command::Resync).await
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }

    async fn send(&self, command: Command) -> WardenResult<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| WardenError::ControlStopped)
    }
}
