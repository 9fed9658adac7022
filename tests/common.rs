//! Shared test harness: an embedded store, a scripted placement layer and
//! a running control plane with fast timers.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use warden::core::config::{Config, MetaStoreConfig, NodeConfig, ReconcileConfig, SyncConfig};
use warden::core::error::{WardenError, WardenResult};
use warden::core::runtime::Warden;
use warden::meta::keys;
use warden::meta::memory::MemoryStore;
use warden::meta::store::MetaStore;
use warden::placement::{NodeInfo, PlacementLayer};
use warden::reconcile::messages::{
    CancelSchedule, KillCode, KillRequest, KillResponse, KillTarget, Role,
};
use warden::registry::record::{InstanceRecord, InstanceStatus};

/// Placement double that records every interaction.
#[derive(Default)]
pub struct MockPlacement {
    pub nodes: Mutex<Vec<NodeInfo>>,
    pub kills: Mutex<Vec<KillRequest>>,
    pub cancels: Mutex<Vec<CancelSchedule>>,
    pub scheduled: Mutex<Vec<InstanceRecord>>,
    kill_codes: Mutex<HashMap<String, KillCode>>,
    schedule_fails: Mutex<bool>,
}

impl MockPlacement {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_node(&self, node_id: &str) {
        self.nodes.lock().unwrap().push(NodeInfo {
            node_id: node_id.to_string(),
            address: format!("{node_id}:7000"),
        });
    }

    pub fn remove_node(&self, node_id: &str) {
        self.nodes.lock().unwrap().retain(|n| n.node_id != node_id);
    }

    /// Script the response code for kills targeting one instance.
    pub fn set_kill_code(&self, instance_id: &str, code: KillCode) {
        self.kill_codes
            .lock()
            .unwrap()
            .insert(instance_id.to_string(), code);
    }

    /// Number of kill requests seen for an instance.
    pub fn kills_for(&self, instance_id: &str) -> Vec<KillRequest> {
        self.kills
            .lock()
            .unwrap()
            .iter()
            .filter(|k| matches!(&k.target, KillTarget::Instance(id) if id == instance_id))
            .cloned()
            .collect()
    }

    /// Make every schedule hand-off fail as placement-unreachable.
    pub fn set_schedule_fails(&self, fails: bool) {
        *self.schedule_fails.lock().unwrap() = fails;
    }

    pub fn scheduled_count(&self, instance_id: &str) -> usize {
        self.scheduled
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.instance_id == instance_id)
            .count()
    }
}

#[async_trait]
impl PlacementLayer for MockPlacement {
    async fn query_nodes(&self) -> WardenResult<Vec<NodeInfo>> {
        Ok(self.nodes.lock().unwrap().clone())
    }

    async fn node_address(&self, node_id: &str) -> WardenResult<String> {
        self.nodes
            .lock()
            .unwrap()
            .iter()
            .find(|n| n.node_id == node_id)
            .map(|n| n.address.clone())
            .ok_or_else(|| WardenError::not_found(node_id))
    }

    async fn leader_address(&self) -> WardenResult<String> {
        Ok("leader:7000".to_string())
    }

    async fn schedule(&self, record: &InstanceRecord) -> WardenResult<()> {
        if *self.schedule_fails.lock().unwrap() {
            return Err(WardenError::PlacementUnavailable {
                message: "scheduler down".to_string(),
            });
        }
        self.scheduled.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn send_kill(&self, _address: &str, request: &KillRequest) -> WardenResult<KillResponse> {
        self.kills.lock().unwrap().push(request.clone());
        let code = match &request.target {
            KillTarget::Instance(id) => self
                .kill_codes
                .lock()
                .unwrap()
                .get(id)
                .copied()
                .unwrap_or(KillCode::Ok),
            KillTarget::Job(_) => KillCode::Ok,
        };
        Ok(KillResponse {
            request_id: request.request_id.clone(),
            code,
            message: String::new(),
        })
    }

    async fn send_cancel(&self, _address: &str, request: &CancelSchedule) -> WardenResult<()> {
        self.cancels.lock().unwrap().push(request.clone());
        Ok(())
    }

    async fn forward_query_instances(&self, _address: &str) -> WardenResult<Vec<InstanceRecord>> {
        Err(WardenError::PlacementUnavailable {
            message: "no leader in test".to_string(),
        })
    }

    async fn forward_query_debug_instances(
        &self,
        _address: &str,
    ) -> WardenResult<Vec<InstanceRecord>> {
        Err(WardenError::PlacementUnavailable {
            message: "no leader in test".to_string(),
        })
    }
}

/// Configuration with timers shrunk for tests. The resync timer is pushed
/// out of the way; tests trigger resyncs explicitly.
pub fn test_config() -> Config {
    Config {
        node: NodeConfig {
            node_id: "warden-0".to_string(),
            advertise_addr: "warden-0:7000".to_string(),
        },
        meta_store: MetaStoreConfig {
            endpoints: Vec::new(),
            watch_timeout_ms: 2_000,
        },
        reconcile: ReconcileConfig {
            runtime_recover_enable: false,
            // Retries are covered by dedicated tests; keep the timer out of
            // the way so send counts stay deterministic.
            kill_retry_interval_ms: 60_000,
            cancel_timeout_ms: 50,
            abnormal_expiry_ms: 600_000,
            max_schedule_times: 3,
        },
        sync: SyncConfig {
            sync_interval_ms: 3_600_000,
        },
    }
}

pub struct Harness {
    pub store: MemoryStore,
    pub placement: Arc<MockPlacement>,
    pub warden: Warden,
}

impl Harness {
    pub async fn start(config: Config) -> Self {
        let store = MemoryStore::new();
        let placement = MockPlacement::new();
        let warden = Warden::start(config, Arc::new(store.clone()), placement.clone());
        let harness = Self {
            store,
            placement,
            warden,
        };
        // Let bootstrap finish before the test mutates anything.
        tokio::time::sleep(Duration::from_millis(50)).await;
        harness
    }

    pub async fn promote(&self) {
        self.warden.set_role(Role::Leader).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    /// Write a record and wait for the replica to pick it up.
    pub async fn put_record(&self, record: &InstanceRecord) -> String {
        let key = keys::instance_key(&record.function_key, &record.instance_id);
        self.store
            .put(&key, &record.encode().unwrap(), None)
            .await
            .unwrap();
        key
    }

    pub async fn delete_record(&self, record: &InstanceRecord) {
        let key = keys::instance_key(&record.function_key, &record.instance_id);
        self.store.delete(&key, None).await.unwrap();
    }

    pub async fn stored_record(&self, record: &InstanceRecord) -> Option<InstanceRecord> {
        let key = keys::instance_key(&record.function_key, &record.instance_id);
        let kv = self.store.get(&key).await.unwrap()?;
        Some(InstanceRecord::decode(&kv.key, &kv.value).unwrap())
    }
}

/// Minimal record builder.
pub fn record(instance_id: &str, parent_id: &str, node_id: &str) -> InstanceRecord {
    InstanceRecord {
        instance_id: instance_id.to_string(),
        parent_id: parent_id.to_string(),
        node_id: node_id.to_string(),
        agent_id: format!("{node_id}-agent"),
        job_id: "job-1".to_string(),
        function_key: "tenant0/echo".to_string(),
        status: InstanceStatus::Running,
        ..Default::default()
    }
}

/// Poll a condition until it holds or two seconds pass.
pub async fn eventually<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within deadline");
}

/// Poll an async condition until it holds or two seconds pass.
pub async fn eventually_async<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within deadline");
}
