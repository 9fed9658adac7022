//! Watch-based replication of the metadata store into local state.
//!
//! Bootstrap takes a consistent snapshot, feeds it to the control task as
//! synthetic PUTs, then registers watches starting one past the snapshot
//! revision so no event is missed or double-applied. Watch registration is
//! retried under a hard budget; exhausting it is fatal because operating on
//! a stale view would silently break revision ordering.

use crate::core::error::{WardenError, WardenResult};
use crate::meta::keys;
use crate::meta::store::{EventType, KeyValue, MetaStore, WatchEvent, WatchOptions};
use crate::reconcile::messages::{Command, RegistryEvent};
use crate::registry::record::InstanceRecord;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;

/// Per-instance revision fence. Retains tombstone revisions so a stale PUT
/// arriving after a DELETE is still rejected.
#[derive(Debug, Default)]
pub struct RevisionGate {
    last: HashMap<String, i64>,
}

impl RevisionGate {
    /// Admit an event only if its revision is strictly newer than the last
    /// applied one for this instance. Admission records the revision.
    pub fn admit(&mut self, instance_id: &str, revision: i64) -> bool {
        match self.last.get_mut(instance_id) {
            Some(last) if *last >= revision => false,
            Some(last) => {
                *last = revision;
                true
            }
            None => {
                self.last.insert(instance_id.to_string(), revision);
                true
            }
        }
    }

    /// Last applied revision for an instance, if any.
    pub fn last(&self, instance_id: &str) -> Option<i64> {
        self.last.get(instance_id).copied()
    }

    /// Drop entries for instances that are gone and whose last revision is
    /// older than `floor`. Tombstones newer than the floor are kept so late
    /// deliveries from a reconnect are still fenced.
    pub fn prune(&mut self, floor: i64, keep: impl Fn(&str) -> bool) {
        self.last.retain(|id, rev| *rev >= floor || keep(id));
    }
}

/// Watched prefixes and how their events map into registry events.
#[derive(Debug, Clone, Copy)]
enum PrefixKind {
    Instances,
    FunctionMeta,
    AbnormalSchedulers,
    NodeRoutes,
    DebugInstances,
}

impl PrefixKind {
    fn prefix(self) -> &'static str {
        match self {
            Self::Instances => keys::INSTANCE_PREFIX,
            Self::FunctionMeta => keys::FUNCTION_META_PREFIX,
            Self::AbnormalSchedulers => keys::ABNORMAL_SCHEDULER_PREFIX,
            Self::NodeRoutes => keys::NODE_ROUTE_PREFIX,
            Self::DebugInstances => keys::DEBUG_INSTANCE_PREFIX,
        }
    }
}

/// Replicates watched prefixes into the control task's command queue.
pub struct SyncEngine {
    store: Arc<dyn MetaStore>,
    tx: mpsc::Sender<Command>,
    watch_timeout: Duration,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn MetaStore>, tx: mpsc::Sender<Command>, watch_timeout_ms: u64) -> Self {
        Self {
            store,
            tx,
            watch_timeout: Duration::from_millis(watch_timeout_ms),
        }
    }

    /// Bootstrap and run all watch pumps until the command channel closes.
    /// An error return is fatal to the process.
    pub async fn run(self) -> WardenResult<()> {
        let engine = Arc::new(self);

        // Seeded prefixes: snapshot first, then watch one past it.
        let instance_rev = engine.seed(PrefixKind::Instances).await?;
        let abnormal_rev = engine.seed(PrefixKind::AbnormalSchedulers).await?;
        let debug_rev = engine.seed(PrefixKind::DebugInstances).await?;
        let meta_rev = engine.seed(PrefixKind::FunctionMeta).await?;

        let mut pumps = JoinSet::new();
        for (kind, from) in [
            (PrefixKind::Instances, instance_rev + 1),
            (PrefixKind::AbnormalSchedulers, abnormal_rev + 1),
            (PrefixKind::DebugInstances, debug_rev + 1),
            (PrefixKind::FunctionMeta, meta_rev + 1),
            (PrefixKind::NodeRoutes, 0),
        ] {
            let engine = engine.clone();
            pumps.spawn(async move { engine.pump(kind, from).await });
        }

        while let Some(joined) = pumps.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    pumps.abort_all();
                    return Err(err);
                }
                Err(err) => {
                    pumps.abort_all();
                    return Err(WardenError::internal(format!("watch pump panicked: {err}")));
                }
            }
        }
        Ok(())
    }

    /// Read a full prefix and feed it to the control task as synthetic
    /// PUTs. Returns the snapshot revision.
    async fn seed(&self, kind: PrefixKind) -> WardenResult<i64> {
        let deadline = Instant::now() + self.watch_timeout;
        let mut delay = Duration::from_millis(200);
        let response = loop {
            match self.store.get_prefix(kind.prefix()).await {
                Ok(response) => break response,
                Err(err) => {
                    tracing::warn!(prefix = kind.prefix(), %err, "bootstrap read failed");
                    if Instant::now() + delay >= deadline {
                        return Err(WardenError::WatchRegistrationTimeout {
                            prefix: kind.prefix().to_string(),
                        });
                    }
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(2));
                }
            }
        };
        let events: Vec<RegistryEvent> = response
            .kvs
            .iter()
            .filter_map(|kv| map_put(kind, kv, None))
            .collect();
        tracing::info!(
            prefix = kind.prefix(),
            entries = events.len(),
            revision = response.revision,
            "bootstrap snapshot applied"
        );
        if !events.is_empty() {
            let _ = self.tx.send(Command::Events(events)).await;
        }
        Ok(response.revision)
    }

    /// Watch one prefix and forward decoded events. Re-registers from the
    /// last seen revision when the stream ends.
    async fn pump(&self, kind: PrefixKind, mut from: i64) -> WardenResult<()> {
        loop {
            let mut watcher = self.register_watch(kind, from).await?;
            while let Some(batch) = watcher.events.recv().await {
                let mut events = Vec::with_capacity(batch.len());
                for event in batch {
                    from = from.max(event.kv.mod_revision + 1);
                    if let Some(mapped) = map_event(kind, &event) {
                        events.push(mapped);
                    }
                }
                if !events.is_empty() && self.tx.send(Command::Events(events)).await.is_err() {
                    return Ok(());
                }
            }
            if self.tx.is_closed() {
                return Ok(());
            }
            tracing::warn!(prefix = kind.prefix(), from, "watch stream ended, re-registering");
            // A gap may have opened while disconnected; force a resync once
            // the watch is back.
            let _ = self.tx.send(Command::Resync).await;
        }
    }

    async fn register_watch(
        &self,
        kind: PrefixKind,
        from: i64,
    ) -> WardenResult<crate::meta::store::Watcher> {
        let deadline = Instant::now() + self.watch_timeout;
        let mut delay = Duration::from_millis(200);
        loop {
            let opts = WatchOptions {
                prefix: true,
                prev_value: true,
                from_revision: from,
            };
            match self.store.watch(kind.prefix(), opts).await {
                Ok(watcher) => return Ok(watcher),
                Err(err) => {
                    tracing::warn!(prefix = kind.prefix(), %err, "watch registration failed");
                    if Instant::now() + delay >= deadline {
                        return Err(WardenError::WatchRegistrationTimeout {
                            prefix: kind.prefix().to_string(),
                        });
                    }
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(2));
                }
            }
        }
    }
}

fn map_event(kind: PrefixKind, event: &WatchEvent) -> Option<RegistryEvent> {
    match event.event_type {
        EventType::Put => map_put(kind, &event.kv, event.prev_kv.as_ref()),
        EventType::Delete => map_delete(kind, &event.kv),
    }
}

fn map_put(kind: PrefixKind, kv: &KeyValue, prev: Option<&KeyValue>) -> Option<RegistryEvent> {
    match kind {
        PrefixKind::Instances => {
            let record = decode_record(kv)?;
            let prev = prev.and_then(decode_record);
            Some(RegistryEvent::InstancePut {
                key: kv.key.clone(),
                record,
                prev,
            })
        }
        PrefixKind::DebugInstances => {
            let record = decode_record(kv)?;
            Some(RegistryEvent::DebugInstancePut { record })
        }
        PrefixKind::AbnormalSchedulers => {
            let node_id = kv.key.strip_prefix(keys::ABNORMAL_SCHEDULER_PREFIX)?;
            Some(RegistryEvent::AbnormalMarker {
                node_id: node_id.to_string(),
                present: true,
            })
        }
        PrefixKind::NodeRoutes => {
            let node_id = keys::node_id_from_route_key(&kv.key)?;
            Some(RegistryEvent::NodeRouteAdded {
                node_id: node_id.to_string(),
            })
        }
        PrefixKind::FunctionMeta => {
            let function_key = keys::function_key_from_meta_key(&kv.key)?;
            Some(RegistryEvent::FunctionMetaPut {
                function_key: function_key.to_string(),
            })
        }
    }
}

fn map_delete(kind: PrefixKind, kv: &KeyValue) -> Option<RegistryEvent> {
    match kind {
        PrefixKind::Instances => {
            let instance_id = keys::instance_id_from_key(&kv.key)?;
            Some(RegistryEvent::InstanceDelete {
                key: kv.key.clone(),
                instance_id: instance_id.to_string(),
                revision: kv.mod_revision,
            })
        }
        PrefixKind::DebugInstances => {
            let instance_id = keys::instance_id_from_key(&kv.key)?;
            Some(RegistryEvent::DebugInstanceDeleted {
                instance_id: instance_id.to_string(),
            })
        }
        PrefixKind::AbnormalSchedulers => {
            let node_id = kv.key.strip_prefix(keys::ABNORMAL_SCHEDULER_PREFIX)?;
            Some(RegistryEvent::AbnormalMarker {
                node_id: node_id.to_string(),
                present: false,
            })
        }
        PrefixKind::NodeRoutes => {
            let node_id = keys::node_id_from_route_key(&kv.key)?;
            Some(RegistryEvent::NodeRouteRemoved {
                node_id: node_id.to_string(),
            })
        }
        PrefixKind::FunctionMeta => {
            let function_key = keys::function_key_from_meta_key(&kv.key)?;
            Some(RegistryEvent::FunctionMetaDeleted {
                function_key: function_key.to_string(),
            })
        }
    }
}

/// Decode an instance record, folding the store-assigned revision and
/// version into it. Malformed values are logged and skipped rather than
/// poisoning the stream.
fn decode_record(kv: &KeyValue) -> Option<InstanceRecord> {
    match InstanceRecord::decode(&kv.key, &kv.value) {
        Ok(mut record) => {
            record.mod_revision = kv.mod_revision;
            record.version = kv.version;
            Some(record)
        }
        Err(err) => {
            tracing::warn!(key = %kv.key, %err, "undecodable record skipped");
            None
        }
    }
}
