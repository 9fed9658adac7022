//! In-memory metadata store.
//!
//! A single-process implementation of the [`MetaStore`] contract with real
//! revision semantics: one monotone revision counter, per-key versions that
//! reset on re-creation, and watch fanout that can replay from a retained
//! event log. Used by the embedded runtime mode and throughout the tests.

use crate::core::error::{WardenError, WardenResult};
use crate::meta::store::{
    EventType, GetResponse, KeyValue, MetaStore, PutResponse, WatchEvent, WatchOptions, Watcher,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

struct Registration {
    key: String,
    opts: WatchOptions,
    tx: mpsc::UnboundedSender<Vec<WatchEvent>>,
}

impl Registration {
    fn matches(&self, key: &str) -> bool {
        if self.opts.prefix {
            key.starts_with(&self.key)
        } else {
            key == self.key
        }
    }
}

#[derive(Default)]
struct Inner {
    kvs: HashMap<String, KeyValue>,
    revision: i64,
    /// Retained history for watch replay, in revision order.
    log: Vec<WatchEvent>,
    watchers: Vec<Registration>,
    /// When set, all reads and writes fail as transient store outages.
    unavailable: bool,
}

impl Inner {
    fn fanout(&mut self, event: WatchEvent) {
        self.log.push(event.clone());
        self.watchers.retain(|reg| {
            if !reg.matches(&event.kv.key) {
                return true;
            }
            let mut event = event.clone();
            if !reg.opts.prev_value {
                event.prev_kv = None;
            }
            reg.tx.send(vec![event]).is_ok()
        });
    }
}

/// In-memory [`MetaStore`] implementation.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a store outage: while set, every operation fails with a
    /// retryable error. Watches stay registered.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().unwrap().unavailable = unavailable;
    }

    /// Current store revision.
    pub fn revision(&self) -> i64 {
        self.inner.lock().unwrap().revision
    }

    fn check_available(inner: &Inner) -> WardenResult<()> {
        if inner.unavailable {
            Err(WardenError::store_unavailable("injected outage"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MetaStore for MemoryStore {
    async fn get_prefix(&self, prefix: &str) -> WardenResult<GetResponse> {
        let inner = self.inner.lock().unwrap();
        Self::check_available(&inner)?;
        let mut kvs: Vec<KeyValue> = inner
            .kvs
            .values()
            .filter(|kv| kv.key.starts_with(prefix))
            .cloned()
            .collect();
        kvs.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(GetResponse {
            kvs,
            revision: inner.revision,
        })
    }

    async fn get(&self, key: &str) -> WardenResult<Option<KeyValue>> {
        let inner = self.inner.lock().unwrap();
        Self::check_available(&inner)?;
        Ok(inner.kvs.get(key).cloned())
    }

    async fn put(
        &self,
        key: &str,
        value: &str,
        expected_version: Option<i64>,
    ) -> WardenResult<PutResponse> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_available(&inner)?;
        let current_version = inner.kvs.get(key).map(|kv| kv.version).unwrap_or(0);
        if let Some(expected) = expected_version {
            if expected != current_version {
                return Err(WardenError::VersionConflict {
                    key: key.to_string(),
                    expected,
                    actual: current_version,
                });
            }
        }
        inner.revision += 1;
        let kv = KeyValue {
            key: key.to_string(),
            value: value.to_string(),
            mod_revision: inner.revision,
            version: current_version + 1,
        };
        let prev = inner.kvs.insert(key.to_string(), kv.clone());
        inner.fanout(WatchEvent {
            event_type: EventType::Put,
            kv: kv.clone(),
            prev_kv: prev,
        });
        Ok(PutResponse {
            mod_revision: kv.mod_revision,
            version: kv.version,
        })
    }

    async fn delete(&self, key: &str, expected_version: Option<i64>) -> WardenResult<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_available(&inner)?;
        let Some(prev) = inner.kvs.get(key).cloned() else {
            return Ok(());
        };
        if let Some(expected) = expected_version {
            if expected != prev.version {
                return Err(WardenError::VersionConflict {
                    key: key.to_string(),
                    expected,
                    actual: prev.version,
                });
            }
        }
        inner.revision += 1;
        inner.kvs.remove(key);
        let tombstone = KeyValue {
            key: key.to_string(),
            value: String::new(),
            mod_revision: inner.revision,
            version: 0,
        };
        inner.fanout(WatchEvent {
            event_type: EventType::Delete,
            kv: tombstone,
            prev_kv: Some(prev),
        });
        Ok(())
    }

    async fn watch(&self, key: &str, opts: WatchOptions) -> WardenResult<Watcher> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        Self::check_available(&inner)?;

        // Replay retained history for watches starting in the past.
        if opts.from_revision > 0 {
            let backlog: Vec<WatchEvent> = inner
                .log
                .iter()
                .filter(|e| e.kv.mod_revision >= opts.from_revision)
                .filter(|e| {
                    if opts.prefix {
                        e.kv.key.starts_with(key)
                    } else {
                        e.kv.key == key
                    }
                })
                .cloned()
                .map(|mut e| {
                    if !opts.prev_value {
                        e.prev_kv = None;
                    }
                    e
                })
                .collect();
            if !backlog.is_empty() {
                let _ = tx.send(backlog);
            }
        }

        inner.watchers.push(Registration {
            key: key.to_string(),
            opts,
            tx,
        });
        Ok(Watcher { events: rx })
    }
}
