//! Metadata-store client contract.
//!
//! Warden is a client of a shared revisioned key-value store with etcd-like
//! semantics: every mutation is stamped with a cluster-wide monotone
//! `mod_revision`, range reads return the revision they observed, and
//! watches deliver ordered PUT/DELETE events starting from a revision.
//!
//! The store's own implementation (consensus, persistence) is out of scope;
//! only this contract is depended upon.

use crate::core::error::WardenResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Event type carried by a watch stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Put,
    Delete,
}

/// A key-value entry as observed by a read or watch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    /// Revision of the last mutation of this key.
    pub mod_revision: i64,
    /// Per-key write counter, reset to 1 when a key is re-created.
    pub version: i64,
}

/// A single watch event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub event_type: EventType,
    pub kv: KeyValue,
    /// Previous value of the key, when the watch was registered with
    /// `prev_value` and the store still has it.
    pub prev_kv: Option<KeyValue>,
}

impl WatchEvent {
    pub fn put(kv: KeyValue) -> Self {
        Self {
            event_type: EventType::Put,
            kv,
            prev_kv: None,
        }
    }

    pub fn delete(kv: KeyValue, prev_kv: Option<KeyValue>) -> Self {
        Self {
            event_type: EventType::Delete,
            kv,
            prev_kv,
        }
    }
}

/// Result of a prefix read.
#[derive(Debug, Clone, Default)]
pub struct GetResponse {
    pub kvs: Vec<KeyValue>,
    /// Store revision at which the read was served.
    pub revision: i64,
}

/// Result of a successful put.
#[derive(Debug, Clone, Copy)]
pub struct PutResponse {
    /// Revision assigned to the write.
    pub mod_revision: i64,
    /// Key version after the write.
    pub version: i64,
}

/// Watch registration options.
#[derive(Debug, Clone, Copy, Default)]
pub struct WatchOptions {
    /// Treat the key as a prefix.
    pub prefix: bool,
    /// Deliver the previous value alongside DELETE events.
    pub prev_value: bool,
    /// First revision the stream must deliver; 0 means "from now".
    pub from_revision: i64,
}

/// An active watch registration. Dropping the handle cancels the watch.
pub struct Watcher {
    pub events: mpsc::UnboundedReceiver<Vec<WatchEvent>>,
}

/// Shared metadata-store contract.
///
/// Implementations must guarantee that events for a single key are delivered
/// in `mod_revision` order; delivery across keys may interleave arbitrarily.
/// Transient failures surface as `WardenError::StoreUnavailable` so callers
/// can route them to the replay buffer.
#[async_trait]
pub trait MetaStore: Send + Sync {
    /// Consistent snapshot of all keys under `prefix`.
    async fn get_prefix(&self, prefix: &str) -> WardenResult<GetResponse>;

    /// Point read of a single key.
    async fn get(&self, key: &str) -> WardenResult<Option<KeyValue>>;

    /// Write a key. When `expected_version` is `Some`, the write only
    /// succeeds if the key's current version matches (0 = must not exist);
    /// otherwise `WardenError::VersionConflict` is returned.
    async fn put(
        &self,
        key: &str,
        value: &str,
        expected_version: Option<i64>,
    ) -> WardenResult<PutResponse>;

    /// Delete a key. Deleting an absent key is not an error.
    async fn delete(&self, key: &str, expected_version: Option<i64>) -> WardenResult<()>;

    /// Register a watch on `key` (or prefix) starting at
    /// `opts.from_revision`. Implementations retry registration internally;
    /// a returned error is final and must be treated as fatal by the caller.
    async fn watch(&self, key: &str, opts: WatchOptions) -> WardenResult<Watcher>;
}
