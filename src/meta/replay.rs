//! Buffered store operations waiting for the metadata store to come back.
//!
//! When a reconciliation write hits a retryable store failure, the intent
//! (not the error) is parked here. The syncer replays pending operations
//! after every successful full resync; an entry leaves the buffer only once
//! the identical operation succeeds or its instance is gone.

use crate::registry::record::InstanceRecord;
use std::collections::{HashMap, HashSet};

/// A put intent parked for replay.
#[derive(Debug, Clone)]
pub enum PendingPut {
    /// Instance record write; a replayed SCHEDULING record re-triggers the
    /// reschedule side effect.
    Record(InstanceRecord),
    /// Opaque value write (abnormal markers, route projections).
    Raw(String),
}

/// Buffer of failed put/delete intents keyed by store key.
#[derive(Debug, Default)]
pub struct OperationReplayBuffer {
    puts: HashMap<String, PendingPut>,
    deletes: HashSet<String>,
}

impl OperationReplayBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a failed record put. Supersedes any pending delete for the key.
    pub fn record_put(&mut self, key: &str, record: InstanceRecord) {
        self.deletes.remove(key);
        self.puts.insert(key.to_string(), PendingPut::Record(record));
    }

    /// Park a failed opaque put. Supersedes any pending delete for the key.
    pub fn record_raw_put(&mut self, key: &str, value: String) {
        self.deletes.remove(key);
        self.puts.insert(key.to_string(), PendingPut::Raw(value));
    }

    /// Park a failed delete. Supersedes any pending put for the same key.
    pub fn record_delete(&mut self, key: &str) {
        self.puts.remove(key);
        self.deletes.insert(key.to_string());
    }

    /// Whether a put for this key is parked.
    pub fn has_pending_put(&self, key: &str) -> bool {
        self.puts.contains_key(key)
    }

    /// Drop a pending put once it succeeded or became moot.
    pub fn resolve_put(&mut self, key: &str) {
        self.puts.remove(key);
    }

    /// Drop a pending delete once it succeeded or became moot.
    pub fn resolve_delete(&mut self, key: &str) {
        self.deletes.remove(key);
    }

    /// Snapshot of pending puts for a replay pass.
    pub fn pending_puts(&self) -> Vec<(String, PendingPut)> {
        self.puts
            .iter()
            .map(|(k, p)| (k.clone(), p.clone()))
            .collect()
    }

    /// Snapshot of pending deletes for a replay pass.
    pub fn pending_deletes(&self) -> Vec<String> {
        self.deletes.iter().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.puts.is_empty() && self.deletes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.puts.len() + self.deletes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::record::InstanceStatus;

    fn record(id: &str) -> InstanceRecord {
        InstanceRecord {
            instance_id: id.into(),
            function_key: "f".into(),
            status: InstanceStatus::Fatal,
            ..Default::default()
        }
    }

    #[test]
    fn later_intent_supersedes_earlier() {
        let mut buffer = OperationReplayBuffer::new();
        buffer.record_put("instances/f/i1", record("i1"));
        buffer.record_delete("instances/f/i1");
        assert_eq!(buffer.pending_puts().len(), 0);
        assert_eq!(buffer.pending_deletes(), vec!["instances/f/i1"]);

        buffer.record_put("instances/f/i1", record("i1"));
        assert!(buffer.pending_deletes().is_empty());
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn resolve_removes_entries() {
        let mut buffer = OperationReplayBuffer::new();
        buffer.record_put("k1", record("i1"));
        buffer.record_raw_put("k2", "{}".into());
        buffer.record_delete("k3");
        buffer.resolve_put("k1");
        buffer.resolve_put("k2");
        buffer.resolve_delete("k3");
        assert!(buffer.is_empty());
    }
}
