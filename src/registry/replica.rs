//! Local replica of the instance registry.
//!
//! The replica is the single owner of full [`InstanceRecord`] values; every
//! other structure (family tracker, node set, kill tickets) holds instance
//! IDs only. All mutation happens inside the control task, so the secondary
//! indices are never observable in a partial state.

use crate::registry::record::InstanceRecord;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
struct Stored {
    key: String,
    record: InstanceRecord,
}

/// Per-node replica of all instance records with secondary indices by owning
/// node, job and function.
#[derive(Debug, Default)]
pub struct InstanceRegistryReplica {
    by_id: HashMap<String, Stored>,
    key_to_id: HashMap<String, String>,
    by_node: HashMap<String, HashSet<String>>,
    by_job: HashMap<String, HashSet<String>>,
    by_function: HashMap<String, HashSet<String>>,
}

impl InstanceRegistryReplica {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a record, returning the previous state if any.
    ///
    /// A record that moved to a new owner leaves the stale node bucket
    /// before entering the new one.
    pub fn apply_put(&mut self, key: &str, record: InstanceRecord) -> Option<InstanceRecord> {
        let id = record.instance_id.clone();
        let prev = self.detach(&id);
        index(&mut self.by_node, &record.node_id, &id);
        index(&mut self.by_job, &record.job_id, &id);
        index(&mut self.by_function, &record.function_key, &id);
        self.key_to_id.insert(key.to_string(), id.clone());
        self.by_id.insert(
            id,
            Stored {
                key: key.to_string(),
                record,
            },
        );
        prev
    }

    /// Remove a record by its store key.
    pub fn remove_by_key(&mut self, key: &str) -> Option<InstanceRecord> {
        let id = self.key_to_id.get(key)?.clone();
        self.remove(&id)
    }

    /// Remove a record by instance ID.
    pub fn remove(&mut self, instance_id: &str) -> Option<InstanceRecord> {
        let prev = self.detach(instance_id)?;
        Some(prev)
    }

    fn detach(&mut self, instance_id: &str) -> Option<InstanceRecord> {
        let stored = self.by_id.remove(instance_id)?;
        self.key_to_id.remove(&stored.key);
        unindex(&mut self.by_node, &stored.record.node_id, instance_id);
        unindex(&mut self.by_job, &stored.record.job_id, instance_id);
        unindex(
            &mut self.by_function,
            &stored.record.function_key,
            instance_id,
        );
        Some(stored.record)
    }

    pub fn get(&self, instance_id: &str) -> Option<&InstanceRecord> {
        self.by_id.get(instance_id).map(|s| &s.record)
    }

    pub fn get_by_key(&self, key: &str) -> Option<&InstanceRecord> {
        let id = self.key_to_id.get(key)?;
        self.get(id)
    }

    /// Store key of a known instance.
    pub fn key_of(&self, instance_id: &str) -> Option<&str> {
        self.by_id.get(instance_id).map(|s| s.key.as_str())
    }

    pub fn contains(&self, instance_id: &str) -> bool {
        self.by_id.contains_key(instance_id)
    }

    /// Snapshot of every record owned by `node_id`.
    pub fn snapshot_by_node(&self, node_id: &str) -> Vec<InstanceRecord> {
        self.ids_to_records(self.by_node.get(node_id))
    }

    pub fn instances_of_job(&self, job_id: &str) -> Vec<InstanceRecord> {
        self.ids_to_records(self.by_job.get(job_id))
    }

    pub fn instances_of_function(&self, function_key: &str) -> Vec<InstanceRecord> {
        self.ids_to_records(self.by_function.get(function_key))
    }

    /// Snapshot of all records.
    pub fn snapshot(&self) -> Vec<InstanceRecord> {
        self.by_id.values().map(|s| s.record.clone()).collect()
    }

    /// All (store key, record) pairs, for resync comparison.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &InstanceRecord)> {
        self.by_id.values().map(|s| (s.key.as_str(), &s.record))
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    fn ids_to_records(&self, ids: Option<&HashSet<String>>) -> Vec<InstanceRecord> {
        ids.into_iter()
            .flatten()
            .filter_map(|id| self.get(id).cloned())
            .collect()
    }
}

fn index(map: &mut HashMap<String, HashSet<String>>, bucket: &str, id: &str) {
    if bucket.is_empty() {
        return;
    }
    map.entry(bucket.to_string())
        .or_default()
        .insert(id.to_string());
}

fn unindex(map: &mut HashMap<String, HashSet<String>>, bucket: &str, id: &str) {
    if let Some(set) = map.get_mut(bucket) {
        set.remove(id);
        if set.is_empty() {
            map.remove(bucket);
        }
    }
}
