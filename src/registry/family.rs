//! Parent/child relationships between instances.
//!
//! The tracker is a derived view over the replica: it only stores instance
//! IDs and the parent edge. Cascading kills walk it breadth-first so the
//! closest descendants are acted on first.

use std::collections::{HashMap, HashSet, VecDeque};

/// Derived parent → children graph of all known instances.
#[derive(Debug, Default)]
pub struct FamilyTracker {
    parent_of: HashMap<String, String>,
    children_of: HashMap<String, HashSet<String>>,
}

impl FamilyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an instance and its parent edge. Re-adding with a different
    /// parent moves the edge.
    pub fn add_or_update(&mut self, instance_id: &str, parent_id: &str) {
        if let Some(old_parent) = self.parent_of.get(instance_id) {
            if old_parent == parent_id {
                return;
            }
            let old_parent = old_parent.clone();
            self.drop_edge(&old_parent, instance_id);
        }
        self.parent_of
            .insert(instance_id.to_string(), parent_id.to_string());
        if !parent_id.is_empty() {
            self.children_of
                .entry(parent_id.to_string())
                .or_default()
                .insert(instance_id.to_string());
        }
    }

    /// Remove an instance. Its children stay tracked and become orphan
    /// candidates.
    pub fn remove(&mut self, instance_id: &str) {
        if let Some(parent) = self.parent_of.remove(instance_id) {
            if !parent.is_empty() {
                self.drop_edge(&parent, instance_id);
            }
        }
    }

    pub fn exists(&self, instance_id: &str) -> bool {
        self.parent_of.contains_key(instance_id)
    }

    pub fn parent_of(&self, instance_id: &str) -> Option<&str> {
        self.parent_of.get(instance_id).map(String::as_str)
    }

    /// All transitive descendants of an instance, breadth-first.
    pub fn descendants_of(&self, instance_id: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut queue = VecDeque::from([instance_id.to_string()]);
        let mut seen = HashSet::new();
        while let Some(current) = queue.pop_front() {
            let Some(children) = self.children_of.get(&current) else {
                continue;
            };
            let mut children: Vec<&String> = children.iter().collect();
            children.sort();
            for child in children {
                if seen.insert(child.clone()) {
                    out.push(child.clone());
                    queue.push_back(child.clone());
                }
            }
        }
        out
    }

    /// Batch-load a snapshot. Edges are built after all IDs are known, so an
    /// unordered snapshot cannot make a child look orphaned.
    pub fn sync_instances<'a>(&mut self, pairs: impl IntoIterator<Item = (&'a str, &'a str)>) {
        for (instance_id, parent_id) in pairs {
            self.add_or_update(instance_id, parent_id);
        }
    }

    /// Instance IDs with no parent edge, for root walks on promotion.
    pub fn roots(&self) -> Vec<String> {
        self.parent_of
            .iter()
            .filter(|(_, parent)| parent.is_empty() || !self.parent_of.contains_key(*parent))
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.parent_of.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parent_of.is_empty()
    }

    fn drop_edge(&mut self, parent: &str, child: &str) {
        if let Some(set) = self.children_of.get_mut(parent) {
            set.remove(child);
            if set.is_empty() {
                self.children_of.remove(parent);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descendants_are_breadth_first() {
        let mut family = FamilyTracker::new();
        family.add_or_update("a", "");
        family.add_or_update("b", "a");
        family.add_or_update("c", "a");
        family.add_or_update("d", "b");
        let descendants = family.descendants_of("a");
        assert_eq!(descendants, vec!["b", "c", "d"]);
    }

    #[test]
    fn remove_keeps_children_tracked() {
        let mut family = FamilyTracker::new();
        family.add_or_update("a", "");
        family.add_or_update("b", "a");
        family.remove("a");
        assert!(!family.exists("a"));
        assert!(family.exists("b"));
        assert_eq!(family.parent_of("b"), Some("a"));
        assert!(family.descendants_of("a").contains(&"b".to_string()));
    }

    #[test]
    fn reparenting_moves_the_edge() {
        let mut family = FamilyTracker::new();
        family.add_or_update("a", "");
        family.add_or_update("b", "");
        family.add_or_update("c", "a");
        family.add_or_update("c", "b");
        assert!(family.descendants_of("a").is_empty());
        assert_eq!(family.descendants_of("b"), vec!["c"]);
    }

    #[test]
    fn unordered_snapshot_builds_complete_graph() {
        let mut family = FamilyTracker::new();
        family.sync_instances([("c", "b"), ("a", ""), ("b", "a")]);
        assert_eq!(family.descendants_of("a"), vec!["b", "c"]);
        assert_eq!(family.roots(), vec!["a"]);
    }
}
