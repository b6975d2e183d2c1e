use crate::membership::types::NodeId;
use crate::storage::partitioner::PartitionManager;

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;

/// Primary-side record of which nodes hold a near shadow of each local key.
///
/// Populated when a non-owning node reads or locks through this primary;
/// consulted on commit so every known shadow receives the new value. Keys
/// are tracked as strings, matching the wire form the shadows were
/// requested under.
pub struct ShadowTracker {
    holders: DashMap<String, HashSet<NodeId>>,
}

impl ShadowTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            holders: DashMap::new(),
        })
    }

    pub fn register(&self, key: &str, node: NodeId) {
        self.holders.entry(key.to_string()).or_default().insert(node);
    }

    pub fn nodes_for(&self, key: &str) -> Vec<NodeId> {
        self.holders
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Forgets one holder of one key, used when a push bounces.
    pub fn unregister(&self, key: &str, node: &NodeId) {
        if let Some(mut set) = self.holders.get_mut(key) {
            set.remove(node);
        }
    }

    /// Drops every registration for a departed node.
    pub fn drop_node(&self, node: &NodeId) {
        for mut entry in self.holders.iter_mut() {
            entry.value_mut().remove(node);
        }
        self.holders.retain(|_, set| !set.is_empty());
    }

    /// Drops registrations for keys in partitions this node no longer owns.
    pub fn drop_for_partitions(&self, partitions: &[u32], partitioner: &PartitionManager) {
        if partitions.is_empty() {
            return;
        }
        self.holders
            .retain(|key, _| !partitions.contains(&partitioner.get_partition(key)));
    }

    pub fn tracked_key_count(&self) -> usize {
        self.holders.len()
    }
}
