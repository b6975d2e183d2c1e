use crate::membership::types::NodeId;
use crate::storage::partitioner::PartitionManager;

use dashmap::DashMap;
use std::hash::Hash;
use std::str::FromStr;
use std::sync::Arc;

/// A non-owning node's best-effort mirror of one remote entry.
///
/// Invariant: `version` never exceeds the authoritative version of the key;
/// it may lag (the push is eventual) but never leads.
#[derive(Debug, Clone)]
pub struct Shadow<V> {
    pub value: V,
    pub version: u64,
    /// The primary observed when the shadow was populated. Advisory only;
    /// affinity is re-resolved for every authoritative operation.
    pub primary_hint: NodeId,
}

/// Per-node mirror of remote entries. Populated lazily on first remote
/// read, refreshed by post-commit pushes, never authoritative and never a
/// commit target.
pub struct NearCache<K, V> {
    shadows: DashMap<K, Shadow<V>>,
    partitioner: Arc<PartitionManager>,
}

impl<K, V> NearCache<K, V>
where
    K: ToString + FromStr + Clone + Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(partitioner: Arc<PartitionManager>) -> Arc<Self> {
        Arc::new(Self {
            shadows: DashMap::new(),
            partitioner,
        })
    }

    pub fn peek(&self, key: &K) -> Option<(V, u64)> {
        self.shadows
            .get(key)
            .map(|s| (s.value.clone(), s.version))
    }

    /// Records a fresher copy. A push carrying an older version than the
    /// shadow already holds is dropped: a shadow's recorded version never
    /// regresses. Equal versions refresh the primary hint only.
    pub fn update(&self, key: K, value: V, version: u64, primary_hint: NodeId) {
        match self.shadows.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let shadow = occupied.get_mut();
                if version < shadow.version {
                    tracing::debug!(
                        "Dropping stale near push (version {} < {})",
                        version,
                        shadow.version
                    );
                    return;
                }
                if version > shadow.version {
                    shadow.value = value;
                    shadow.version = version;
                }
                shadow.primary_hint = primary_hint;
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(Shadow {
                    value,
                    version,
                    primary_hint,
                });
            }
        }
    }

    pub fn invalidate(&self, key: &K) {
        self.shadows.remove(key);
    }

    /// Drops every shadow living in one of the given partitions. Called on
    /// repartition or loss of an owning primary; shadows are rebuilt lazily
    /// on the next access.
    pub fn drop_for_partitions(&self, partitions: &[u32]) {
        if partitions.is_empty() {
            return;
        }
        self.shadows.retain(|key, _| {
            let partition = self.partitioner.get_partition(&key.to_string());
            !partitions.contains(&partition)
        });
    }

    pub fn clear(&self) {
        self.shadows.clear();
    }

    pub fn shadow_count(&self) -> usize {
        self.shadows.len()
    }
}
