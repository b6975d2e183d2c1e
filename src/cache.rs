//! Client-Facing Cache Surface
//!
//! `TransactionalCache` bundles the node's storage, affinity, near cache
//! and transaction coordinator, and routes operations transparently:
//! owner reads hit the local Partition Store, non-owner reads go through
//! the near cache with lazy read-through, and writes run as pessimistic
//! transactions.

use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::membership::service::MembershipService;
use crate::near::{cache::NearCache, tracker::ShadowTracker};
use crate::storage::partitioner::PartitionManager;
use crate::storage::store::PartitionStore;
use crate::store::CacheStore;
use crate::tx::coordinator::{Transaction, TransactionCoordinator};
use crate::tx::types::{Concurrency, Isolation};

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::hash::Hash;
use std::str::FromStr;
use std::sync::Arc;

pub struct TransactionalCache<K, V> {
    membership: Arc<MembershipService>,
    partitioner: Arc<PartitionManager>,
    store: Arc<PartitionStore<K, V>>,
    near: Arc<NearCache<K, V>>,
    shadows: Arc<ShadowTracker>,
    coordinator: Arc<TransactionCoordinator<K, V>>,
}

impl<K, V> TransactionalCache<K, V>
where
    K: ToString + FromStr + Clone + Hash + Eq + Send + Sync + 'static,
    <K as FromStr>::Err: std::fmt::Display,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(membership: Arc<MembershipService>, config: CacheConfig) -> Arc<Self> {
        let partitioner = PartitionManager::with_settings(
            membership.clone(),
            config.partitions,
            config.backups,
        );
        let store = PartitionStore::new();
        let near = NearCache::new(partitioner.clone());
        let shadows = ShadowTracker::new();
        let coordinator = TransactionCoordinator::new(
            membership.clone(),
            partitioner.clone(),
            store.clone(),
            near.clone(),
            shadows.clone(),
            config,
        );

        Arc::new(Self {
            membership,
            partitioner,
            store,
            near,
            shadows,
            coordinator,
        })
    }

    pub fn membership(&self) -> &Arc<MembershipService> {
        &self.membership
    }

    pub fn partitioner(&self) -> &Arc<PartitionManager> {
        &self.partitioner
    }

    pub fn store(&self) -> &Arc<PartitionStore<K, V>> {
        &self.store
    }

    pub fn near(&self) -> &Arc<NearCache<K, V>> {
        &self.near
    }

    pub fn shadows(&self) -> &Arc<ShadowTracker> {
        &self.shadows
    }

    pub fn coordinator(&self) -> &Arc<TransactionCoordinator<K, V>> {
        &self.coordinator
    }

    /// Non-transactional read. Owners answer from the Partition Store;
    /// non-owners consult their near shadow and fall back to a read-through
    /// at the primary, which registers the shadow for future pushes.
    pub async fn get(&self, key: &K) -> Result<Option<V>, CacheError> {
        let key_str = key.to_string();
        let partition = self.partitioner.get_partition(&key_str);
        let assignment = self.partitioner.current_assignment();
        let owners = assignment.owners(partition);
        let local_id = &self.membership.local_node.id;

        if owners.contains(local_id) {
            tracing::debug!("GET: Answering key '{}' from local partition {}", key_str, partition);
            return Ok(self.store.read(partition, key).0);
        }

        if let Some((value, version)) = self.near.peek(key) {
            tracing::debug!("GET: Near hit for '{}' at version {}", key_str, version);
            return Ok(Some(value));
        }

        let Some(primary) = owners.first() else {
            tracing::warn!("GET: No alive owners for partition {}", partition);
            return Ok(None);
        };

        let response = self.coordinator.remote_read(primary, &key_str).await?;
        let value = match response.value_json {
            Some(json) => Some(
                serde_json::from_str::<V>(&json)
                    .map_err(|e| CacheError::Transport(e.to_string()))?,
            ),
            None => None,
        };

        if let Some(v) = &value {
            self.near
                .update(key.clone(), v.clone(), response.version, primary.clone());
        }

        Ok(value)
    }

    /// Single-key write, run as an implicit pessimistic transaction so it
    /// serializes with explicit transactions touching the same key.
    pub async fn put(&self, key: K, value: V) -> Result<(), CacheError> {
        let mut tx = self.tx_start(Concurrency::Pessimistic, Isolation::RepeatableRead);
        tx.put(key, value).await?;
        tx.commit().await
    }

    pub fn tx_start(&self, concurrency: Concurrency, isolation: Isolation) -> Transaction<K, V> {
        self.coordinator.begin(concurrency, isolation)
    }

    /// Warms the cache from the persistent store. `load_all` is consumed
    /// once; only entries whose partition this node owns (primary or
    /// backup) under the current topology are kept. Returns the number of
    /// entries retained.
    pub fn load_from_store(
        &self,
        store: &dyn CacheStore<K, V>,
        args: &[String],
    ) -> anyhow::Result<usize> {
        let snapshot = self.membership.topology_snapshot();
        let local_id = &self.membership.local_node.id;
        let mut kept = 0usize;

        for (key, value) in store.load_all(args)? {
            let partition = self.partitioner.get_partition(&key.to_string());
            if self.partitioner.owns_in(partition, local_id, &snapshot) {
                // Loaded entries seed version 1; committed writes always win.
                self.store.apply_replicated(partition, key, value, 1);
                kept += 1;
            }
        }

        tracing::info!("Store load kept {} entries for owned partitions", kept);
        Ok(kept)
    }
}
