use super::entry::{Entry, LockOutcome, Waiter};
use crate::error::CacheError;
use crate::tx::types::TxId;

use dashmap::DashMap;
use std::hash::Hash;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;

/// Per-partition authoritative map of key -> versioned entry.
///
/// Entries are mutated only on the partition's primary; backups receive
/// writes through `apply_replicated`, which never takes locks. Every state
/// change to an entry requires holding its lock, enforced by the `tx_id`
/// parameter on `write`.
pub struct PartitionStore<K, V> {
    partitions: Arc<DashMap<u32, DashMap<K, Entry<V>>>>,
    waiter_seq: AtomicU64,
}

impl<K, V> PartitionStore<K, V>
where
    K: ToString + FromStr + Clone + Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            partitions: Arc::new(DashMap::new()),
            waiter_seq: AtomicU64::new(0),
        })
    }

    pub fn read(&self, partition: u32, key: &K) -> (Option<V>, u64) {
        if let Some(partition_map) = self.partitions.get(&partition)
            && let Some(entry) = partition_map.get(key)
        {
            return (entry.value.clone(), entry.version);
        }
        (None, 0)
    }

    /// Acquires the entry lock for `tx_id`, waiting FIFO-fair up to
    /// `timeout`. Reentrant: a transaction already holding the lock
    /// acquires again immediately. A timed-out attempt withdraws its
    /// queue slot (or releases a racing grant), so the entry is never
    /// left locked by a failed attempt.
    pub async fn try_lock(
        &self,
        partition: u32,
        key: &K,
        tx_id: &TxId,
        timeout: Duration,
    ) -> LockOutcome {
        let (waiter_id, rx) = {
            let partition_map = self
                .partitions
                .entry(partition)
                .or_insert_with(DashMap::new);
            let mut entry = partition_map
                .entry(key.clone())
                .or_insert_with(Entry::vacant);

            if entry.holder.is_none() {
                entry.holder = Some(tx_id.clone());
                return LockOutcome::Acquired;
            }
            if entry.holder.as_ref() == Some(tx_id) {
                // Reentrant acquisition within the same transaction.
                return LockOutcome::Acquired;
            }

            let (notify, rx) = oneshot::channel();
            let waiter_id = self.waiter_seq.fetch_add(1, Ordering::SeqCst);
            entry.waiters.push_back(Waiter {
                tx_id: tx_id.clone(),
                waiter_id,
                notify,
            });
            (waiter_id, rx)
            // Guards drop here; the wait happens without holding any shard.
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => LockOutcome::Acquired,
            _ => {
                self.withdraw_waiter(partition, key, tx_id, waiter_id);
                LockOutcome::TimedOut
            }
        }
    }

    /// Removes a timed-out waiter from the queue. If the grant raced the
    /// timeout and the lock already landed on this transaction, it is
    /// passed straight to the next waiter.
    fn withdraw_waiter(&self, partition: u32, key: &K, tx_id: &TxId, waiter_id: u64) {
        if let Some(partition_map) = self.partitions.get(&partition)
            && let Some(mut entry) = partition_map.get_mut(key)
        {
            let before = entry.waiters.len();
            entry.waiters.retain(|w| w.waiter_id != waiter_id);

            if entry.waiters.len() == before && entry.holder.as_ref() == Some(tx_id) {
                tracing::debug!(
                    "Lock for key '{}' granted after timeout of tx {}, releasing",
                    key.to_string(),
                    tx_id.0
                );
                entry.grant_next();
            }
        }
    }

    /// Applies a committed write. The caller must hold the entry lock;
    /// `expected_version` guards against an ownership-reassignment race
    /// that the lock alone cannot rule out.
    pub fn write(
        &self,
        partition: u32,
        key: &K,
        value: V,
        expected_version: u64,
        tx_id: &TxId,
    ) -> Result<u64, CacheError> {
        let partition_map = self
            .partitions
            .entry(partition)
            .or_insert_with(DashMap::new);
        let mut entry = partition_map
            .entry(key.clone())
            .or_insert_with(Entry::vacant);

        if entry.holder.as_ref() != Some(tx_id) {
            return Err(CacheError::PartitionOwnerChanged { partition });
        }
        if entry.version != expected_version {
            return Err(CacheError::OptimisticConflict {
                key: key.to_string(),
                expected: expected_version,
                actual: entry.version,
            });
        }

        entry.version += 1;
        entry.value = Some(value);
        Ok(entry.version)
    }

    /// Releases `tx_id`'s lock and wakes the next waiter in FIFO order.
    /// A release by a non-holder is ignored (double unlock after a failed
    /// commit is harmless).
    pub fn unlock(&self, partition: u32, key: &K, tx_id: &TxId) {
        if let Some(partition_map) = self.partitions.get(&partition)
            && let Some(mut entry) = partition_map.get_mut(key)
        {
            if entry.holder.as_ref() == Some(tx_id) {
                entry.grant_next();
            } else {
                tracing::debug!(
                    "Ignoring unlock of key '{}' by non-holder tx {}",
                    key.to_string(),
                    tx_id.0
                );
            }
        }
    }

    /// Backup-side apply. Idempotent, last-version-wins, never locks and
    /// never originates a version of its own.
    pub fn apply_replicated(&self, partition: u32, key: K, value: V, version: u64) {
        let partition_map = self
            .partitions
            .entry(partition)
            .or_insert_with(DashMap::new);
        let mut entry = partition_map.entry(key).or_insert_with(Entry::vacant);

        if version > entry.version {
            entry.version = version;
            entry.value = Some(value);
        }
    }

    /// Snapshot of a partition's committed state, used for rebalancing.
    pub fn dump_partition(&self, partition: u32) -> Vec<(K, V, u64)> {
        let mut entries = Vec::new();
        if let Some(partition_map) = self.partitions.get(&partition) {
            for entry in partition_map.iter() {
                if let Some(value) = &entry.value().value {
                    entries.push((entry.key().clone(), value.clone(), entry.value().version));
                }
            }
        }
        entries
    }

    /// Bulk apply from a peer's dump; per-entry last-version-wins, so
    /// replaying a dump is safe.
    pub fn apply_partition_entries(&self, partition: u32, entries: Vec<(K, V, u64)>) {
        for (key, value, version) in entries {
            self.apply_replicated(partition, key, value, version);
        }
    }

    pub fn has_partition(&self, partition: u32) -> bool {
        self.partitions
            .get(&partition)
            .map(|map| !map.is_empty())
            .unwrap_or(false)
    }

    pub fn local_partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn local_entry_count(&self) -> usize {
        self.partitions
            .iter()
            .map(|entry| entry.value().len())
            .sum()
    }

    /// Lock holder for a key, if any. Diagnostic surface for tests and the
    /// stats reporter.
    pub fn lock_holder(&self, partition: u32, key: &K) -> Option<TxId> {
        self.partitions
            .get(&partition)
            .and_then(|map| map.get(key).and_then(|e| e.holder.clone()))
    }
}
