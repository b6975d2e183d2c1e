//! Pessimistic Transaction Coordinator
//!
//! Orchestrates multi-key transactions across Partition Stores and Near
//! Caches. Locks are acquired at each key's primary on first touch, writes
//! buffer locally, and commit runs the prepare/commit sequence:
//! re-validate snapshots, apply writes at primaries, replicate to backups,
//! push to near shadows, release locks.

use crate::config::{CacheConfig, ReplicationMode};
use crate::error::CacheError;
use crate::membership::{service::MembershipService, types::NodeId};
use crate::near::{cache::NearCache, tracker::ShadowTracker};
use crate::storage::entry::LockOutcome;
use crate::storage::partitioner::{AffinityAssignment, PartitionManager, key_hash};
use crate::storage::protocol::*;
use crate::storage::store::PartitionStore;
use crate::tx::types::{Concurrency, Isolation, TxId, TxState};

use dashmap::DashSet;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::hash::Hash;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Extra transport allowance on top of the lock wait bound, so the primary
/// always answers a lock request before the client-side timeout trips.
const LOCK_RPC_MARGIN: Duration = Duration::from_millis(500);
const RPC_TIMEOUT: Duration = Duration::from_millis(500);

pub struct TransactionCoordinator<K, V> {
    membership: Arc<MembershipService>,
    partitioner: Arc<PartitionManager>,
    store: Arc<PartitionStore<K, V>>,
    near: Arc<NearCache<K, V>>,
    shadows: Arc<ShadowTracker>,
    config: CacheConfig,
    /// Backups that missed a commit-time replication; the rebalancer pulls
    /// the partition to bring them back in sync.
    pending_resync: DashSet<(u32, NodeId)>,
    http_client: reqwest::Client,
}

impl<K, V> TransactionCoordinator<K, V>
where
    K: ToString + FromStr + Clone + Hash + Eq + Send + Sync + 'static,
    <K as FromStr>::Err: std::fmt::Display,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(
        membership: Arc<MembershipService>,
        partitioner: Arc<PartitionManager>,
        store: Arc<PartitionStore<K, V>>,
        near: Arc<NearCache<K, V>>,
        shadows: Arc<ShadowTracker>,
        config: CacheConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            membership,
            partitioner,
            store,
            near,
            shadows,
            config,
            pending_resync: DashSet::new(),
            http_client: reqwest::Client::new(),
        })
    }

    pub fn begin(
        self: &Arc<Self>,
        concurrency: Concurrency,
        isolation: Isolation,
    ) -> Transaction<K, V> {
        let assignment = self.partitioner.current_assignment();
        let id = TxId::new();
        tracing::debug!("Started tx {} (topology v{})", id.0, assignment.topology_version);

        Transaction {
            id,
            concurrency,
            isolation,
            state: TxState::Active,
            assignment,
            reads: HashMap::new(),
            writes: HashMap::new(),
            locked: Vec::new(),
            coordinator: self.clone(),
        }
    }

    pub fn local_node_id(&self) -> NodeId {
        self.membership.local_node.id.clone()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<PartitionStore<K, V>> {
        &self.store
    }

    pub fn partitioner(&self) -> &Arc<PartitionManager> {
        &self.partitioner
    }

    pub fn near(&self) -> &Arc<NearCache<K, V>> {
        &self.near
    }

    pub fn shadows(&self) -> &Arc<ShadowTracker> {
        &self.shadows
    }

    pub fn pending_resync_count(&self) -> usize {
        self.pending_resync.len()
    }

    pub fn take_pending_resync(&self, partition: u32) -> bool {
        let flagged: Vec<(u32, NodeId)> = self
            .pending_resync
            .iter()
            .filter(|e| e.key().0 == partition)
            .map(|e| e.key().clone())
            .collect();
        for entry in &flagged {
            self.pending_resync.remove(entry);
        }
        !flagged.is_empty()
    }

    /// Replicates a committed write to the partition's backups, then pushes
    /// the new value to every known near shadow of the key. Shared by the
    /// local commit path and the `commit_write` handler, so the policy is
    /// applied identically for primary- and near-originated transactions.
    ///
    /// Under synchronous replication the commit fails only when every
    /// backup is unreachable; partially reachable backups are flagged for
    /// resync. Near pushes are always best-effort.
    pub async fn replicate_and_push(
        &self,
        partition: u32,
        key_str: &str,
        value_json: &str,
        version: u64,
    ) -> Result<(), CacheError> {
        let local_id = &self.membership.local_node.id;
        let assignment = self.partitioner.current_assignment();
        let backups: Vec<NodeId> = assignment
            .owners(partition)
            .iter()
            .skip(1)
            .filter(|n| *n != local_id)
            .cloned()
            .collect();

        let mut acked = 0usize;
        let mut unreachable = 0usize;

        for backup in &backups {
            let payload = ReplicateRequest {
                partition,
                key: key_str.to_string(),
                value_json: value_json.to_string(),
                version,
            };
            match self
                .post_json::<_, PutResponse>(backup, ENDPOINT_REPLICATE, &payload)
                .await
            {
                Ok(_) => acked += 1,
                Err(e) => {
                    tracing::warn!(
                        "Replication of key '{}' to backup {:?} failed: {}",
                        key_str,
                        backup,
                        e
                    );
                    unreachable += 1;
                    self.pending_resync.insert((partition, backup.clone()));
                }
            }
        }

        if self.config.replication == ReplicationMode::Sync
            && !backups.is_empty()
            && acked == 0
        {
            return Err(CacheError::ReplicationFailure {
                partition,
                unreachable,
            });
        }

        self.push_near_updates(key_str, value_json, version).await;

        Ok(())
    }

    async fn push_near_updates(&self, key_str: &str, value_json: &str, version: u64) {
        let local_id = self.membership.local_node.id.clone();

        for node in self.shadows.nodes_for(key_str) {
            if node == local_id {
                continue;
            }
            let payload = NearPushRequest {
                key: key_str.to_string(),
                value_json: value_json.to_string(),
                version,
                primary: local_id.0.clone(),
            };
            if let Err(e) = self
                .post_json::<_, PutResponse>(&node, ENDPOINT_NEAR_PUSH, &payload)
                .await
            {
                tracing::warn!("Near push of '{}' to {:?} failed: {}", key_str, node, e);
                self.shadows.unregister(key_str, &node);
            }
        }
    }

    /// Read-through at a remote primary, registering this node as a shadow
    /// holder of the key.
    pub async fn remote_read(
        &self,
        primary: &NodeId,
        key_str: &str,
    ) -> Result<ReadResponse, CacheError> {
        let payload = ReadRequest {
            key: key_str.to_string(),
            requester: self.membership.local_node.id.0.clone(),
        };
        self.post_json(primary, ENDPOINT_READ, &payload).await
    }

    // --- Remote operations used by Transaction ---

    async fn remote_lock(
        &self,
        primary: &NodeId,
        request: &LockRequest,
    ) -> Result<LockResponse, CacheError> {
        let addr = self.node_http(primary)?;
        let url = format!("http://{}{}", addr, ENDPOINT_LOCK);
        let rpc_timeout = Duration::from_millis(request.timeout_ms) + LOCK_RPC_MARGIN;

        // A single attempt: the wait bound is enforced server-side, and
        // retrying a lost lock request could strand a grant.
        let response = self
            .http_client
            .post(url)
            .json(request)
            .timeout(rpc_timeout)
            .send()
            .await
            .map_err(|e| CacheError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CacheError::Transport(format!(
                "lock request failed: {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| CacheError::Transport(e.to_string()))
    }

    async fn remote_unlock(&self, primary: &NodeId, tx_id: &TxId, key_str: &str) {
        let payload = UnlockRequest {
            tx_id: tx_id.clone(),
            key: key_str.to_string(),
        };
        if let Err(e) = self
            .post_json::<_, PutResponse>(primary, ENDPOINT_UNLOCK, &payload)
            .await
        {
            tracing::warn!("Unlock of '{}' at {:?} failed: {}", key_str, primary, e);
        }
    }

    async fn remote_validate(
        &self,
        primary: &NodeId,
        entries: Vec<ValidateEntry>,
    ) -> Result<ValidateResponse, CacheError> {
        let payload = ValidateRequest { entries };
        self.post_json(primary, ENDPOINT_VALIDATE, &payload).await
    }

    async fn remote_commit_write(
        &self,
        primary: &NodeId,
        request: &CommitWriteRequest,
    ) -> Result<CommitWriteResponse, CacheError> {
        let addr = self.node_http(primary)?;
        let url = format!("http://{}{}", addr, ENDPOINT_COMMIT_WRITE);

        let response = self
            .post_with_retry(url, request, RPC_TIMEOUT, self.config.retry_attempts)
            .await?;

        match response.status() {
            reqwest::StatusCode::OK => response
                .json()
                .await
                .map_err(|e| CacheError::Transport(e.to_string())),
            reqwest::StatusCode::CONFLICT => {
                let conflict: ValidateConflict = response
                    .json()
                    .await
                    .map_err(|e| CacheError::Transport(e.to_string()))?;
                Err(CacheError::OptimisticConflict {
                    key: conflict.key,
                    expected: conflict.expected,
                    actual: conflict.actual,
                })
            }
            reqwest::StatusCode::LOCKED => {
                let partition = self
                    .partitioner
                    .get_partition(&request.key);
                Err(CacheError::PartitionOwnerChanged { partition })
            }
            reqwest::StatusCode::BAD_GATEWAY => {
                let partition = self.partitioner.get_partition(&request.key);
                Err(CacheError::ReplicationFailure {
                    partition,
                    unreachable: 0,
                })
            }
            status => Err(CacheError::Transport(format!(
                "commit_write failed: {}",
                status
            ))),
        }
    }

    fn node_http(&self, node_id: &NodeId) -> Result<SocketAddr, CacheError> {
        self.membership
            .get_member(node_id)
            .map(|node| node.http_addr)
            .ok_or_else(|| CacheError::NodeUnavailable {
                node: node_id.0.clone(),
            })
    }

    async fn post_json<T: Serialize, R: DeserializeOwned>(
        &self,
        node: &NodeId,
        endpoint: &str,
        payload: &T,
    ) -> Result<R, CacheError> {
        let addr = self.node_http(node)?;
        let url = format!("http://{}{}", addr, endpoint);
        let response = self
            .post_with_retry(url, payload, RPC_TIMEOUT, self.config.retry_attempts)
            .await?;

        if !response.status().is_success() {
            return Err(CacheError::Transport(format!(
                "{} failed: {}",
                endpoint,
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| CacheError::Transport(e.to_string()))
    }

    async fn post_with_retry<T: Serialize>(
        &self,
        url: String,
        payload: &T,
        timeout: Duration,
        attempts: usize,
    ) -> Result<reqwest::Response, CacheError> {
        let mut delay_ms = 150u64;

        for attempt in 0..attempts {
            let response = self
                .http_client
                .post(url.clone())
                .json(payload)
                .timeout(timeout)
                .send()
                .await;

            match response {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    if attempt + 1 == attempts {
                        return Err(CacheError::Transport(e.to_string()));
                    }
                    // Simple jitter to prevent thundering herd
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
            }
        }

        Err(CacheError::Transport("retry attempts exhausted".to_string()))
    }
}

/// Value and version of a key at first touch; the transaction's repeatable
/// read snapshot.
struct ReadRecord<V> {
    value: Option<V>,
    version: u64,
}

struct LockedKey<K> {
    key: K,
    key_str: String,
    partition: u32,
    primary: NodeId,
    local: bool,
}

/// One pessimistic, repeatable-read transaction.
///
/// Exclusively owned by its originating session; never shared across nodes.
/// Locks are taken at each key's primary on first access and held until
/// `commit` or `rollback` releases them.
pub struct Transaction<K, V>
where
    K: ToString + FromStr + Clone + Hash + Eq + Send + Sync + 'static,
    <K as FromStr>::Err: std::fmt::Display,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    id: TxId,
    concurrency: Concurrency,
    isolation: Isolation,
    state: TxState,
    /// Owner lists observed when the transaction started. Lock placement
    /// uses this fixed view; prepare re-checks it against the current one.
    assignment: Arc<AffinityAssignment>,
    reads: HashMap<K, ReadRecord<V>>,
    writes: HashMap<K, V>,
    locked: Vec<LockedKey<K>>,
    coordinator: Arc<TransactionCoordinator<K, V>>,
}

impl<K, V> Transaction<K, V>
where
    K: ToString + FromStr + Clone + Hash + Eq + Send + Sync + 'static,
    <K as FromStr>::Err: std::fmt::Display,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn id(&self) -> &TxId {
        &self.id
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn concurrency(&self) -> Concurrency {
        self.concurrency
    }

    pub fn isolation(&self) -> Isolation {
        self.isolation
    }

    /// Reads a key under this transaction. The first touch acquires the
    /// entry lock at the primary and pins the snapshot; re-reads return the
    /// same value for the transaction's duration. A buffered write shadows
    /// the snapshot.
    pub async fn get(&mut self, key: &K) -> Result<Option<V>, CacheError> {
        self.ensure_active()?;

        if let Some(pending) = self.writes.get(key) {
            return Ok(Some(pending.clone()));
        }

        self.ensure_locked(key).await?;
        Ok(self.reads.get(key).and_then(|r| r.value.clone()))
    }

    /// Buffers a write. The entry lock is taken on first touch; the
    /// Partition Store is not mutated until commit.
    pub async fn put(&mut self, key: K, value: V) -> Result<(), CacheError> {
        self.ensure_active()?;
        self.ensure_locked(&key).await?;
        self.writes.insert(key, value);
        Ok(())
    }

    /// Acquires locks for several keys in the fixed global order (ascending
    /// key hash, then key), preventing cross-transaction deadlock when
    /// transactions touch overlapping key sets.
    pub async fn lock_keys(&mut self, keys: &[K]) -> Result<(), CacheError> {
        self.ensure_active()?;

        let mut ordered: Vec<K> = keys.to_vec();
        ordered.sort_by_key(|k| {
            let s = k.to_string();
            (key_hash(&s), s)
        });

        for key in &ordered {
            self.ensure_locked(key).await?;
        }
        Ok(())
    }

    /// Commits the transaction: re-validates every snapshot (Preparing),
    /// applies buffered writes to primaries, replicates, pushes near
    /// updates (Committing), then releases all locks.
    ///
    /// Any prepare failure rolls back with no write visible. Once a write
    /// reaches a primary during Committing it is irrevocable.
    pub async fn commit(mut self) -> Result<(), CacheError> {
        self.ensure_active()?;

        self.state = TxState::Preparing;
        if let Err(e) = self.prepare().await {
            tracing::debug!("Tx {} failed prepare: {}", self.id.0, e);
            self.writes.clear();
            self.release_locks().await;
            self.state = TxState::RolledBack;
            return Err(e);
        }

        self.state = TxState::Committing;
        let result = self.apply_writes().await;
        self.release_locks().await;

        match result {
            Ok(()) => {
                self.state = TxState::Committed;
                tracing::debug!("Tx {} committed", self.id.0);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Tx {} failed during commit: {}", self.id.0, e);
                self.state = TxState::RolledBack;
                Err(e)
            }
        }
    }

    /// Discards the write set and releases every held lock. No partial
    /// write becomes visible: the Partition Store is only mutated during
    /// Committing.
    pub async fn rollback(mut self) -> Result<(), CacheError> {
        self.ensure_active()?;
        self.writes.clear();
        self.release_locks().await;
        self.state = TxState::RolledBack;
        tracing::debug!("Tx {} rolled back", self.id.0);
        Ok(())
    }

    fn ensure_active(&self) -> Result<(), CacheError> {
        if self.state != TxState::Active {
            return Err(CacheError::InvalidState {
                state: self.state.name(),
            });
        }
        Ok(())
    }

    /// First-touch protocol for one key: resolve the primary under the
    /// transaction's affinity view, acquire the entry lock there, record
    /// the snapshot (value, version). Lock waits are retried up to the
    /// configured bound before surfacing `LockTimeout`.
    async fn ensure_locked(&mut self, key: &K) -> Result<(), CacheError> {
        if self.reads.contains_key(key) {
            return Ok(());
        }

        let key_str = key.to_string();
        let coordinator = self.coordinator.clone();
        let partition = coordinator.partitioner.get_partition(&key_str);

        let Some(primary) = self.assignment.owners(partition).first().cloned() else {
            return Err(CacheError::Transport(format!(
                "no alive owners for partition {partition}"
            )));
        };
        let local = primary == coordinator.membership.local_node.id;
        let lock_timeout = coordinator.config.lock_timeout;

        for attempt in 0..coordinator.config.retry_attempts {
            if local {
                match coordinator
                    .store
                    .try_lock(partition, key, &self.id, lock_timeout)
                    .await
                {
                    LockOutcome::Acquired => {
                        let (value, version) = coordinator.store.read(partition, key);
                        self.record_touch(
                            LockedKey {
                                key: key.clone(),
                                key_str,
                                partition,
                                primary,
                                local,
                            },
                            value,
                            version,
                        );
                        return Ok(());
                    }
                    LockOutcome::TimedOut => {
                        tracing::debug!(
                            "Tx {} lock wait on '{}' timed out (attempt {})",
                            self.id.0,
                            key_str,
                            attempt + 1
                        );
                        continue;
                    }
                }
            }

            let request = LockRequest {
                tx_id: self.id.clone(),
                key: key_str.clone(),
                timeout_ms: lock_timeout.as_millis() as u64,
                requester: coordinator.membership.local_node.id.0.clone(),
            };
            match coordinator.remote_lock(&primary, &request).await {
                Ok(response) if response.acquired => {
                    let value = match &response.value_json {
                        Some(json) => Some(
                            serde_json::from_str::<V>(json)
                                .map_err(|e| CacheError::Transport(e.to_string()))?,
                        ),
                        None => None,
                    };
                    // The lock response doubles as the shadow's seed copy.
                    if let Some(v) = &value {
                        coordinator.near.update(
                            key.clone(),
                            v.clone(),
                            response.version,
                            primary.clone(),
                        );
                    }
                    let version = response.version;
                    self.record_touch(
                        LockedKey {
                            key: key.clone(),
                            key_str,
                            partition,
                            primary,
                            local,
                        },
                        value,
                        version,
                    );
                    return Ok(());
                }
                Ok(_) => continue,
                Err(e) => {
                    // The request may have died after the primary granted;
                    // a best-effort unlock keeps the entry from staying
                    // locked by this failed attempt.
                    coordinator.remote_unlock(&primary, &self.id, &key_str).await;
                    return Err(e);
                }
            }
        }

        Err(CacheError::LockTimeout { key: key_str })
    }

    fn record_touch(&mut self, locked: LockedKey<K>, value: Option<V>, version: u64) {
        self.reads
            .insert(locked.key.clone(), ReadRecord { value, version });
        self.locked.push(locked);
    }

    /// Preparing: every touched key's primary must be unchanged under the
    /// current topology, and every recorded snapshot version must still
    /// match the authoritative one. The second check holds even with locks
    /// held, because ownership may have moved mid-transaction.
    async fn prepare(&self) -> Result<(), CacheError> {
        let coordinator = &self.coordinator;
        let current = coordinator.partitioner.current_assignment();

        let mut remote_batches: HashMap<NodeId, Vec<ValidateEntry>> = HashMap::new();

        for lk in &self.locked {
            if current.primary(lk.partition) != Some(&lk.primary) {
                return Err(CacheError::PartitionOwnerChanged {
                    partition: lk.partition,
                });
            }

            let expected = self.reads[&lk.key].version;
            if lk.local {
                let (_, actual) = coordinator.store.read(lk.partition, &lk.key);
                if actual != expected {
                    return Err(CacheError::OptimisticConflict {
                        key: lk.key_str.clone(),
                        expected,
                        actual,
                    });
                }
            } else {
                remote_batches
                    .entry(lk.primary.clone())
                    .or_default()
                    .push(ValidateEntry {
                        key: lk.key_str.clone(),
                        expected_version: expected,
                    });
            }
        }

        for (primary, entries) in remote_batches {
            let response = coordinator.remote_validate(&primary, entries).await?;
            if let Some(conflict) = response.conflict {
                return Err(CacheError::OptimisticConflict {
                    key: conflict.key,
                    expected: conflict.expected,
                    actual: conflict.actual,
                });
            }
        }

        Ok(())
    }

    /// Committing: buffered writes land on their primaries in the fixed
    /// global key order, each guarded by its snapshot version. Replication
    /// and near pushes happen per write; the primary of a remote key runs
    /// them in its commit_write handler.
    async fn apply_writes(&mut self) -> Result<(), CacheError> {
        let coordinator = self.coordinator.clone();

        let mut write_order: Vec<usize> = (0..self.locked.len())
            .filter(|&i| self.writes.contains_key(&self.locked[i].key))
            .collect();
        write_order.sort_by_key(|&i| {
            let s = &self.locked[i].key_str;
            (key_hash(s), s.clone())
        });

        for i in write_order {
            let lk = &self.locked[i];
            let value = self.writes[&lk.key].clone();
            let expected = self.reads[&lk.key].version;
            let value_json = serde_json::to_string(&value)
                .map_err(|e| CacheError::Transport(e.to_string()))?;

            let new_version = if lk.local {
                let version = coordinator.store.write(
                    lk.partition,
                    &lk.key,
                    value.clone(),
                    expected,
                    &self.id,
                )?;
                coordinator
                    .replicate_and_push(lk.partition, &lk.key_str, &value_json, version)
                    .await?;
                version
            } else {
                let request = CommitWriteRequest {
                    tx_id: self.id.clone(),
                    key: lk.key_str.clone(),
                    value_json: value_json.clone(),
                    expected_version: expected,
                };
                let response = coordinator.remote_commit_write(&lk.primary, &request).await?;
                // Refresh our own shadow so a local re-read after commit
                // sees at least this version.
                coordinator.near.update(
                    lk.key.clone(),
                    value.clone(),
                    response.new_version,
                    lk.primary.clone(),
                );
                response.new_version
            };

            tracing::debug!(
                "Tx {} wrote '{}' at version {}",
                self.id.0,
                lk.key_str,
                new_version
            );
        }

        Ok(())
    }

    /// Releases every held lock, local or remote, in any order.
    async fn release_locks(&mut self) {
        let coordinator = self.coordinator.clone();

        for lk in self.locked.drain(..) {
            if lk.local {
                coordinator.store.unlock(lk.partition, &lk.key, &self.id);
            } else {
                coordinator
                    .remote_unlock(&lk.primary, &self.id, &lk.key_str)
                    .await;
            }
        }
    }
}
