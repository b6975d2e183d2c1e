//! Node and cache configuration.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

/// How commit-time writes are pushed to backup replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationMode {
    /// Wait for backup acknowledgments before the commit succeeds.
    /// Commit still succeeds if at least one backup acks; fully unreachable
    /// backups fail the transaction.
    Sync,
    /// Fire replication without gating the commit on it.
    BestEffort,
}

/// Tunables for the partitioned cache on one node.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Number of fixed partitions the keyspace is divided into.
    pub partitions: u32,
    /// Backup replicas per partition (on top of the primary).
    pub backups: usize,
    /// Bound on a single entry-lock wait.
    pub lock_timeout: Duration,
    /// Bounded retries for lock waits and remote round trips.
    pub retry_attempts: usize,
    pub replication: ReplicationMode,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            partitions: 256,
            backups: 1,
            lock_timeout: Duration::from_secs(5),
            retry_attempts: 3,
            replication: ReplicationMode::Sync,
        }
    }
}

/// Full configuration for one cluster node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// UDP address for gossip.
    pub gossip_addr: SocketAddr,
    /// Gossip addresses of seed nodes; empty for the founding node.
    pub seeds: Vec<SocketAddr>,
    /// Cluster-invariant attributes checked once at join time. Every member
    /// must carry identical values; a divergent joiner is rejected.
    pub attributes: BTreeMap<String, String>,
    pub cache: CacheConfig,
}

impl NodeConfig {
    pub fn new(gossip_addr: SocketAddr, seeds: Vec<SocketAddr>) -> Self {
        Self {
            gossip_addr,
            seeds,
            attributes: default_attributes(),
            cache: CacheConfig::default(),
        }
    }
}

/// Attributes every node carries unless overridden on the command line.
pub fn default_attributes() -> BTreeMap<String, String> {
    let mut attrs = BTreeMap::new();
    attrs.insert("network.stack".to_string(), "ipv4".to_string());
    attrs.insert("deployment.mode".to_string(), "shared".to_string());
    attrs
}
