//! Cache Error Taxonomy
//!
//! Typed failures surfaced by the transactional cache. Transport plumbing and
//! HTTP handlers convert these into status codes; callers use `is_retryable`
//! to decide whether re-running a failed transaction can succeed.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    /// A lock wait exceeded the configured bound. The entry is guaranteed
    /// not to be left locked by the failed attempt.
    #[error("lock wait timed out for key '{key}'")]
    LockTimeout { key: String },

    /// A snapshot version recorded at first touch no longer matches the
    /// authoritative version at prepare or commit time.
    #[error("version conflict on key '{key}' (expected {expected}, found {actual})")]
    OptimisticConflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    /// Partition ownership moved mid-transaction. Distinct from a data
    /// conflict: the data may be untouched but the lock no longer proves
    /// authority.
    #[error("ownership of partition {partition} changed during the transaction")]
    PartitionOwnerChanged { partition: u32 },

    /// Join-time attribute mismatch. Fatal to the joiner; requires
    /// reconfiguration, never retried.
    #[error("join rejected: attribute '{attribute}' differs (local '{local}', remote '{remote}')")]
    TopologyRejected {
        attribute: String,
        local: String,
        remote: String,
    },

    /// No backup acknowledged a commit-time replication.
    #[error("replication failed for partition {partition}: {unreachable} backup(s) unreachable")]
    ReplicationFailure { partition: u32, unreachable: usize },

    /// A peer named in the topology could not be resolved or reached.
    #[error("node '{node}' is not reachable")]
    NodeUnavailable { node: String },

    /// Low-level messaging failure after bounded retries.
    #[error("transport error: {0}")]
    Transport(String),

    /// Operation on a transaction that already finished.
    #[error("transaction is {state} and can no longer be used")]
    InvalidState { state: &'static str },

    /// A key string that cannot be parsed into the cache key type.
    /// Never retried.
    #[error("malformed key: {0}")]
    MalformedKey(String),
}

impl CacheError {
    /// Whether re-running the failed transaction can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CacheError::LockTimeout { .. }
                | CacheError::OptimisticConflict { .. }
                | CacheError::PartitionOwnerChanged { .. }
        )
    }
}
