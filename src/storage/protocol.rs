//! Storage Network Protocol
//!
//! Defines the API endpoints and Data Transfer Objects (DTOs) used for
//! internode coordination: entry locking, commit writes, replication,
//! near-cache pushes, and partition transfer.
//!
//! These structures are serialized via JSON and sent over HTTP. Values
//! travel as serialized JSON strings so the handlers stay generic over the
//! cached value type.

use crate::tx::types::TxId;
use serde::{Deserialize, Serialize};

// --- API Endpoints ---

/// Public endpoint for client write requests (implicit transaction).
pub const ENDPOINT_PUT: &str = "/put";
/// Public endpoint for client read requests.
pub const ENDPOINT_GET: &str = "/get";
/// Acquire an entry lock at the partition's primary, returning the
/// current value and version under that lock.
pub const ENDPOINT_LOCK: &str = "/internal/lock";
/// Release an entry lock.
pub const ENDPOINT_UNLOCK: &str = "/internal/unlock";
/// Read (value, version) at the primary, registering a near shadow for
/// the requester.
pub const ENDPOINT_READ: &str = "/internal/read";
/// Prepare-time snapshot re-validation against authoritative versions.
pub const ENDPOINT_VALIDATE: &str = "/internal/validate";
/// Apply one buffered write at the primary during commit.
pub const ENDPOINT_COMMIT_WRITE: &str = "/internal/commit_write";
/// Synchronize a committed write from a Primary to a Backup node.
pub const ENDPOINT_REPLICATE: &str = "/internal/replicate";
/// Post-commit push of a new (value, version) to a shadow holder.
pub const ENDPOINT_NEAR_PUSH: &str = "/internal/near_push";
/// Drop a shadow outright (entry removed or shadow stale beyond repair).
pub const ENDPOINT_NEAR_INVALIDATE: &str = "/internal/near_invalidate";
/// Internal endpoint for bulk partition transfer (rebalancing).
pub const ENDPOINT_PARTITION_DUMP: &str = "/internal/partition";

// --- Data Transfer Objects ---

/// Lock request sent to a key's primary. Carries the requester identity so
/// the primary can track a near shadow for non-owning nodes, and a bound on
/// the wait so a busy entry never parks the caller indefinitely.
#[derive(Debug, Serialize, Deserialize)]
pub struct LockRequest {
    pub tx_id: TxId,
    pub key: String,
    pub timeout_ms: u64,
    /// Node id of the requester; non-owners get a shadow registered.
    pub requester: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LockResponse {
    pub acquired: bool,
    /// Value and version under the held lock; the requester records these
    /// as its read snapshot.
    pub value_json: Option<String>,
    pub version: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UnlockRequest {
    pub tx_id: TxId,
    pub key: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReadRequest {
    pub key: String,
    pub requester: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReadResponse {
    pub value_json: Option<String>,
    pub version: u64,
}

/// One key's recorded snapshot version, re-checked at prepare time.
#[derive(Debug, Serialize, Deserialize)]
pub struct ValidateEntry {
    pub key: String,
    pub expected_version: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ValidateRequest {
    pub entries: Vec<ValidateEntry>,
}

/// The first stale entry found, if any. `None` means every snapshot still
/// matches the authoritative version.
#[derive(Debug, Serialize, Deserialize)]
pub struct ValidateResponse {
    pub conflict: Option<ValidateConflict>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ValidateConflict {
    pub key: String,
    pub expected: u64,
    pub actual: u64,
}

/// Commit-time write applied at the primary. The expected version defends
/// against ownership reassignment even though the lock is held.
#[derive(Debug, Serialize, Deserialize)]
pub struct CommitWriteRequest {
    pub tx_id: TxId,
    pub key: String,
    pub value_json: String,
    pub expected_version: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CommitWriteResponse {
    pub new_version: u64,
}

/// Payload for synchronizing a committed write from a Primary to a Backup.
///
/// Carries the authoritative version; the backup applies last-version-wins,
/// so retried or reordered replication requests are harmless.
#[derive(Debug, Serialize, Deserialize)]
pub struct ReplicateRequest {
    pub partition: u32,
    pub key: String,
    pub value_json: String,
    pub version: u64,
}

/// Post-commit near-cache refresh for one shadow holder.
#[derive(Debug, Serialize, Deserialize)]
pub struct NearPushRequest {
    pub key: String,
    pub value_json: String,
    pub version: u64,
    /// The pushing primary, recorded as the shadow's owner hint.
    pub primary: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NearInvalidateRequest {
    pub key: String,
}

/// Standard client request for writing data.
#[derive(Debug, Serialize, Deserialize)]
pub struct PutRequest {
    pub key: String,
    pub value_json: String,
}

/// Standard acknowledgment for write operations.
#[derive(Debug, Serialize, Deserialize)]
pub struct PutResponse {
    pub success: bool,
}

/// Standard response for data retrieval.
#[derive(Debug, Serialize, Deserialize)]
pub struct GetResponse {
    pub value_json: Option<String>,
}

/// A single versioned key-value pair used in bulk transfer.
#[derive(Debug, Serialize, Deserialize)]
pub struct VersionedEntryJson {
    pub key: String,
    pub value_json: String,
    pub version: u64,
}

/// Response format for partition dump requests.
///
/// Contains the complete committed dataset for a specific partition, used
/// to bring newly assigned owners up to date after a topology change.
#[derive(Debug, Serialize, Deserialize)]
pub struct PartitionDumpResponse {
    pub partition: u32,
    pub entries: Vec<VersionedEntryJson>,
}
