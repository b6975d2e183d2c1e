use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
};
use serde::{Serialize, de::DeserializeOwned};
use std::hash::Hash;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use super::entry::LockOutcome;
use super::protocol::*;
use crate::cache::TransactionalCache;
use crate::error::CacheError;
use crate::membership::types::NodeId;

/// Ceiling on a remotely requested lock wait, so a malformed request cannot
/// park a handler indefinitely.
const MAX_REMOTE_LOCK_WAIT_MS: u64 = 30_000;

pub async fn handle_put<K, V>(
    Extension(cache): Extension<Arc<TransactionalCache<K, V>>>,
    Json(req): Json<PutRequest>,
) -> (StatusCode, Json<PutResponse>)
where
    K: ToString + FromStr + Clone + Hash + Eq + Send + Sync + 'static,
    <K as FromStr>::Err: std::fmt::Display,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let key: K = match req.key.parse() {
        Ok(k) => k,
        Err(e) => {
            tracing::error!("Failed to parse key: {}", e);
            return (StatusCode::BAD_REQUEST, Json(PutResponse { success: false }));
        }
    };

    let value: V = match serde_json::from_str(&req.value_json) {
        Ok(v) => v,
        Err(e) => {
            tracing::error!("Failed to deserialize value: {}", e);
            return (StatusCode::BAD_REQUEST, Json(PutResponse { success: false }));
        }
    };

    match cache.put(key, value).await {
        Ok(_) => (StatusCode::OK, Json(PutResponse { success: true })),
        Err(e) => {
            tracing::error!("Failed to put: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(PutResponse { success: false }),
            )
        }
    }
}

pub async fn handle_get<K, V>(
    Extension(cache): Extension<Arc<TransactionalCache<K, V>>>,
    Path(key_str): Path<String>,
) -> (StatusCode, Json<GetResponse>)
where
    K: ToString + FromStr + Clone + Hash + Eq + Send + Sync + 'static,
    <K as FromStr>::Err: std::fmt::Display,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let key: K = match key_str.parse() {
        Ok(k) => k,
        Err(e) => {
            tracing::error!("Failed to parse key: {}", e);
            return (
                StatusCode::BAD_REQUEST,
                Json(GetResponse { value_json: None }),
            );
        }
    };

    match cache.get(&key).await {
        Ok(Some(value)) => match serde_json::to_string(&value) {
            Ok(value_json) => (
                StatusCode::OK,
                Json(GetResponse {
                    value_json: Some(value_json),
                }),
            ),
            Err(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(GetResponse { value_json: None }),
            ),
        },
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(GetResponse { value_json: None }),
        ),
        Err(e) => {
            tracing::error!("Failed to get: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(GetResponse { value_json: None }),
            )
        }
    }
}

/// Entry-lock acquisition at this primary. The response carries the value
/// and version under the held lock, which the requester records as its read
/// snapshot. A non-owning requester is registered as a shadow holder.
pub async fn handle_lock<K, V>(
    Extension(cache): Extension<Arc<TransactionalCache<K, V>>>,
    Json(req): Json<LockRequest>,
) -> (StatusCode, Json<LockResponse>)
where
    K: ToString + FromStr + Clone + Hash + Eq + Send + Sync + 'static,
    <K as FromStr>::Err: std::fmt::Display,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let not_acquired = || {
        Json(LockResponse {
            acquired: false,
            value_json: None,
            version: 0,
        })
    };

    let key: K = match req.key.parse() {
        Ok(k) => k,
        Err(e) => {
            tracing::error!("Failed to parse key: {}", e);
            return (StatusCode::BAD_REQUEST, not_acquired());
        }
    };

    let partition = cache.partitioner().get_partition(&req.key);
    let wait = Duration::from_millis(req.timeout_ms.min(MAX_REMOTE_LOCK_WAIT_MS));

    match cache
        .store()
        .try_lock(partition, &key, &req.tx_id, wait)
        .await
    {
        LockOutcome::Acquired => {
            let (value, version) = cache.store().read(partition, &key);
            let value_json = match value.map(|v| serde_json::to_string(&v)).transpose() {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!("Failed to serialize value: {}", e);
                    cache.store().unlock(partition, &key, &req.tx_id);
                    return (StatusCode::INTERNAL_SERVER_ERROR, not_acquired());
                }
            };

            let requester = NodeId(req.requester);
            if requester != cache.membership().local_node.id {
                cache.shadows().register(&req.key, requester);
            }

            (
                StatusCode::OK,
                Json(LockResponse {
                    acquired: true,
                    value_json,
                    version,
                }),
            )
        }
        LockOutcome::TimedOut => (StatusCode::OK, not_acquired()),
    }
}

pub async fn handle_unlock<K, V>(
    Extension(cache): Extension<Arc<TransactionalCache<K, V>>>,
    Json(req): Json<UnlockRequest>,
) -> (StatusCode, Json<PutResponse>)
where
    K: ToString + FromStr + Clone + Hash + Eq + Send + Sync + 'static,
    <K as FromStr>::Err: std::fmt::Display,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let key: K = match req.key.parse() {
        Ok(k) => k,
        Err(e) => {
            tracing::error!("Failed to parse key: {}", e);
            return (StatusCode::BAD_REQUEST, Json(PutResponse { success: false }));
        }
    };

    let partition = cache.partitioner().get_partition(&req.key);
    cache.store().unlock(partition, &key, &req.tx_id);
    (StatusCode::OK, Json(PutResponse { success: true }))
}

/// Authoritative read at this primary, registering the requester as a
/// shadow holder so later commits push the fresh value to it.
pub async fn handle_read<K, V>(
    Extension(cache): Extension<Arc<TransactionalCache<K, V>>>,
    Json(req): Json<ReadRequest>,
) -> (StatusCode, Json<ReadResponse>)
where
    K: ToString + FromStr + Clone + Hash + Eq + Send + Sync + 'static,
    <K as FromStr>::Err: std::fmt::Display,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let key: K = match req.key.parse() {
        Ok(k) => k,
        Err(e) => {
            tracing::error!("Failed to parse key: {}", e);
            return (
                StatusCode::BAD_REQUEST,
                Json(ReadResponse {
                    value_json: None,
                    version: 0,
                }),
            );
        }
    };

    let partition = cache.partitioner().get_partition(&req.key);
    let (value, version) = cache.store().read(partition, &key);

    let value_json = match value.map(|v| serde_json::to_string(&v)).transpose() {
        Ok(json) => json,
        Err(e) => {
            tracing::error!("Failed to serialize value: {}", e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ReadResponse {
                    value_json: None,
                    version: 0,
                }),
            );
        }
    };

    let requester = NodeId(req.requester);
    if requester != cache.membership().local_node.id {
        cache.shadows().register(&req.key, requester);
    }

    (
        StatusCode::OK,
        Json(ReadResponse {
            value_json,
            version,
        }),
    )
}

/// Prepare-time re-validation: checks each recorded snapshot version
/// against the authoritative one, reporting the first stale entry.
pub async fn handle_validate<K, V>(
    Extension(cache): Extension<Arc<TransactionalCache<K, V>>>,
    Json(req): Json<ValidateRequest>,
) -> (StatusCode, Json<ValidateResponse>)
where
    K: ToString + FromStr + Clone + Hash + Eq + Send + Sync + 'static,
    <K as FromStr>::Err: std::fmt::Display,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    for entry in &req.entries {
        let key: K = match entry.key.parse() {
            Ok(k) => k,
            Err(e) => {
                tracing::error!("Failed to parse key: {}", e);
                return (
                    StatusCode::BAD_REQUEST,
                    Json(ValidateResponse { conflict: None }),
                );
            }
        };

        let partition = cache.partitioner().get_partition(&entry.key);
        let (_, actual) = cache.store().read(partition, &key);
        if actual != entry.expected_version {
            return (
                StatusCode::OK,
                Json(ValidateResponse {
                    conflict: Some(ValidateConflict {
                        key: entry.key.clone(),
                        expected: entry.expected_version,
                        actual,
                    }),
                }),
            );
        }
    }

    (StatusCode::OK, Json(ValidateResponse { conflict: None }))
}

/// Commit-time write at this primary on behalf of a remote transaction.
/// Applies the versioned write, then runs replication and near pushes
/// exactly as a locally originated commit would.
///
/// Status mapping: 409 = stale expected version, 423 = lock not held by
/// the transaction, 502 = every backup unreachable under sync replication.
pub async fn handle_commit_write<K, V>(
    Extension(cache): Extension<Arc<TransactionalCache<K, V>>>,
    Json(req): Json<CommitWriteRequest>,
) -> (StatusCode, Json<serde_json::Value>)
where
    K: ToString + FromStr + Clone + Hash + Eq + Send + Sync + 'static,
    <K as FromStr>::Err: std::fmt::Display,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let key: K = match req.key.parse() {
        Ok(k) => k,
        Err(e) => {
            tracing::error!("Failed to parse key: {}", e);
            return (StatusCode::BAD_REQUEST, Json(serde_json::Value::Null));
        }
    };

    let value: V = match serde_json::from_str(&req.value_json) {
        Ok(v) => v,
        Err(e) => {
            tracing::error!("Failed to deserialize value: {}", e);
            return (StatusCode::BAD_REQUEST, Json(serde_json::Value::Null));
        }
    };

    let partition = cache.partitioner().get_partition(&req.key);

    let new_version = match cache.store().write(
        partition,
        &key,
        value,
        req.expected_version,
        &req.tx_id,
    ) {
        Ok(version) => version,
        Err(CacheError::OptimisticConflict {
            key,
            expected,
            actual,
        }) => {
            let conflict = ValidateConflict {
                key,
                expected,
                actual,
            };
            return (
                StatusCode::CONFLICT,
                Json(serde_json::to_value(conflict).unwrap_or_default()),
            );
        }
        Err(e) => {
            tracing::error!("Commit write rejected: {}", e);
            return (StatusCode::LOCKED, Json(serde_json::Value::Null));
        }
    };

    if let Err(e) = cache
        .coordinator()
        .replicate_and_push(partition, &req.key, &req.value_json, new_version)
        .await
    {
        tracing::error!("Replication failed for key '{}': {}", req.key, e);
        return (StatusCode::BAD_GATEWAY, Json(serde_json::Value::Null));
    }

    let response = CommitWriteResponse { new_version };
    (
        StatusCode::OK,
        Json(serde_json::to_value(response).unwrap_or_default()),
    )
}

/// Backup-side apply of a replicated write. Idempotent, last-version-wins,
/// never locks.
pub async fn handle_replicate<K, V>(
    Extension(cache): Extension<Arc<TransactionalCache<K, V>>>,
    Json(req): Json<ReplicateRequest>,
) -> (StatusCode, Json<PutResponse>)
where
    K: ToString + FromStr + Clone + Hash + Eq + Send + Sync + 'static,
    <K as FromStr>::Err: std::fmt::Display,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let key: K = match req.key.parse() {
        Ok(k) => k,
        Err(e) => {
            tracing::error!("Failed to parse key: {}", e);
            return (StatusCode::BAD_REQUEST, Json(PutResponse { success: false }));
        }
    };

    let value: V = match serde_json::from_str(&req.value_json) {
        Ok(v) => v,
        Err(e) => {
            tracing::error!("Failed to deserialize value: {}", e);
            return (StatusCode::BAD_REQUEST, Json(PutResponse { success: false }));
        }
    };

    cache
        .store()
        .apply_replicated(req.partition, key, value, req.version);
    tracing::debug!(
        "Stored replica of '{}' v{} for partition {}",
        req.key,
        req.version,
        req.partition
    );
    (StatusCode::OK, Json(PutResponse { success: true }))
}

/// Post-commit refresh of a local near shadow. The monotonic version rule
/// in the near cache makes stale or duplicated pushes harmless.
pub async fn handle_near_push<K, V>(
    Extension(cache): Extension<Arc<TransactionalCache<K, V>>>,
    Json(req): Json<NearPushRequest>,
) -> (StatusCode, Json<PutResponse>)
where
    K: ToString + FromStr + Clone + Hash + Eq + Send + Sync + 'static,
    <K as FromStr>::Err: std::fmt::Display,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let key: K = match req.key.parse() {
        Ok(k) => k,
        Err(e) => {
            tracing::error!("Failed to parse key: {}", e);
            return (StatusCode::BAD_REQUEST, Json(PutResponse { success: false }));
        }
    };

    let value: V = match serde_json::from_str(&req.value_json) {
        Ok(v) => v,
        Err(e) => {
            tracing::error!("Failed to deserialize value: {}", e);
            return (StatusCode::BAD_REQUEST, Json(PutResponse { success: false }));
        }
    };

    cache
        .near()
        .update(key, value, req.version, NodeId(req.primary));
    (StatusCode::OK, Json(PutResponse { success: true }))
}

pub async fn handle_near_invalidate<K, V>(
    Extension(cache): Extension<Arc<TransactionalCache<K, V>>>,
    Json(req): Json<NearInvalidateRequest>,
) -> (StatusCode, Json<PutResponse>)
where
    K: ToString + FromStr + Clone + Hash + Eq + Send + Sync + 'static,
    <K as FromStr>::Err: std::fmt::Display,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let key: K = match req.key.parse() {
        Ok(k) => k,
        Err(e) => {
            tracing::error!("Failed to parse key: {}", e);
            return (StatusCode::BAD_REQUEST, Json(PutResponse { success: false }));
        }
    };

    cache.near().invalidate(&key);
    (StatusCode::OK, Json(PutResponse { success: true }))
}

/// Bulk transfer of one partition's committed state, used by peers picking
/// up ownership after a topology change.
pub async fn handle_partition_dump<K, V>(
    Extension(cache): Extension<Arc<TransactionalCache<K, V>>>,
    Path(partition): Path<u32>,
) -> (StatusCode, Json<PartitionDumpResponse>)
where
    K: ToString + FromStr + Clone + Hash + Eq + Send + Sync + 'static,
    <K as FromStr>::Err: std::fmt::Display,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let entries = cache
        .store()
        .dump_partition(partition)
        .into_iter()
        .filter_map(|(key, value, version)| match serde_json::to_string(&value) {
            Ok(value_json) => Some(VersionedEntryJson {
                key: key.to_string(),
                value_json,
                version,
            }),
            Err(e) => {
                tracing::warn!("Failed to serialize partition entry: {}", e);
                None
            }
        })
        .collect();

    (
        StatusCode::OK,
        Json(PartitionDumpResponse { partition, entries }),
    )
}
