use axum::Json;
use axum::extract::Path;
use axum::http::StatusCode;
use axum::{
    Router,
    extract::Extension,
    routing::{get, post},
};
use distributed_cache::cache::TransactionalCache;
use distributed_cache::compute::registry::JobRegistry;
use distributed_cache::compute::router::JobRouter;
use distributed_cache::config::{NodeConfig, ReplicationMode};
use distributed_cache::membership::service::MembershipService;
use distributed_cache::rebalance::Rebalancer;
use distributed_cache::storage::handlers::*;
use distributed_cache::storage::protocol::*;
use std::net::SocketAddr;
use std::sync::Arc;

/// The node binary stores arbitrary JSON documents under string keys.
type CacheValue = serde_json::Value;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        eprintln!(
            "Usage: {} --bind <addr:port> [--seed <addr:port>] [--backups <n>] \
             [--replication sync|best-effort] [--attr key=value]",
            args[0]
        );
        eprintln!("Example: {} --bind 127.0.0.1:5000", args[0]);
        eprintln!(
            "Example: {} --bind 127.0.0.1:5001 --seed 127.0.0.1:5000 --attr deployment.mode=shared",
            args[0]
        );

        std::process::exit(1);
    }

    let mut bind_addr: Option<SocketAddr> = None;
    let mut seed_nodes: Vec<SocketAddr> = vec![];
    let mut backups: Option<usize> = None;
    let mut replication: Option<ReplicationMode> = None;
    let mut attr_overrides: Vec<(String, String)> = vec![];

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" => {
                bind_addr = Some(args[i + 1].parse()?);
                i += 2;
            }
            "--seed" => {
                seed_nodes.push(args[i + 1].parse()?);
                i += 2;
            }
            "--backups" => {
                backups = Some(args[i + 1].parse()?);
                i += 2;
            }
            "--replication" => {
                replication = Some(match args[i + 1].as_str() {
                    "sync" => ReplicationMode::Sync,
                    "best-effort" => ReplicationMode::BestEffort,
                    other => anyhow::bail!("unknown replication mode: {}", other),
                });
                i += 2;
            }
            "--attr" => {
                let (key, value) = args[i + 1]
                    .split_once('=')
                    .ok_or_else(|| anyhow::anyhow!("--attr expects key=value"))?;
                attr_overrides.push((key.to_string(), value.to_string()));
                i += 2;
            }
            _ => {
                i += 1;
            }
        }
    }

    let bind_addr = bind_addr.expect("--bind is required");

    let mut config = NodeConfig::new(bind_addr, seed_nodes);
    if let Some(backups) = backups {
        config.cache.backups = backups;
    }
    if let Some(replication) = replication {
        config.cache.replication = replication;
    }
    for (key, value) in attr_overrides {
        config.attributes.insert(key, value);
    }

    tracing::info!("Starting node on {}", bind_addr);
    if !config.seeds.is_empty() {
        tracing::info!("Seed nodes: {:?}", config.seeds);
    } else {
        tracing::info!("Starting as seed node (founder)");
    }

    // 1. Membership (UDP gossip + join gate):
    let membership =
        MembershipService::new(config.gossip_addr, config.seeds.clone(), config.attributes.clone())
            .await?;
    tracing::info!("Node ID: {:?}", membership.local_node.id);

    // 2. Cache (affinity, partition store, near cache, coordinator):
    let cache: Arc<TransactionalCache<String, CacheValue>> =
        TransactionalCache::new(membership.clone(), config.cache.clone());

    // 3. Compute routing:
    let registry = JobRegistry::new();

    registry.register("touch_key", |node, payload| async move {
        tracing::info!("Executing touch_key on {:?}: {}", node, payload);
        Ok(payload)
    });

    let _router = JobRouter::with_defaults(membership.clone(), registry);

    // 4. HTTP Router:
    let app = Router::new()
        .route(ENDPOINT_PUT, post(handle_put_entry))
        .route(&format!("{}/:key", ENDPOINT_GET), get(handle_get_entry))
        .route(ENDPOINT_LOCK, post(handle_lock_entry))
        .route(ENDPOINT_UNLOCK, post(handle_unlock_entry))
        .route(ENDPOINT_READ, post(handle_read_entry))
        .route(ENDPOINT_VALIDATE, post(handle_validate_entry))
        .route(ENDPOINT_COMMIT_WRITE, post(handle_commit_write_entry))
        .route(ENDPOINT_REPLICATE, post(handle_replicate_entry))
        .route(ENDPOINT_NEAR_PUSH, post(handle_near_push_entry))
        .route(ENDPOINT_NEAR_INVALIDATE, post(handle_near_invalidate_entry))
        .route(
            &format!("{}/:partition", ENDPOINT_PARTITION_DUMP),
            get(handle_partition_dump_entry),
        )
        .layer(Extension(cache.clone()));

    // 5. Spawn membership service and rebalancer:
    let service_clone = membership.clone();
    tokio::spawn(async move {
        service_clone.start().await;
    });

    Rebalancer::new(cache.clone()).start();

    // 6. Spawn stats reporter:
    let stats_cache = cache.clone();
    let stats_membership = membership.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(5));

        loop {
            interval.tick().await;
            let alive = stats_membership.get_alive_members();
            tracing::info!(
                "Cluster stats: {} alive nodes, {} local partitions, {} entries, {} near shadows",
                alive.len(),
                stats_cache.store().local_partition_count(),
                stats_cache.store().local_entry_count(),
                stats_cache.near().shadow_count()
            );
        }
    });

    // 7. Start HTTP server:
    let http_addr = membership.local_node.http_addr;

    tracing::info!("HTTP server listening on {}", http_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// Concrete wrappers over the generic handlers, pinned to the node binary's
// key and value types.

async fn handle_put_entry(
    cache: Extension<Arc<TransactionalCache<String, CacheValue>>>,
    json: Json<PutRequest>,
) -> (StatusCode, Json<PutResponse>) {
    handle_put::<String, CacheValue>(cache, json).await
}

async fn handle_get_entry(
    cache: Extension<Arc<TransactionalCache<String, CacheValue>>>,
    path: Path<String>,
) -> (StatusCode, Json<GetResponse>) {
    handle_get::<String, CacheValue>(cache, path).await
}

async fn handle_lock_entry(
    cache: Extension<Arc<TransactionalCache<String, CacheValue>>>,
    json: Json<LockRequest>,
) -> (StatusCode, Json<LockResponse>) {
    handle_lock::<String, CacheValue>(cache, json).await
}

async fn handle_unlock_entry(
    cache: Extension<Arc<TransactionalCache<String, CacheValue>>>,
    json: Json<UnlockRequest>,
) -> (StatusCode, Json<PutResponse>) {
    handle_unlock::<String, CacheValue>(cache, json).await
}

async fn handle_read_entry(
    cache: Extension<Arc<TransactionalCache<String, CacheValue>>>,
    json: Json<ReadRequest>,
) -> (StatusCode, Json<ReadResponse>) {
    handle_read::<String, CacheValue>(cache, json).await
}

async fn handle_validate_entry(
    cache: Extension<Arc<TransactionalCache<String, CacheValue>>>,
    json: Json<ValidateRequest>,
) -> (StatusCode, Json<ValidateResponse>) {
    handle_validate::<String, CacheValue>(cache, json).await
}

async fn handle_commit_write_entry(
    cache: Extension<Arc<TransactionalCache<String, CacheValue>>>,
    json: Json<CommitWriteRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    handle_commit_write::<String, CacheValue>(cache, json).await
}

async fn handle_replicate_entry(
    cache: Extension<Arc<TransactionalCache<String, CacheValue>>>,
    json: Json<ReplicateRequest>,
) -> (StatusCode, Json<PutResponse>) {
    handle_replicate::<String, CacheValue>(cache, json).await
}

async fn handle_near_push_entry(
    cache: Extension<Arc<TransactionalCache<String, CacheValue>>>,
    json: Json<NearPushRequest>,
) -> (StatusCode, Json<PutResponse>) {
    handle_near_push::<String, CacheValue>(cache, json).await
}

async fn handle_near_invalidate_entry(
    cache: Extension<Arc<TransactionalCache<String, CacheValue>>>,
    json: Json<NearInvalidateRequest>,
) -> (StatusCode, Json<PutResponse>) {
    handle_near_invalidate::<String, CacheValue>(cache, json).await
}

async fn handle_partition_dump_entry(
    cache: Extension<Arc<TransactionalCache<String, CacheValue>>>,
    path: Path<u32>,
) -> (StatusCode, Json<PartitionDumpResponse>) {
    handle_partition_dump::<String, CacheValue>(cache, path).await
}
