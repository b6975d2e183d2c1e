//! Rebalancing Glue
//!
//! Watches the topology version and reconciles local state after every
//! membership change: newly owned partitions are pulled from their previous
//! owners, and near shadows for partitions whose primary moved are dropped
//! (they rebuild lazily on next access).

use crate::cache::TransactionalCache;
use crate::error::CacheError;
use crate::membership::types::NodeId;
use crate::storage::protocol::{ENDPOINT_PARTITION_DUMP, PartitionDumpResponse};

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::hash::Hash;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

pub struct Rebalancer<K, V> {
    cache: Arc<TransactionalCache<K, V>>,
    http_client: reqwest::Client,
}

impl<K, V> Rebalancer<K, V>
where
    K: ToString + FromStr + Clone + Hash + Eq + Send + Sync + 'static,
    <K as FromStr>::Err: std::fmt::Display,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(cache: Arc<TransactionalCache<K, V>>) -> Arc<Self> {
        Arc::new(Self {
            cache,
            http_client: reqwest::Client::new(),
        })
    }

    /// Spawns the watch loop and returns immediately.
    pub fn start(self: Arc<Self>) {
        let mut topology_rx = self.cache.membership().subscribe_topology();

        tokio::spawn(async move {
            loop {
                if topology_rx.changed().await.is_err() {
                    break;
                }
                let version = *topology_rx.borrow_and_update();
                tracing::info!("Topology changed (v{}), rebalancing", version);
                self.handle_topology_change().await;
            }
        });
    }

    async fn handle_topology_change(&self) {
        let partitioner = self.cache.partitioner();
        let current = partitioner.current_assignment();
        let previous = partitioner.previous_assignment();
        let local_id = self.cache.membership().local_node.id.clone();

        let mut moved_primaries = Vec::new();
        let mut to_fetch: Vec<(u32, Vec<NodeId>)> = Vec::new();

        for partition in 0..partitioner.num_partitions {
            let now_owners = current.owners(partition);
            let then_owners = previous.as_ref().map(|p| p.owners(partition));

            if let Some(then) = then_owners
                && then.first() != now_owners.first()
            {
                moved_primaries.push(partition);
            }

            let owned_now = now_owners.contains(&local_id);
            let owned_then = then_owners.is_some_and(|then| then.contains(&local_id));

            if owned_now && !owned_then && !self.cache.store().has_partition(partition) {
                // Prefer the previous owners; they hold the authoritative copy.
                let sources: Vec<NodeId> = then_owners
                    .map(|then| then.to_vec())
                    .unwrap_or_else(|| now_owners.to_vec())
                    .into_iter()
                    .filter(|n| *n != local_id)
                    .collect();
                if !sources.is_empty() {
                    to_fetch.push((partition, sources));
                }
            }
        }

        if !moved_primaries.is_empty() {
            tracing::info!(
                "Dropping near shadows for {} partitions with moved primaries",
                moved_primaries.len()
            );
            self.cache.near().drop_for_partitions(&moved_primaries);
            self.cache
                .shadows()
                .drop_for_partitions(&moved_primaries, partitioner);
        }

        for (partition, sources) in to_fetch {
            for source in &sources {
                match self.fetch_partition(source, partition).await {
                    Ok(entries) => {
                        let count = entries.len();
                        self.cache.store().apply_partition_entries(partition, entries);
                        tracing::info!(
                            "Pulled {} entries of partition {} from {:?}",
                            count,
                            partition,
                            source
                        );
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Failed to pull partition {} from {:?}: {}",
                            partition,
                            source,
                            e
                        );
                    }
                }
            }
        }
    }

    /// Fetches all committed entries of a partition from a peer.
    async fn fetch_partition(
        &self,
        owner_id: &NodeId,
        partition: u32,
    ) -> Result<Vec<(K, V, u64)>, CacheError> {
        let node = self
            .cache
            .membership()
            .get_member(owner_id)
            .ok_or_else(|| CacheError::NodeUnavailable {
                node: owner_id.0.clone(),
            })?;

        let url = format!(
            "http://{}{}/{}",
            node.http_addr, ENDPOINT_PARTITION_DUMP, partition
        );

        let response = self
            .get_with_retry(url, Duration::from_millis(500), 3)
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(CacheError::Transport(format!(
                "partition dump failed: {}",
                response.status()
            )));
        }

        let dump: PartitionDumpResponse = response
            .json()
            .await
            .map_err(|e| CacheError::Transport(e.to_string()))?;

        let mut entries = Vec::new();
        for item in dump.entries {
            let key: K = item
                .key
                .parse()
                .map_err(|e: <K as FromStr>::Err| CacheError::MalformedKey(e.to_string()))?;
            let value: V = serde_json::from_str(&item.value_json)
                .map_err(|e| CacheError::Transport(e.to_string()))?;
            entries.push((key, value, item.version));
        }
        Ok(entries)
    }

    async fn get_with_retry(
        &self,
        url: String,
        timeout: Duration,
        attempts: usize,
    ) -> Result<reqwest::Response, CacheError> {
        let mut delay_ms = 150u64;

        for attempt in 0..attempts {
            let response = self
                .http_client
                .get(url.clone())
                .timeout(timeout)
                .send()
                .await;

            match response {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    if attempt + 1 == attempts {
                        return Err(CacheError::Transport(e.to_string()));
                    }
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
            }
        }

        Err(CacheError::Transport("retry attempts exhausted".to_string()))
    }
}
