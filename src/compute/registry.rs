//! Job Handler Registry
//!
//! A dynamic registry that maps string-based job names to executable Rust
//! closures, keeping the router generic and extensible without hardcoding
//! job logic in the routing module.

use crate::membership::types::NodeId;

use anyhow::Result;
use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Type alias for a thread-safe, asynchronous job handler function.
/// It receives the node the attempt is placed on and the job payload.
pub type JobHandlerFn = Arc<
    dyn Fn(NodeId, serde_json::Value) -> Pin<Box<dyn Future<Output = Result<serde_json::Value>> + Send>>
        + Send
        + Sync,
>;

/// Registry holding the mapping between job names and their implementation.
pub struct JobRegistry {
    handlers: DashMap<String, JobHandlerFn>,
}

impl JobRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handlers: DashMap::new(),
        })
    }

    /// Registers a new handler function under a specific name.
    pub fn register<F, Fut>(&self, handler_name: &str, handler: F)
    where
        F: Fn(NodeId, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        // Box::pin type-erases the concrete Future so different async
        // functions share one map.
        let handler_fn: JobHandlerFn = Arc::new(move |node, payload| {
            Box::pin(handler(node, payload))
                as Pin<Box<dyn Future<Output = Result<serde_json::Value>> + Send>>
        });

        self.handlers.insert(handler_name.to_string(), handler_fn);

        tracing::info!("Registered job handler: {}", handler_name);
    }

    /// Looks up a handler by name and executes it against the given node.
    pub async fn execute(
        &self,
        handler_name: &str,
        node: &NodeId,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value> {
        if let Some(handler_fn) = self.handlers.get(handler_name) {
            tracing::debug!("Executing job handler '{}' on {:?}", handler_name, node);
            handler_fn.value()(node.clone(), payload).await
        } else {
            let error = format!("Unknown job handler: {}", handler_name);
            tracing::error!("{}", error);
            Err(anyhow::anyhow!(error))
        }
    }

    pub fn has_handler(&self, handler_name: &str) -> bool {
        self.handlers.contains_key(handler_name)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn list_handlers(&self) -> Vec<String> {
        self.handlers
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }
}
