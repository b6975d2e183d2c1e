use crate::membership::types::NodeId;
use serde::{Deserialize, Serialize};

/// Unique identifier for a routed job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

/// A unit of work submitted to the router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub job_id: JobId,
    /// The name of the registered handler to invoke.
    pub handler: String,
    /// Arbitrary JSON payload passed to the handler.
    pub payload: serde_json::Value,
}

impl JobRequest {
    pub fn new(handler: &str, payload: serde_json::Value) -> Self {
        Self {
            job_id: JobId::new(),
            handler: handler.to_string(),
            payload,
        }
    }
}

/// Result of a routed execution, including whether failover rerouted it.
#[derive(Debug)]
pub struct JobOutcome {
    pub value: serde_json::Value,
    pub executed_on: NodeId,
    /// The node the job was last rerouted to, if failover kicked in.
    pub rerouted_to: Option<NodeId>,
    pub attempts: usize,
}
