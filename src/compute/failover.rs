use super::types::JobId;
use crate::membership::types::{Node, NodeId};

/// What the policy knows about a failed job when picking a replacement.
pub struct FailoverContext {
    pub job_id: JobId,
    /// Every node already tried for this job, in attempt order. The failed
    /// node is always the last element.
    pub attempted: Vec<NodeId>,
}

/// Replacement selection after a job failure.
///
/// `candidates` is already narrowed to the job's projection and predicate;
/// the policy only decides which untried node, if any, gets the retry.
/// Returning `None` means no reroute: the original failure propagates
/// unchanged.
pub trait FailoverPolicy: Send + Sync {
    fn failover(&self, ctx: &FailoverContext, candidates: &[Node]) -> Option<NodeId>;
}

/// Reroutes to the first eligible node not yet tried for this job.
pub struct AlwaysFailover;

impl FailoverPolicy for AlwaysFailover {
    fn failover(&self, ctx: &FailoverContext, candidates: &[Node]) -> Option<NodeId> {
        candidates
            .iter()
            .find(|node| !ctx.attempted.contains(&node.id))
            .map(|node| node.id.clone())
    }
}

/// Observation hook for reroute decisions, injected so callers (and tests)
/// can verify whether failover happened without reaching into the router.
pub trait RerouteObserver: Send + Sync {
    /// Called on every failover decision; `to` is `None` when no
    /// replacement was found.
    fn rerouted(&self, job_id: &JobId, to: Option<&NodeId>);
}

pub struct NoopObserver;

impl RerouteObserver for NoopObserver {
    fn rerouted(&self, _job_id: &JobId, _to: Option<&NodeId>) {}
}
