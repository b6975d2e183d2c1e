use super::failover::{AlwaysFailover, FailoverContext, FailoverPolicy, NoopObserver, RerouteObserver};
use super::registry::JobRegistry;
use super::types::{JobOutcome, JobRequest};
use crate::membership::{
    service::MembershipService,
    types::{Node, NodeId},
};

use anyhow::Result;
use std::sync::Arc;

/// Predicate narrowing the set of nodes a job may run on.
pub type NodePredicate = Arc<dyn Fn(&Node) -> bool + Send + Sync>;

/// Places jobs on eligible nodes and reroutes on failure.
///
/// Eligibility is the intersection of the alive membership, an optional
/// static projection, and an optional predicate. The failover policy only
/// ever sees that intersection, so a reroute can never escape the caller's
/// projection.
pub struct JobRouter {
    membership: Arc<MembershipService>,
    registry: Arc<JobRegistry>,
    policy: Arc<dyn FailoverPolicy>,
    observer: Arc<dyn RerouteObserver>,
}

impl JobRouter {
    pub fn new(
        membership: Arc<MembershipService>,
        registry: Arc<JobRegistry>,
        policy: Arc<dyn FailoverPolicy>,
        observer: Arc<dyn RerouteObserver>,
    ) -> Arc<Self> {
        Arc::new(Self {
            membership,
            registry,
            policy,
            observer,
        })
    }

    pub fn with_defaults(
        membership: Arc<MembershipService>,
        registry: Arc<JobRegistry>,
    ) -> Arc<Self> {
        Self::new(
            membership,
            registry,
            Arc::new(AlwaysFailover),
            Arc::new(NoopObserver),
        )
    }

    /// Runs a job on the first eligible node. On failure, asks the
    /// failover policy for a replacement among the remaining untried
    /// eligible nodes; if none exists, the original failure propagates
    /// unchanged.
    pub async fn execute(
        &self,
        request: JobRequest,
        projection: Option<&[NodeId]>,
        predicate: Option<&NodePredicate>,
    ) -> Result<JobOutcome> {
        let mut eligible: Vec<Node> = self
            .membership
            .get_alive_members()
            .into_iter()
            .filter(|node| projection.is_none_or(|ids| ids.contains(&node.id)))
            .filter(|node| predicate.is_none_or(|p| p(node)))
            .collect();
        // Deterministic placement order, independent of member-table layout.
        eligible.sort_by(|a, b| a.id.cmp(&b.id));

        if eligible.is_empty() {
            anyhow::bail!("no eligible nodes for job {}", request.job_id.0);
        }

        let mut attempted: Vec<NodeId> = Vec::new();
        let mut target = eligible[0].id.clone();
        let mut rerouted_to: Option<NodeId> = None;

        loop {
            let result = self
                .registry
                .execute(&request.handler, &target, request.payload.clone())
                .await;

            match result {
                Ok(value) => {
                    return Ok(JobOutcome {
                        value,
                        executed_on: target,
                        rerouted_to,
                        attempts: attempted.len() + 1,
                    });
                }
                Err(original) => {
                    tracing::warn!(
                        "Job {} failed on {:?}: {}",
                        request.job_id.0,
                        target,
                        original
                    );
                    attempted.push(target.clone());

                    let ctx = FailoverContext {
                        job_id: request.job_id.clone(),
                        attempted: attempted.clone(),
                    };
                    let replacement = self.policy.failover(&ctx, &eligible);
                    self.observer.rerouted(&request.job_id, replacement.as_ref());

                    match replacement {
                        Some(next) => {
                            tracing::info!(
                                "Job {} rerouted to {:?} (attempt {})",
                                request.job_id.0,
                                next,
                                attempted.len() + 1
                            );
                            rerouted_to = Some(next.clone());
                            target = next;
                        }
                        None => {
                            tracing::warn!(
                                "No failover candidate for job {}, propagating failure",
                                request.job_id.0
                            );
                            return Err(original);
                        }
                    }
                }
            }
        }
    }
}
