//! Compute Module Tests
//!
//! ## Test Scopes
//! - **Registry**: Verifies job registration, lookup, and execution mechanics.
//! - **Failover Routing**: Simulates job failures under predicates and static
//!   projections, asserting when rerouting happens and when the original
//!   failure propagates.

#[cfg(test)]
mod tests {
    use crate::compute::failover::{AlwaysFailover, RerouteObserver};
    use crate::compute::registry::JobRegistry;
    use crate::compute::router::{JobRouter, NodePredicate};
    use crate::compute::types::{JobId, JobRequest};
    use crate::config::default_attributes;
    use crate::membership::service::MembershipService;
    use crate::membership::types::{Node, NodeId, NodeState};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Instant;

    #[derive(Default)]
    struct FlagObserver {
        called: AtomicBool,
        routed: AtomicBool,
    }

    impl RerouteObserver for FlagObserver {
        fn rerouted(&self, _job_id: &JobId, to: Option<&NodeId>) {
            self.called.store(true, Ordering::SeqCst);
            self.routed.store(to.is_some(), Ordering::SeqCst);
        }
    }

    async fn membership_with(nodes: &[&str]) -> Arc<MembershipService> {
        let membership = MembershipService::new(
            "127.0.0.1:0".parse().unwrap(),
            vec![],
            default_attributes(),
        )
        .await
        .unwrap();

        for (i, name) in nodes.iter().enumerate() {
            let node = Node {
                id: NodeId(name.to_string()),
                gossip_addr: format!("127.0.0.1:{}", 15000 + i).parse().unwrap(),
                http_addr: format!("127.0.0.1:{}", 16000 + i).parse().unwrap(),
                state: NodeState::Alive,
                incarnation: 1,
                attributes: default_attributes(),
                last_seen: Some(Instant::now()),
            };
            membership.members.insert(node.id.clone(), node);
        }

        membership
    }

    fn ids(names: &[&str]) -> Vec<NodeId> {
        names.iter().map(|n| NodeId(n.to_string())).collect()
    }

    // ============================================================
    // JOB REGISTRY TESTS
    // ============================================================

    #[tokio::test]
    async fn test_registry_register_and_execute() {
        // ARRANGE: Create registry and call counter
        let registry = JobRegistry::new();
        let call_count = Arc::new(AtomicUsize::new(0));
        let call_count_clone = call_count.clone();

        // ACT: Register handler
        registry.register("test_handler", move |_node, _payload| {
            let count = call_count_clone.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(serde_json::json!({"done": true}))
            }
        });

        // ASSERT: Handler is registered
        assert!(registry.has_handler("test_handler"));
        assert_eq!(registry.handler_count(), 1);

        // ACT: Execute job
        let result = registry
            .execute(
                "test_handler",
                &NodeId("node-a".to_string()),
                serde_json::json!({"test": "data"}),
            )
            .await;

        // ASSERT: Handler was called
        assert!(result.is_ok());
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_registry_unknown_handler_returns_error() {
        let registry = JobRegistry::new();

        let result = registry
            .execute(
                "non_existent_handler",
                &NodeId("node-a".to_string()),
                serde_json::json!({}),
            )
            .await;

        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Unknown job handler")
        );
    }

    #[tokio::test]
    async fn test_registry_handler_receives_target_node() {
        let registry = JobRegistry::new();

        registry.register("echo_node", |node, _payload| async move {
            Ok(serde_json::json!({ "node": node.0 }))
        });

        let result = registry
            .execute("echo_node", &NodeId("node-b".to_string()), serde_json::json!({}))
            .await
            .unwrap();

        assert_eq!(result["node"], "node-b");
    }

    // ============================================================
    // FAILOVER ROUTING TESTS
    // ============================================================

    /// Predicate excluding the only other eligible node: the job fails on
    /// its one candidate and no reroute happens; the original failure
    /// propagates unchanged.
    #[tokio::test]
    async fn test_job_not_failed_over_when_predicate_excludes_replacement() {
        let membership = membership_with(&["node-a", "node-b"]).await;
        let registry = JobRegistry::new();

        registry.register("failing_job", |_node, _payload| async move {
            Err(anyhow::anyhow!("job exception"))
        });

        let observer = Arc::new(FlagObserver::default());
        let router = JobRouter::new(
            membership,
            registry,
            Arc::new(AlwaysFailover),
            observer.clone(),
        );

        let exclude_b: NodePredicate = Arc::new(|node: &Node| node.id.0 != "node-b");
        let result = router
            .execute(
                JobRequest::new("failing_job", serde_json::json!({})),
                Some(ids(&["node-a", "node-b"]).as_slice()),
                Some(&exclude_b),
            )
            .await;

        let err = result.expect_err("Original failure must propagate");
        assert!(err.to_string().contains("job exception"));
        assert!(observer.called.load(Ordering::SeqCst));
        assert!(!observer.routed.load(Ordering::SeqCst));
    }

    /// With a third eligible node, a job that fails once is rerouted and
    /// succeeds there.
    #[tokio::test]
    async fn test_job_failed_over_to_eligible_node() {
        let membership = membership_with(&["node-a", "node-b", "node-c"]).await;
        let registry = JobRegistry::new();

        let failures = Arc::new(AtomicUsize::new(0));
        let failures_clone = failures.clone();
        registry.register("flaky_job", move |node, payload| {
            let failures = failures_clone.clone();
            async move {
                if failures.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(anyhow::anyhow!("job exception"))
                } else {
                    Ok(serde_json::json!({ "ran_on": node.0, "payload": payload }))
                }
            }
        });

        let observer = Arc::new(FlagObserver::default());
        let router = JobRouter::new(
            membership,
            registry,
            Arc::new(AlwaysFailover),
            observer.clone(),
        );

        let outcome = router
            .execute(
                JobRequest::new("flaky_job", serde_json::json!(1)),
                Some(ids(&["node-a", "node-b", "node-c"]).as_slice()),
                None,
            )
            .await
            .expect("Rerouted job must succeed");

        assert_eq!(outcome.attempts, 2);
        assert!(outcome.rerouted_to.is_some());
        assert_ne!(outcome.executed_on.0, "node-a", "Replacement, not the failed node");
        assert!(observer.routed.load(Ordering::SeqCst));
    }

    /// The predicate is intersected with the static projection: a node
    /// outside the projection is never a failover candidate, even if alive
    /// and matching the predicate.
    #[tokio::test]
    async fn test_job_not_failed_over_outside_static_projection() {
        let membership = membership_with(&["node-a", "node-b", "node-c"]).await;
        let registry = JobRegistry::new();

        registry.register("failing_job", |_node, _payload| async move {
            Err(anyhow::anyhow!("job exception"))
        });

        let observer = Arc::new(FlagObserver::default());
        let router = JobRouter::new(
            membership,
            registry,
            Arc::new(AlwaysFailover),
            observer.clone(),
        );

        // Projection covers only {a, b}; the predicate knocks out b.
        // node-c may not be taken into account on failover.
        let exclude_b: NodePredicate = Arc::new(|node: &Node| node.id.0 != "node-b");
        let result = router
            .execute(
                JobRequest::new("failing_job", serde_json::json!({})),
                Some(ids(&["node-a", "node-b"]).as_slice()),
                Some(&exclude_b),
            )
            .await;

        assert!(result.is_err());
        assert!(!observer.routed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_no_eligible_nodes_fails_fast() {
        let membership = membership_with(&["node-a"]).await;
        let registry = JobRegistry::new();
        registry.register("any_job", |_node, payload| async move { Ok(payload) });

        let router = JobRouter::with_defaults(membership, registry);

        let none: NodePredicate = Arc::new(|_node: &Node| false);
        let result = router
            .execute(
                JobRequest::new("any_job", serde_json::json!({})),
                None,
                Some(&none),
            )
            .await;

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("no eligible nodes"));
    }

    /// Every eligible node exhausted: the policy stops returning
    /// candidates and the last failure surfaces.
    #[tokio::test]
    async fn test_failover_exhausts_candidates_then_propagates() {
        let membership = membership_with(&["node-a", "node-b"]).await;
        let registry = JobRegistry::new();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        registry.register("always_failing", move |_node, _payload| {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("job exception"))
            }
        });

        let router = JobRouter::with_defaults(membership, registry);

        let result = router
            .execute(
                JobRequest::new("always_failing", serde_json::json!({})),
                Some(ids(&["node-a", "node-b"]).as_slice()),
                None,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2, "Both nodes tried exactly once");
    }
}
