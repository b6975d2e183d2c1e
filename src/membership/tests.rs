//! Membership Module Tests
//!
//! Validates the fundamental components of the cluster membership system.
//!
//! ## Test Scopes
//! - **Data Structures**: Ensures uniqueness of IDs and correct serialization of wire protocol messages.
//! - **Join Gate**: Verifies that invariant-attribute agreement deterministically admits or rejects joiners.
//! - **Service Logic**: Verifies initialization, member management, and topology snapshots.

#[cfg(test)]
mod tests {
    use crate::config::default_attributes;
    use crate::error::CacheError;
    use crate::membership::service::MembershipService;
    use crate::membership::types::{
        GossipMessage, Node, NodeAttributes, NodeId, NodeState, divergent_attribute,
    };
    use std::net::SocketAddr;
    use std::time::Instant;

    fn test_node(id: &str, attributes: NodeAttributes) -> Node {
        Node {
            id: NodeId(id.to_string()),
            gossip_addr: "127.0.0.1:5000".parse().unwrap(),
            http_addr: "127.0.0.1:6000".parse().unwrap(),
            state: NodeState::Alive,
            incarnation: 1,
            attributes,
            last_seen: Some(Instant::now()),
        }
    }

    // ============================================================
    // NODE ID TESTS
    // ============================================================

    #[test]
    fn test_node_id_is_unique() {
        let id1 = NodeId::new();
        let id2 = NodeId::new();

        assert_ne!(id1, id2, "Each NodeId should be unique");
    }

    #[test]
    fn test_node_id_equality() {
        let id1 = NodeId("test-123".to_string());
        let id2 = NodeId("test-123".to_string());
        let id3 = NodeId("test-456".to_string());

        assert_eq!(id1, id2);
        assert_ne!(id1, id3);
    }

    #[test]
    fn test_node_id_ordering_is_stable() {
        let mut ids = vec![
            NodeId("c".to_string()),
            NodeId("a".to_string()),
            NodeId("b".to_string()),
        ];
        ids.sort();

        assert_eq!(ids[0].0, "a");
        assert_eq!(ids[2].0, "c");
    }

    // ============================================================
    // ATTRIBUTE GATE TESTS (pure logic)
    // ============================================================

    #[test]
    fn test_identical_attributes_have_no_divergence() {
        let attrs = default_attributes();
        assert!(divergent_attribute(&attrs, &attrs.clone()).is_none());
    }

    #[test]
    fn test_divergent_attribute_is_named() {
        let local = default_attributes();
        let mut remote = default_attributes();
        remote.insert("deployment.mode".to_string(), "continuous".to_string());

        let (attribute, local_value, remote_value) =
            divergent_attribute(&local, &remote).expect("divergence expected");

        assert_eq!(attribute, "deployment.mode");
        assert_eq!(local_value, "shared");
        assert_eq!(remote_value, "continuous");
    }

    #[test]
    fn test_missing_attribute_counts_as_divergent() {
        let local = default_attributes();
        let mut remote = default_attributes();
        remote.remove("network.stack");

        let (attribute, _, remote_value) =
            divergent_attribute(&local, &remote).expect("divergence expected");

        assert_eq!(attribute, "network.stack");
        assert_eq!(remote_value, "<unset>");
    }

    #[test]
    fn test_divergence_check_is_deterministic() {
        let local = default_attributes();
        let mut remote = default_attributes();
        remote.insert("network.stack".to_string(), "ipv6".to_string());

        for _ in 0..10 {
            let (attribute, _, _) =
                divergent_attribute(&local, &remote).expect("divergence expected");
            assert_eq!(attribute, "network.stack", "Same cause every time");
        }
    }

    // ============================================================
    // WIRE PROTOCOL TESTS
    // ============================================================

    #[test]
    fn test_node_serialization() {
        let node = test_node("test-node", default_attributes());

        let json = serde_json::to_string(&node).expect("Serialization failed");
        let restored: Node = serde_json::from_str(&json).expect("Deserialization failed");

        assert_eq!(restored.id, node.id);
        assert_eq!(restored.gossip_addr, node.gossip_addr);
        assert_eq!(restored.http_addr, node.http_addr);
        assert_eq!(restored.state, node.state);
        assert_eq!(restored.attributes, node.attributes);
        // last_seen is skipped in serde, should be None
        assert!(restored.last_seen.is_none());
    }

    #[test]
    fn test_node_bincode_serialization() {
        let node = test_node("bincode-test", default_attributes());

        let encoded = bincode::serialize(&node).expect("Bincode serialization failed");
        let restored: Node = bincode::deserialize(&encoded).expect("Bincode deserialization failed");

        assert_eq!(restored.id, node.id);
        assert_eq!(restored.attributes, node.attributes);
    }

    #[test]
    fn test_gossip_join_serialization() {
        let msg = GossipMessage::Join {
            node: test_node("new-joiner", default_attributes()),
        };

        let encoded = bincode::serialize(&msg).expect("Failed to serialize Join");
        let decoded: GossipMessage =
            bincode::deserialize(&encoded).expect("Failed to deserialize Join");

        if let GossipMessage::Join { node } = decoded {
            assert_eq!(node.id.0, "new-joiner");
            assert_eq!(node.attributes, default_attributes());
        } else {
            panic!("Wrong message type");
        }
    }

    #[test]
    fn test_gossip_join_reject_serialization() {
        let msg = GossipMessage::JoinReject {
            attribute: "deployment.mode".to_string(),
            local: "shared".to_string(),
            remote: "continuous".to_string(),
        };

        let encoded = bincode::serialize(&msg).expect("Failed to serialize JoinReject");
        let decoded: GossipMessage =
            bincode::deserialize(&encoded).expect("Failed to deserialize JoinReject");

        if let GossipMessage::JoinReject {
            attribute,
            local,
            remote,
        } = decoded
        {
            assert_eq!(attribute, "deployment.mode");
            assert_eq!(local, "shared");
            assert_eq!(remote, "continuous");
        } else {
            panic!("Wrong message type");
        }
    }

    // ============================================================
    // MEMBERSHIP SERVICE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_membership_service_creation() {
        let bind_addr: SocketAddr = "127.0.0.1:0".parse().unwrap(); // port 0 = random available

        let service = MembershipService::new(bind_addr, vec![], default_attributes())
            .await
            .expect("Failed to create service");

        // Should have itself as a member
        assert_eq!(service.members.len(), 1);

        let alive = service.get_alive_members();
        assert_eq!(alive.len(), 1);
        assert_eq!(alive[0].id, service.local_node.id);
        assert_eq!(alive[0].state, NodeState::Alive);
    }

    #[tokio::test]
    async fn test_membership_get_member() {
        let bind_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let service = MembershipService::new(bind_addr, vec![], default_attributes())
            .await
            .unwrap();

        let member = service.get_member(&service.local_node.id);
        assert!(member.is_some());
        assert_eq!(member.unwrap().id, service.local_node.id);

        let fake_id = NodeId("non-existent".to_string());
        assert!(service.get_member(&fake_id).is_none());
    }

    #[tokio::test]
    async fn test_membership_http_addr_calculation() {
        let bind_addr: SocketAddr = "127.0.0.1:5123".parse().unwrap();
        let service = MembershipService::new(bind_addr, vec![], default_attributes())
            .await
            .unwrap();

        // HTTP port should be gossip port + 1000
        assert_eq!(service.local_node.gossip_addr.port(), 5123);
        assert_eq!(service.local_node.http_addr.port(), 6123);
    }

    #[tokio::test]
    async fn test_topology_snapshot_is_sorted_and_versioned() {
        let service = MembershipService::new(
            "127.0.0.1:0".parse().unwrap(),
            vec![],
            default_attributes(),
        )
        .await
        .unwrap();

        let snapshot = service.topology_snapshot();
        assert_eq!(snapshot.version, service.topology_version());
        assert_eq!(snapshot.members.len(), 1);

        let mut sorted = snapshot.members.clone();
        sorted.sort();
        assert_eq!(snapshot.members, sorted);
    }

    // ============================================================
    // JOIN GATE TESTS (two real services over loopback UDP)
    // ============================================================

    #[tokio::test]
    async fn test_join_with_identical_attributes_succeeds() {
        let seed = MembershipService::new(
            "127.0.0.1:0".parse().unwrap(),
            vec![],
            default_attributes(),
        )
        .await
        .unwrap();
        seed.clone().start().await;

        let joiner = MembershipService::new(
            "127.0.0.1:0".parse().unwrap(),
            vec![seed.local_node.gossip_addr],
            default_attributes(),
        )
        .await
        .expect("Join with identical attributes should succeed");

        assert_eq!(joiner.members.len(), 2);
        assert!(joiner.get_member(&seed.local_node.id).is_some());
        assert!(seed.get_member(&joiner.local_node.id).is_some());
    }

    #[tokio::test]
    async fn test_join_with_divergent_attribute_is_rejected() {
        let seed = MembershipService::new(
            "127.0.0.1:0".parse().unwrap(),
            vec![],
            default_attributes(),
        )
        .await
        .unwrap();
        seed.clone().start().await;

        let mut divergent = default_attributes();
        divergent.insert("deployment.mode".to_string(), "continuous".to_string());

        let result = MembershipService::new(
            "127.0.0.1:0".parse().unwrap(),
            vec![seed.local_node.gossip_addr],
            divergent,
        )
        .await;

        match result {
            Err(CacheError::TopologyRejected { attribute, .. }) => {
                assert_eq!(attribute, "deployment.mode");
            }
            other => panic!("Expected TopologyRejected, got {:?}", other.map(|_| ())),
        }

        // The rejected joiner must not appear in the seed's member table.
        assert_eq!(seed.members.len(), 1);
    }

    #[tokio::test]
    async fn test_join_rejection_cause_is_deterministic() {
        let seed = MembershipService::new(
            "127.0.0.1:0".parse().unwrap(),
            vec![],
            default_attributes(),
        )
        .await
        .unwrap();
        seed.clone().start().await;

        let mut divergent = default_attributes();
        divergent.insert("network.stack".to_string(), "ipv6".to_string());

        for _ in 0..2 {
            let result = MembershipService::new(
                "127.0.0.1:0".parse().unwrap(),
                vec![seed.local_node.gossip_addr],
                divergent.clone(),
            )
            .await;

            match result {
                Err(CacheError::TopologyRejected {
                    attribute,
                    local,
                    remote,
                }) => {
                    assert_eq!(attribute, "network.stack");
                    assert_eq!(local, "ipv6", "joiner-side value");
                    assert_eq!(remote, "ipv4", "cluster-side value");
                }
                other => panic!("Expected TopologyRejected, got {:?}", other.map(|_| ())),
            }
        }
    }

    #[tokio::test]
    async fn test_join_bumps_topology_version() {
        let seed = MembershipService::new(
            "127.0.0.1:0".parse().unwrap(),
            vec![],
            default_attributes(),
        )
        .await
        .unwrap();
        seed.clone().start().await;

        let version_before = seed.topology_version();

        let _joiner = MembershipService::new(
            "127.0.0.1:0".parse().unwrap(),
            vec![seed.local_node.gossip_addr],
            default_attributes(),
        )
        .await
        .unwrap();

        assert!(
            seed.topology_version() > version_before,
            "Admitting a joiner must bump the topology version"
        );
    }
}
