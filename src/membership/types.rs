use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum NodeState {
    Alive,
    Suspect,
    Dead,
}

/// Cluster-invariant attributes carried by every node.
///
/// Compared wholesale at join time: every existing member and the joiner must
/// agree on every key, otherwise the join is rejected naming the divergent
/// attribute. Never re-checked per operation.
pub type NodeAttributes = BTreeMap<String, String>;

/// Returns the first attribute key on which the two sides disagree, together
/// with the local and remote values ("<unset>" when a side lacks the key).
pub fn divergent_attribute(
    local: &NodeAttributes,
    remote: &NodeAttributes,
) -> Option<(String, String, String)> {
    for key in local.keys().chain(remote.keys()) {
        let l = local.get(key);
        let r = remote.get(key);
        if l != r {
            let unset = "<unset>".to_string();
            return Some((
                key.clone(),
                l.cloned().unwrap_or_else(|| unset.clone()),
                r.cloned().unwrap_or(unset),
            ));
        }
    }
    None
}

/// Represents a single member in the cluster.
///
/// Contains identity, network addressing, invariant attributes, and current
/// lifecycle state. The `incarnation` field is a logical clock used to order
/// updates and resolve conflicts (e.g., refuting a false "Suspect" claim).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub gossip_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub state: NodeState,
    pub incarnation: u64,
    pub attributes: NodeAttributes,

    #[serde(skip)]
    pub last_seen: Option<Instant>,
}

/// A single consistent view of the alive membership, taken once per affinity
/// lookup. The member list is sorted so owner computation is deterministic
/// for a fixed snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct TopologySnapshot {
    pub version: u64,
    pub members: Vec<NodeId>,
}

/// The wire protocol for inter-node gossip.
///
/// - `Ping/Ack`: Used for liveness checks and state synchronization.
/// - `Join`: Sent by new nodes to seed nodes to enter the cluster.
/// - `JoinAccept/JoinReject`: Join gate verdict; a reject names the
///   divergent invariant attribute and is fatal to the joiner.
/// - `Suspect/Alive`: Disseminates changes in node health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GossipMessage {
    Ping {
        from: NodeId,
        incarnation: u64,
    },

    Ack {
        from: NodeId,
        incarnation: u64,
        members: Vec<Node>,
    },

    Join {
        node: Node,
    },

    JoinAccept {
        members: Vec<Node>,
    },

    JoinReject {
        attribute: String,
        local: String,
        remote: String,
    },

    Suspect {
        node_id: NodeId,
        incarnation: u64,
    },

    Alive {
        node_id: NodeId,
        incarnation: u64,
    },
}
