use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use std::{net::SocketAddr, time::Duration};
use tokio::net::UdpSocket;
use tokio::sync::{RwLock, watch};
use tracing::info;

use super::types::{
    GossipMessage, Node, NodeAttributes, NodeId, NodeState, TopologySnapshot, divergent_attribute,
};
use crate::error::CacheError;

const GOSSIP_INTERVAL: Duration = Duration::from_millis(500);
const FAILURE_DETECTION_INTERVAL: Duration = Duration::from_secs(2);
const SUSPECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEAD_TIMEOUT: Duration = Duration::from_secs(10);
const JOIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Offset between a node's gossip port and its HTTP port.
const HTTP_PORT_OFFSET: u16 = 1000;

pub struct MembershipService {
    pub local_node: Node,
    pub members: Arc<DashMap<NodeId, Node>>,
    socket: Arc<UdpSocket>,
    incarnation: Arc<RwLock<u64>>,
    topology_version: AtomicU64,
    topology_tx: watch::Sender<u64>,
}

impl MembershipService {
    /// Binds the gossip socket and, when seeds are given, runs the join
    /// handshake. A seed whose invariant attributes differ answers with a
    /// rejection naming the divergent attribute; that is fatal to the joiner
    /// and surfaces as `TopologyRejected`.
    pub async fn new(
        bind_addr: SocketAddr,
        seed_nodes: Vec<SocketAddr>,
        attributes: NodeAttributes,
    ) -> Result<Arc<Self>, CacheError> {
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| CacheError::Transport(format!("gossip bind failed: {e}")))?;
        let gossip_addr = socket
            .local_addr()
            .map_err(|e| CacheError::Transport(e.to_string()))?;
        let http_addr = SocketAddr::new(gossip_addr.ip(), gossip_addr.port() + HTTP_PORT_OFFSET);

        let incarnation_counter = Arc::new(RwLock::new(1));
        let current_inc = *incarnation_counter.read().await;
        let local_node = Node {
            id: NodeId::new(),
            gossip_addr,
            http_addr,
            state: NodeState::Alive,
            incarnation: current_inc,
            attributes,
            last_seen: Some(Instant::now()),
        };
        let members = Arc::new(DashMap::new());
        members.insert(local_node.id.clone(), local_node.clone());

        let (topology_tx, _) = watch::channel(1u64);

        let service = Self {
            local_node,
            members,
            socket: Arc::new(socket),
            incarnation: incarnation_counter,
            topology_version: AtomicU64::new(1),
            topology_tx,
        };

        if !seed_nodes.is_empty() {
            info!("Joining cluster via {} seed node(s)", seed_nodes.len());
            service.join_cluster(&seed_nodes).await?;
        }

        Ok(Arc::new(service))
    }

    /// Sends the join request to every seed and waits for the first verdict.
    /// Silence from all seeds is tolerated (they may still be starting); a
    /// rejection is not.
    async fn join_cluster(&self, seed_nodes: &[SocketAddr]) -> Result<(), CacheError> {
        for seed_node in seed_nodes {
            let msg = GossipMessage::Join {
                node: self.local_node.clone(),
            };
            let encoded = bincode::serialize(&msg)
                .map_err(|e| CacheError::Transport(e.to_string()))?;
            self.socket
                .send_to(&encoded, seed_node)
                .await
                .map_err(|e| CacheError::Transport(e.to_string()))?;
            info!("Sent join request to {}", seed_node);
        }

        let mut buf = vec![0u8; 65536];
        let deadline = Instant::now() + JOIN_TIMEOUT;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!("No join verdict from any seed, proceeding as reachable-by-gossip");
                return Ok(());
            }

            let received =
                tokio::time::timeout(remaining, self.socket.recv_from(&mut buf)).await;

            let (len, _src) = match received {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => return Err(CacheError::Transport(e.to_string())),
                Err(_) => continue,
            };

            match bincode::deserialize::<GossipMessage>(&buf[..len]) {
                Ok(GossipMessage::JoinAccept { members }) => {
                    for member in members {
                        self.merge_member(member).await;
                    }
                    info!("Join accepted, cluster size now {}", self.members.len());
                    return Ok(());
                }
                Ok(GossipMessage::JoinReject {
                    attribute,
                    local,
                    remote,
                }) => {
                    // The seed reports from its own perspective; flip back.
                    return Err(CacheError::TopologyRejected {
                        attribute,
                        local: remote,
                        remote: local,
                    });
                }
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!("Failed to deserialize message during join: {}", e);
                }
            }
        }
    }

    pub async fn start(self: Arc<Self>) {
        tracing::info!("Starting membership service...");

        let _gossip_handle = {
            let service = self.clone();
            tokio::spawn(async move {
                service.gossip_loop().await;
            })
        };

        let _receive_handle = {
            let service = self.clone();
            tokio::spawn(async move {
                service.receive_loop().await;
            })
        };

        let _failure_detection_handle = {
            let service = self.clone();
            tokio::spawn(async move {
                service.failure_detection_loop().await;
            })
        };

        tracing::info!("All background tasks started");
    }

    pub fn get_alive_members(&self) -> Vec<Node> {
        self.members
            .iter()
            .filter(|entry| entry.value().state == NodeState::Alive)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn get_member(&self, node_id: &NodeId) -> Option<Node> {
        self.members.get(node_id).map(|entry| entry.value().clone())
    }

    /// One consistent view of the alive membership. Affinity lookups take a
    /// snapshot once and resolve every owner list against it, so a
    /// concurrent membership change cannot tear a single lookup.
    pub fn topology_snapshot(&self) -> TopologySnapshot {
        let version = self.topology_version.load(Ordering::SeqCst);
        let mut members: Vec<NodeId> = self
            .members
            .iter()
            .filter(|entry| entry.value().state == NodeState::Alive)
            .map(|entry| entry.key().clone())
            .collect();
        members.sort();
        TopologySnapshot { version, members }
    }

    pub fn topology_version(&self) -> u64 {
        self.topology_version.load(Ordering::SeqCst)
    }

    /// Subscription for rebalancing and near-cache eviction.
    pub fn subscribe_topology(&self) -> watch::Receiver<u64> {
        self.topology_tx.subscribe()
    }

    fn bump_topology(&self) {
        let version = self.topology_version.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.topology_tx.send(version);
        tracing::debug!("Topology version now {}", version);
    }

    async fn gossip_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(GOSSIP_INTERVAL);

        loop {
            interval.tick().await;

            let alive_members: Vec<Node> = self
                .members
                .iter()
                .filter(|entry| {
                    entry.value().id != self.local_node.id
                        && entry.value().state == NodeState::Alive
                })
                .map(|entry| entry.value().clone())
                .collect();

            if alive_members.is_empty() {
                continue;
            }

            use rand::Rng;
            let idx = rand::thread_rng().gen_range(0..alive_members.len());
            let target = &alive_members[idx];

            let incarnation = *self.incarnation.read().await;
            let msg = GossipMessage::Ping {
                from: self.local_node.id.clone(),
                incarnation,
            };

            if let Ok(encoded) = bincode::serialize(&msg) {
                if let Err(e) = self.socket.send_to(&encoded, target.gossip_addr).await {
                    tracing::warn!("Failed to send ping to {:?}: {}", target.id, e);
                } else {
                    tracing::debug!("Sent ping to {:?}", target.id);
                }
            } else {
                tracing::error!("Failed to serialize GossipMessage::Ping");
            }
        }
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 65536];

        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, src)) => match bincode::deserialize::<GossipMessage>(&buf[..len]) {
                    Ok(msg) => {
                        if let Err(e) = self.handle_message(msg, src).await {
                            tracing::error!("Error handling message from {}: {}", src, e);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Failed to deserialize message from {}: {}", src, e);
                    }
                },
                Err(e) => {
                    tracing::error!("Failed to receive UDP packet: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_message(&self, msg: GossipMessage, src: SocketAddr) -> anyhow::Result<()> {
        match msg {
            GossipMessage::Ping { from, incarnation } => {
                self.handle_ping(from, incarnation, src).await?;
            }

            GossipMessage::Ack {
                from,
                incarnation,
                members,
            } => {
                self.handle_ack(from, incarnation, members).await?;
            }

            GossipMessage::Join { node } => {
                self.handle_join(node, src).await?;
            }

            // Verdicts are consumed during the join handshake; one arriving
            // here is a stale duplicate.
            GossipMessage::JoinAccept { .. } | GossipMessage::JoinReject { .. } => {}

            GossipMessage::Suspect {
                node_id,
                incarnation,
            } => {
                self.handle_suspect(node_id, incarnation).await?;
            }

            GossipMessage::Alive {
                node_id,
                incarnation,
            } => {
                self.handle_alive(node_id, incarnation).await?;
            }
        }

        Ok(())
    }

    async fn handle_ping(
        &self,
        from: NodeId,
        from_incarnation: u64,
        src: SocketAddr,
    ) -> anyhow::Result<()> {
        tracing::debug!("Received ping from {:?}", from);

        if let Some(mut member) = self.members.get_mut(&from) {
            member.last_seen = Some(Instant::now());

            if from_incarnation > member.incarnation {
                member.incarnation = from_incarnation;
            }
        } else {
            // A pinging node we don't know yet already passed a join gate
            // somewhere in the cluster; attributes arrive with the next Ack.
            tracing::info!("Discovered new member via ping: {:?} at {}", from, src);

            let new_node = Node {
                id: from.clone(),
                gossip_addr: src,
                http_addr: SocketAddr::new(src.ip(), src.port() + HTTP_PORT_OFFSET),
                state: NodeState::Alive,
                incarnation: from_incarnation,
                attributes: NodeAttributes::new(),
                last_seen: Some(Instant::now()),
            };

            self.members.insert(new_node.id.clone(), new_node);
            self.bump_topology();
        }

        let all_members: Vec<Node> = self
            .members
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let my_incarnation = *self.incarnation.read().await;
        let reply = GossipMessage::Ack {
            from: self.local_node.id.clone(),
            incarnation: my_incarnation,
            members: all_members,
        };

        let encoded = bincode::serialize(&reply)?;
        self.socket.send_to(&encoded, src).await?;

        tracing::debug!("Sent ack to {:?} with {} members", from, self.members.len());

        Ok(())
    }

    async fn handle_ack(
        &self,
        from: NodeId,
        from_incarnation: u64,
        members: Vec<Node>,
    ) -> anyhow::Result<()> {
        tracing::debug!(
            "Received ack from {:?} (inc={}) with {} members",
            from,
            from_incarnation,
            members.len()
        );

        if let Some(mut member) = self.members.get_mut(&from)
            && from_incarnation > member.incarnation
        {
            member.incarnation = from_incarnation;
            member.last_seen = Some(Instant::now());
        }

        for member in members {
            self.merge_member(member).await;
        }

        Ok(())
    }

    async fn merge_member(&self, new_member: Node) {
        if new_member.id == self.local_node.id {
            return;
        }

        match self.members.get_mut(&new_member.id) {
            Some(mut existing) => {
                if new_member.incarnation > existing.incarnation {
                    tracing::debug!(
                        "Updating {:?}: inc {} -> {}",
                        new_member.id,
                        existing.incarnation,
                        new_member.incarnation,
                    );

                    let was_alive = existing.state == NodeState::Alive;
                    existing.state = new_member.state.clone();
                    existing.incarnation = new_member.incarnation;
                    existing.last_seen = Some(Instant::now());
                    if !new_member.attributes.is_empty() {
                        existing.attributes = new_member.attributes;
                    }

                    let is_alive = existing.state == NodeState::Alive;
                    drop(existing);
                    if was_alive != is_alive {
                        self.bump_topology();
                    }
                } else if new_member.incarnation == existing.incarnation
                    && new_member.state == NodeState::Alive
                    && existing.state == NodeState::Suspect
                {
                    tracing::info!("{:?} refuted suspicion", new_member.id);
                    existing.state = NodeState::Alive;
                    existing.last_seen = Some(Instant::now());
                    drop(existing);
                    self.bump_topology();
                }
            }
            None => {
                tracing::info!(
                    "Discovered new member: {:?} at {}",
                    new_member.id,
                    new_member.gossip_addr
                );

                let mut member_with_timestamp = new_member;
                member_with_timestamp.last_seen = Some(Instant::now());

                self.members
                    .insert(member_with_timestamp.id.clone(), member_with_timestamp);
                self.bump_topology();
            }
        }
    }

    /// The join gate. Every invariant attribute of the joiner must match the
    /// local node's; the first divergence rejects the join, naming the
    /// attribute. Checked once here, never per operation.
    async fn handle_join(&self, mut node: Node, src: SocketAddr) -> anyhow::Result<()> {
        if let Some((attribute, local, remote)) =
            divergent_attribute(&self.local_node.attributes, &node.attributes)
        {
            tracing::warn!(
                "Rejecting join of {:?}: attribute '{}' differs (local '{}', remote '{}')",
                node.id,
                attribute,
                local,
                remote
            );

            let reply = GossipMessage::JoinReject {
                attribute,
                local,
                remote,
            };
            let encoded = bincode::serialize(&reply)?;
            self.socket.send_to(&encoded, src).await?;
            return Ok(());
        }

        tracing::info!("Node {:?} joining cluster at {}", node.id, node.gossip_addr);

        node.last_seen = Some(Instant::now());
        self.members.insert(node.id.clone(), node);
        self.bump_topology();

        let all_members: Vec<Node> = self
            .members
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let reply = GossipMessage::JoinAccept {
            members: all_members,
        };
        let encoded = bincode::serialize(&reply)?;
        self.socket.send_to(&encoded, src).await?;

        tracing::info!("Cluster size now: {}", self.members.len());

        Ok(())
    }

    async fn handle_suspect(&self, node_id: NodeId, incarnation: u64) -> anyhow::Result<()> {
        match self.members.get_mut(&node_id) {
            Some(mut existing) => {
                if incarnation > existing.incarnation {
                    if node_id == self.local_node.id {
                        tracing::info!(
                            "Refuting suspicion of self at {}",
                            existing.gossip_addr
                        );
                        let my_incarnation = {
                            let mut inc = self.incarnation.write().await;
                            *inc += 1;
                            *inc
                        };

                        let msg = GossipMessage::Alive {
                            node_id: node_id.clone(),
                            incarnation: my_incarnation,
                        };

                        existing.incarnation = my_incarnation;
                        existing.state = NodeState::Alive;
                        existing.last_seen = Some(Instant::now());
                        drop(existing);

                        self.broadcast_message(msg).await;
                    } else {
                        tracing::info!(
                            "Node {:?} at {} suspected",
                            existing.id,
                            existing.gossip_addr
                        );
                        existing.state = NodeState::Suspect;
                        existing.incarnation = incarnation;
                        existing.last_seen = Some(Instant::now());
                        drop(existing);
                        self.bump_topology();
                    }
                }
            }
            None => {
                tracing::debug!("Suspected node {:?} doesn't exist", node_id);
            }
        }

        Ok(())
    }

    async fn handle_alive(&self, node_id: NodeId, incarnation: u64) -> anyhow::Result<()> {
        match self.members.get_mut(&node_id) {
            Some(mut existing) => {
                if incarnation > existing.incarnation {
                    tracing::info!(
                        "Node {:?} at {} is now Alive (inc={})",
                        existing.id,
                        existing.gossip_addr,
                        incarnation
                    );
                    let was_suspect = existing.state != NodeState::Alive;
                    existing.state = NodeState::Alive;
                    existing.incarnation = incarnation;
                    existing.last_seen = Some(Instant::now());
                    drop(existing);
                    if was_suspect {
                        self.bump_topology();
                    }
                } else if incarnation == existing.incarnation
                    && existing.state == NodeState::Suspect
                {
                    tracing::info!(
                        "Node {:?} at {} successfully refuted suspicion",
                        existing.id,
                        existing.gossip_addr,
                    );
                    existing.state = NodeState::Alive;
                    existing.incarnation = incarnation;
                    existing.last_seen = Some(Instant::now());
                    drop(existing);
                    self.bump_topology();
                }
            }
            None => {
                tracing::debug!("Alive message for unknown node {:?}", node_id);
            }
        }

        Ok(())
    }

    async fn failure_detection_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(FAILURE_DETECTION_INTERVAL);

        loop {
            interval.tick().await;
            let now = Instant::now();

            let mut messages_to_broadcast = Vec::new();
            let mut topology_changed = false;

            for mut entry in self.members.iter_mut() {
                let member = entry.value_mut();

                if member.id == self.local_node.id {
                    continue;
                }

                if let Some(last_seen) = member.last_seen {
                    let elapsed = now.duration_since(last_seen);

                    match member.state {
                        NodeState::Alive => {
                            if elapsed > SUSPECT_TIMEOUT {
                                tracing::warn!(
                                    "Node {:?} suspected (no contact for {:?})",
                                    member.id,
                                    elapsed
                                );

                                member.state = NodeState::Suspect;
                                topology_changed = true;

                                let msg = GossipMessage::Suspect {
                                    node_id: member.id.clone(),
                                    incarnation: member.incarnation,
                                };

                                messages_to_broadcast.push(msg);
                            }
                        }

                        NodeState::Suspect => {
                            if elapsed > DEAD_TIMEOUT {
                                tracing::warn!(
                                    "Node {:?} declared DEAD (no contact for {:?})",
                                    member.id,
                                    elapsed
                                );

                                member.state = NodeState::Dead;
                            }
                        }

                        NodeState::Dead => {
                            tracing::debug!(
                                "Node {:?} DEAD (no contact for {:?})",
                                member.id,
                                elapsed
                            );
                        }
                    }
                } else {
                    member.last_seen = Some(now);
                }
            }

            if topology_changed {
                self.bump_topology();
            }

            for msg in messages_to_broadcast {
                self.broadcast_message(msg).await;
            }
        }
    }

    async fn broadcast_message(&self, msg: GossipMessage) {
        if let Ok(encoded) = bincode::serialize(&msg) {
            for entry in self.members.iter() {
                let member = entry.value();

                if member.id == self.local_node.id {
                    continue;
                }

                if member.state == NodeState::Alive
                    && let Err(e) = self.socket.send_to(&encoded, member.gossip_addr).await
                {
                    tracing::warn!("Failed to broadcast to {:?}: {}", member.id, e);
                }
            }
        }
    }
}
