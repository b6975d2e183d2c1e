use crate::membership::{
    service::MembershipService,
    types::{NodeId, TopologySnapshot},
};
use std::collections::VecDeque;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};

/// How many past assignments stay queryable for in-flight transactions.
const ASSIGNMENT_HISTORY: usize = 2;

/// Full hash of a key string. Partition placement takes this modulo the
/// partition count; the transaction coordinator uses it as the fixed global
/// lock order.
pub fn key_hash(key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// Owner lists for every partition, computed for one topology snapshot.
#[derive(Debug, Clone)]
pub struct AffinityAssignment {
    pub topology_version: u64,
    owners: Vec<Vec<NodeId>>,
}

impl AffinityAssignment {
    pub fn owners(&self, partition: u32) -> &[NodeId] {
        &self.owners[partition as usize]
    }

    pub fn primary(&self, partition: u32) -> Option<&NodeId> {
        self.owners[partition as usize].first()
    }
}

/// Deterministic key -> partition -> ordered-owner-list mapping.
///
/// The key hash is independent of live membership; owner lists are a pure
/// function of one topology snapshot. Assignments are cached per topology
/// version, and the previous assignment remains queryable while rebalancing
/// completes so transactions started under it can finish consistently.
pub struct PartitionManager {
    pub num_partitions: u32,
    pub replication_factor: usize,
    membership: Arc<MembershipService>,
    assignments: RwLock<VecDeque<Arc<AffinityAssignment>>>,
}

impl PartitionManager {
    pub fn new(membership: Arc<MembershipService>) -> Arc<Self> {
        Self::with_settings(membership, 256, 1)
    }

    pub fn with_settings(
        membership: Arc<MembershipService>,
        num_partitions: u32,
        replication_factor: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            num_partitions,
            replication_factor,
            membership,
            assignments: RwLock::new(VecDeque::new()),
        })
    }

    pub fn get_partition(&self, key: &str) -> u32 {
        let hash = key_hash(key) as u32;
        hash % self.num_partitions
    }

    /// Owner list for a partition under a fixed snapshot: index 0 is the
    /// primary, followed by backups. No duplicates; `replication_factor + 1`
    /// nodes when that many are alive, otherwise every alive node.
    pub fn owners_in(&self, partition: u32, snapshot: &TopologySnapshot) -> Vec<NodeId> {
        let nodes = &snapshot.members;
        if nodes.is_empty() {
            return vec![];
        }

        let wanted = (self.replication_factor + 1).min(nodes.len());
        let primary_idx = (partition as usize) % nodes.len();

        (0..wanted)
            .map(|offset| nodes[(primary_idx + offset) % nodes.len()].clone())
            .collect()
    }

    /// Owners under the current topology. The assignment for the observed
    /// topology version is computed once and cached.
    pub fn get_owners(&self, partition: u32) -> Vec<NodeId> {
        self.current_assignment().owners(partition).to_vec()
    }

    /// The full assignment for the current topology version.
    pub fn current_assignment(&self) -> Arc<AffinityAssignment> {
        let snapshot = self.membership.topology_snapshot();

        if let Some(cached) = self
            .assignments
            .read()
            .expect("affinity lock poisoned")
            .front()
            && cached.topology_version == snapshot.version
        {
            return cached.clone();
        }

        self.compute_assignment(&snapshot)
    }

    /// The assignment superseded by the current one, if still retained.
    /// Rebalancing diffs it against the current assignment to find moved
    /// partitions and their previous owners.
    pub fn previous_assignment(&self) -> Option<Arc<AffinityAssignment>> {
        self.assignments
            .read()
            .expect("affinity lock poisoned")
            .get(1)
            .cloned()
    }

    /// The assignment that was current at `topology_version`, if it is still
    /// within the retained history.
    pub fn assignment_at(&self, topology_version: u64) -> Option<Arc<AffinityAssignment>> {
        self.assignments
            .read()
            .expect("affinity lock poisoned")
            .iter()
            .find(|a| a.topology_version == topology_version)
            .cloned()
    }

    fn compute_assignment(&self, snapshot: &TopologySnapshot) -> Arc<AffinityAssignment> {
        let owners = (0..self.num_partitions)
            .map(|partition| self.owners_in(partition, snapshot))
            .collect();

        let assignment = Arc::new(AffinityAssignment {
            topology_version: snapshot.version,
            owners,
        });

        let mut history = self.assignments.write().expect("affinity lock poisoned");
        // Another thread may have raced the computation for the same version.
        if history
            .front()
            .is_none_or(|front| front.topology_version < snapshot.version)
        {
            history.push_front(assignment.clone());
            history.truncate(ASSIGNMENT_HISTORY);
        }

        assignment
    }

    pub fn my_primary_partitions(&self) -> Vec<u32> {
        let my_id = &self.membership.local_node.id;
        let assignment = self.current_assignment();

        (0..self.num_partitions)
            .filter(|&partition| assignment.primary(partition) == Some(my_id))
            .collect()
    }

    pub fn my_backup_partitions(&self) -> Vec<u32> {
        let my_id = &self.membership.local_node.id;
        let assignment = self.current_assignment();

        (0..self.num_partitions)
            .filter(|&partition| {
                let owners = assignment.owners(partition);
                owners.len() > 1 && owners[1..].contains(my_id)
            })
            .collect()
    }

    /// Whether `node` owns `partition` (as primary or backup) under the
    /// given snapshot. Store warmup uses this to keep only owned entries.
    pub fn owns_in(&self, partition: u32, node: &NodeId, snapshot: &TopologySnapshot) -> bool {
        self.owners_in(partition, snapshot).contains(node)
    }

    pub fn local_node_id(&self) -> NodeId {
        self.membership.local_node.id.clone()
    }
}
