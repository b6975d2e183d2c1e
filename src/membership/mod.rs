//! Membership & Discovery Module
//!
//! Implements a Gossip-based membership protocol (inspired by SWIM) to manage the cluster topology.
//! Nodes use this service to discover each other, detect failures, and disseminate cluster state updates.
//!
//! ## Core Mechanisms
//! - **Gossip Protocol**: Nodes periodically exchange status updates via UDP to maintain a consistent view of the cluster.
//! - **Join Gate**: A joining node must carry invariant attributes identical to the cluster's;
//!   any divergence rejects the join with a verdict naming the attribute.
//! - **Failure Detection**: Uses a "Suspect" -> "Dead" transition model with timeouts to handle node crashes gracefully.
//! - **Incarnation Numbers**: Solves conflict resolution when node state (Alive/Suspect) is disputed.
//! - **Topology Versioning**: Every effective membership change bumps a version observable
//!   through a watch channel; affinity and rebalancing key off it.

pub mod service;
pub mod types;

#[cfg(test)]
mod tests;
