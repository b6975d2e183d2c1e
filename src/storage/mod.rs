//! Distributed Storage Module
//!
//! Implements the partitioned, replicated, lockable in-memory store.
//!
//! ## Core Concepts
//! - **Partitioning**: Data is divided into fixed partitions based on key hashing.
//! - **Placement**: `PartitionManager` assigns partitions to nodes (Primary + Backups)
//!   deterministically per topology snapshot, keeping the previous assignment queryable
//!   while rebalancing completes.
//! - **Versioned Entries**: every committed write strictly increases the entry version;
//!   each entry carries a single-holder lock with a FIFO wait queue.
//! - **Replication**: the Primary applies writes and pushes them to Backups, which apply
//!   them passively (idempotent, last-version-wins, no locks).

pub mod entry;
pub mod handlers;
pub mod partitioner;
pub mod protocol;
pub mod store;

#[cfg(test)]
mod tests;
