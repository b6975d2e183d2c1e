use serde::{Deserialize, Serialize};

/// Unique identifier for a transaction within the cluster.
///
/// Wrapper around a UUID string. Travels with lock and commit requests so a
/// primary can attribute entry locks to their holder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TxId(pub String);

impl TxId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for TxId {
    fn default() -> Self {
        Self::new()
    }
}

/// Supported concurrency control. Locks are taken on first access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Concurrency {
    Pessimistic,
}

/// Supported isolation level. A transaction observes the same value on
/// re-read of any key it touched, for its whole duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Isolation {
    RepeatableRead,
}

/// Lifecycle of a transaction.
///
/// Active -> Preparing -> Committing -> Committed, or RolledBack from any
/// state before the first primary write lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Active,
    Preparing,
    Committing,
    Committed,
    RolledBack,
}

impl TxState {
    pub fn name(&self) -> &'static str {
        match self {
            TxState::Active => "active",
            TxState::Preparing => "preparing",
            TxState::Committing => "committing",
            TxState::Committed => "committed",
            TxState::RolledBack => "rolled-back",
        }
    }
}
