//! Transaction Module
//!
//! Pessimistic, repeatable-read transactions over the partitioned store.
//!
//! ## Lifecycle
//! Active (locks acquired lazily on first touch, writes buffered) ->
//! Preparing (snapshot re-validation) -> Committing (primary writes,
//! backup replication, near pushes) -> Committed, or RolledBack on any
//! failure before the first primary write lands.

pub mod coordinator;
pub mod types;
