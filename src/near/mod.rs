//! Near Cache Module
//!
//! A non-owning node's low-latency mirror of hot remote entries.
//!
//! ## Core Concepts
//! - **Shadows**: (value, version, primary hint) copies populated lazily on first remote read.
//! - **Coherence**: the committing coordinator pushes every new (value, version) to all
//!   known shadow holders; pushes may lag the commit but a shadow's version never regresses.
//! - **Tracking**: each primary records which nodes shadow which of its keys (`ShadowTracker`).
//! - **Eviction**: topology changes drop shadows for affected partitions; they rebuild on next access.

pub mod cache;
pub mod tracker;
