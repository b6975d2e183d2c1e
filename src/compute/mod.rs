//! Compute Routing Module
//!
//! Places jobs on cluster nodes and reroutes them on failure.
//!
//! ## Architecture Overview
//! 1. **Registration**: job logic lives in the `JobRegistry` as named closures.
//! 2. **Eligibility**: a job runs only on alive nodes inside its static projection
//!    that also satisfy its predicate.
//! 3. **Failover**: on failure, the `FailoverPolicy` picks an untried eligible node;
//!    with none left, the original failure propagates unchanged. Reroute decisions
//!    are reported through an injected observer.
//!
//! The cache core exposes affinity and partition lookups to this module for
//! placement decisions; it never calls back into routing.

pub mod failover;
pub mod registry;
pub mod router;
pub mod types;

#[cfg(test)]
mod tests;
