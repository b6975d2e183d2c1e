//! Persistent store collaborator boundary.
//!
//! Durability is delegated to an external system behind a small capability
//! trait, selected through configuration rather than inheritance.

/// Read-through source for cache warmup.
///
/// `load_all` is consumed once per node; the cache keeps only the entries
/// whose partition the node owns (primary or backup).
pub trait CacheStore<K, V>: Send + Sync {
    fn load_all(&self, args: &[String]) -> anyhow::Result<Vec<(K, V)>>;
}
