//! Keyed memo cache with explicit TTL eviction.
//!
//! Used for facts that are expensive to look up and monotone once true:
//! the custodial wallet's router registration and a receiver's opt-in
//! status. Behind a trait so callers can swap in a shared external store.

use dashmap::DashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// A set of keys with per-entry expiry. Implementations must be thread-safe.
pub trait TtlCache<K>: Send + Sync {
    /// True if the key is present and not expired.
    fn contains(&self, key: &K) -> bool;

    /// Record the key, refreshing its expiry.
    fn insert(&self, key: K);

    /// Drop expired entries. Returns the number removed.
    fn purge_expired(&self) -> usize;
}

/// In-process implementation backed by DashMap.
pub struct InMemoryTtlCache<K> {
    entries: DashMap<K, Instant>,
    ttl: Duration,
}

impl<K: Eq + Hash> InMemoryTtlCache<K> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }
}

impl<K: Eq + Hash + Send + Sync> TtlCache<K> for InMemoryTtlCache<K> {
    fn contains(&self, key: &K) -> bool {
        match self.entries.get(key) {
            Some(inserted) => inserted.elapsed() < self.ttl,
            None => false,
        }
    }

    fn insert(&self, key: K) {
        self.entries.insert(key, Instant::now());
    }

    fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, inserted| inserted.elapsed() < ttl);
        before - self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_contains() {
        let cache = InMemoryTtlCache::new(Duration::from_secs(60));
        assert!(!cache.contains(&"key"));
        cache.insert("key");
        assert!(cache.contains(&"key"));
    }

    #[test]
    fn expired_entries_are_invisible_and_purged() {
        let cache = InMemoryTtlCache::new(Duration::ZERO);
        cache.insert("key");
        assert!(!cache.contains(&"key"));
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.purge_expired(), 0);
    }

    #[test]
    fn purge_keeps_live_entries() {
        let cache = InMemoryTtlCache::new(Duration::from_secs(60));
        cache.insert("a");
        cache.insert("b");
        assert_eq!(cache.purge_expired(), 0);
        assert!(cache.contains(&"a"));
        assert!(cache.contains(&"b"));
    }
}
