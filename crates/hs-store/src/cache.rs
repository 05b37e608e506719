//! In-memory value cache.
//!
//! Entries are keyed by normalized handle and bounded by count with LRU
//! eviction. A handle known not to exist is cached as
//! [`CachedEntry::NotFound`], distinct from "not cached" (`None`).
//!
//! The cache is advisory: `get` followed by `set` is not atomic, and
//! concurrent updates to one handle may interleave.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use hs_core::time::epoch_secs;
use hs_core::Handle;
use hs_proto::HandleValue;
use parking_lot::RwLock;
use tracing::trace;

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of cached handles
    pub max_entries: usize,
    /// Seconds a not-found answer stays cached
    pub not_found_ttl_secs: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            not_found_ttl_secs: 600,
        }
    }
}

/// What the cache knows about a handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedEntry {
    /// The handle's values.
    Values(Vec<HandleValue>),
    /// The handle does not exist.
    NotFound,
}

struct CacheSlot {
    entry: CachedEntry,
    /// Epoch seconds the entry was stored
    retrieved_at: u32,
    /// Monotonic counter for LRU
    last_access: u64,
}

/// Cache statistics.
#[derive(Debug, Default, Clone)]
pub struct CacheStats {
    /// Cache hits
    pub hits: u64,
    /// Cache misses
    pub misses: u64,
    /// LRU evictions
    pub evictions: u64,
    /// Entries dropped because they expired
    pub expirations: u64,
}

/// LRU cache of handle values.
pub struct MemCache {
    config: CacheConfig,
    entries: RwLock<HashMap<Bytes, CacheSlot>>,
    access_counter: AtomicU64,
    stats: RwLock<CacheStats>,
}

impl MemCache {
    /// Creates a cache with the given configuration.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
            access_counter: AtomicU64::new(0),
            stats: RwLock::new(CacheStats::default()),
        }
    }

    /// Creates a cache with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(CacheConfig::default())
    }

    /// Looks up a handle now.
    pub fn get_cached_values(&self, handle: &Handle) -> Option<CachedEntry> {
        self.get_cached_values_at(handle, epoch_secs())
    }

    /// Looks up a handle as of `now` (epoch seconds). Expired entries are
    /// dropped and reported as a miss.
    pub fn get_cached_values_at(&self, handle: &Handle, now: u32) -> Option<CachedEntry> {
        let key = handle.normalized();
        let mut entries = self.entries.write();

        let expired = match entries.get(&key) {
            None => {
                self.stats.write().misses += 1;
                return None;
            }
            Some(slot) => self.is_expired(slot, now),
        };
        if expired {
            entries.remove(&key);
            let mut stats = self.stats.write();
            stats.expirations += 1;
            stats.misses += 1;
            trace!(handle = %handle, "cache entry expired");
            return None;
        }

        let slot = entries.get_mut(&key)?;
        slot.last_access = self.access_counter.fetch_add(1, Ordering::Relaxed);
        self.stats.write().hits += 1;
        Some(slot.entry.clone())
    }

    /// Caches the values of a handle.
    pub fn set_cached_values(&self, handle: &Handle, values: Vec<HandleValue>) {
        self.insert(handle, CachedEntry::Values(values), epoch_secs());
    }

    /// Caches the values of a handle as retrieved at `now`.
    pub fn set_cached_values_at(&self, handle: &Handle, values: Vec<HandleValue>, now: u32) {
        self.insert(handle, CachedEntry::Values(values), now);
    }

    /// Caches that a handle does not exist.
    pub fn set_cached_not_found(&self, handle: &Handle) {
        self.insert(handle, CachedEntry::NotFound, epoch_secs());
    }

    /// Caches that a handle does not exist, as of `now`.
    pub fn set_cached_not_found_at(&self, handle: &Handle, now: u32) {
        self.insert(handle, CachedEntry::NotFound, now);
    }

    /// Drops a handle.
    pub fn remove_handle(&self, handle: &Handle) -> bool {
        self.entries.write().remove(&handle.normalized()).is_some()
    }

    /// Number of cached handles.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Clears the cache.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Returns cache statistics.
    pub fn stats(&self) -> CacheStats {
        self.stats.read().clone()
    }

    fn is_expired(&self, slot: &CacheSlot, now: u32) -> bool {
        match &slot.entry {
            CachedEntry::NotFound => {
                now.saturating_sub(slot.retrieved_at) > self.config.not_found_ttl_secs
            }
            CachedEntry::Values(values) => {
                values.iter().any(|v| v.is_expired(slot.retrieved_at, now))
            }
        }
    }

    fn insert(&self, handle: &Handle, entry: CachedEntry, now: u32) {
        let key = handle.normalized();
        let mut entries = self.entries.write();
        while entries.len() >= self.config.max_entries && !entries.contains_key(&key) {
            if !self.evict_one(&mut entries) {
                break;
            }
        }
        entries.insert(
            key,
            CacheSlot {
                entry,
                retrieved_at: now,
                last_access: self.access_counter.fetch_add(1, Ordering::Relaxed),
            },
        );
    }

    /// Evicts the least recently used entry.
    fn evict_one(&self, entries: &mut HashMap<Bytes, CacheSlot>) -> bool {
        let lru_key = entries
            .iter()
            .min_by_key(|(_, slot)| slot.last_access)
            .map(|(k, _)| k.clone());

        match lru_key {
            Some(key) => {
                entries.remove(&key);
                self.stats.write().evictions += 1;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hs_proto::TtlType;

    const NOW: u32 = 1_700_000_000;

    fn values(ttl: u32) -> Vec<HandleValue> {
        vec![HandleValue::new(1, "URL", "http://x").with_ttl(TtlType::Relative, ttl)]
    }

    #[test]
    fn test_not_cached_vs_not_found() {
        let cache = MemCache::with_defaults();
        let h = Handle::from("10.1000/1");
        assert_eq!(cache.get_cached_values_at(&h, NOW), None);

        cache.set_cached_not_found_at(&h, NOW);
        assert_eq!(cache.get_cached_values_at(&h, NOW + 1), Some(CachedEntry::NotFound));
        // Not-found answers age out.
        assert_eq!(cache.get_cached_values_at(&h, NOW + 601), None);
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = MemCache::with_defaults();
        let h = Handle::from("10.1000/1");
        cache.set_cached_values_at(&h, values(60), NOW);
        assert!(matches!(
            cache.get_cached_values_at(&h, NOW + 30),
            Some(CachedEntry::Values(_))
        ));
        assert_eq!(cache.get_cached_values_at(&h, NOW + 61), None);
        assert_eq!(cache.stats().expirations, 1);

        // ttl 0 is expired immediately.
        cache.set_cached_values_at(&h, values(0), NOW);
        assert_eq!(cache.get_cached_values_at(&h, NOW), None);
    }

    #[test]
    fn test_prefix_case_insensitive() {
        let cache = MemCache::with_defaults();
        cache.set_cached_values_at(&Handle::from("abc.def/X"), values(60), NOW);
        assert!(cache
            .get_cached_values_at(&Handle::from("ABC.DEF/X"), NOW)
            .is_some());
        assert!(cache
            .get_cached_values_at(&Handle::from("abc.def/x"), NOW)
            .is_none());
    }

    #[test]
    fn test_lru_eviction() {
        let cache = MemCache::new(CacheConfig {
            max_entries: 2,
            ..Default::default()
        });
        let a = Handle::from("10.1000/a");
        let b = Handle::from("10.1000/b");
        let c = Handle::from("10.1000/c");
        cache.set_cached_values_at(&a, values(60), NOW);
        cache.set_cached_values_at(&b, values(60), NOW);
        // Touch a so b is least recently used.
        cache.get_cached_values_at(&a, NOW);
        cache.set_cached_values_at(&c, values(60), NOW);

        assert_eq!(cache.len(), 2);
        assert!(cache.get_cached_values_at(&a, NOW).is_some());
        assert!(cache.get_cached_values_at(&b, NOW).is_none());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_remove_and_clear() {
        let cache = MemCache::with_defaults();
        let h = Handle::from("10.1000/1");
        cache.set_cached_values(&h, values(60));
        assert!(cache.remove_handle(&h));
        assert!(!cache.remove_handle(&h));
        cache.set_cached_not_found(&h);
        cache.clear();
        assert!(cache.is_empty());
    }
}
