//! Byte-bounded LRU store for decoded assets

use crate::asset::CachedAsset;
use crate::key::CacheKey;
use lru::LruCache;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

struct StoreInner {
    /// Entries in access order, least recently used first
    entries: LruCache<CacheKey, CachedAsset>,
    /// Sum of footprints of all entries
    total_bytes: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// Point-in-time view of store bookkeeping
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Mapping from [`CacheKey`] to [`CachedAsset`] bounded by a byte budget.
///
/// Eviction runs inside [`Store::put`], so the budget holds after every
/// insertion rather than eventually. The only exception is a single asset
/// larger than the whole budget, which is kept alone.
pub struct Store {
    inner: Mutex<StoreInner>,
    budget_bytes: u64,
}

impl Store {
    /// Create an empty store with the given byte budget
    pub fn new(budget_bytes: u64) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                entries: LruCache::unbounded(),
                total_bytes: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
            budget_bytes,
        }
    }

    // Bookkeeping cannot be left half-done by a panic, so a poisoned lock is
    // still safe to use.
    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up an asset and mark it most recently used
    pub fn get(&self, key: &CacheKey) -> Option<CachedAsset> {
        let mut inner = self.lock();
        match inner.entries.get(key).cloned() {
            Some(asset) => {
                inner.hits += 1;
                Some(asset)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Look up an asset without touching access order or counters
    pub fn peek(&self, key: &CacheKey) -> Option<CachedAsset> {
        self.lock().entries.peek(key).cloned()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lock().entries.contains(key)
    }

    /// Insert or replace an asset, then evict least recently used entries
    /// (never the one just inserted) until the store is within budget.
    ///
    /// Returns the number of entries evicted.
    pub fn put(&self, key: CacheKey, asset: CachedAsset) -> usize {
        let size = asset.footprint();
        let mut inner = self.lock();

        if let Some(previous) = inner.entries.put(key.clone(), asset) {
            inner.total_bytes -= previous.footprint();
        }
        inner.total_bytes += size;

        let mut evicted = 0;
        while inner.total_bytes > self.budget_bytes && inner.entries.len() > 1 {
            // The new entry is most recently used, so it is never popped here
            let Some((old_key, old_asset)) = inner.entries.pop_lru() else {
                break;
            };
            inner.total_bytes -= old_asset.footprint();
            inner.evictions += 1;
            evicted += 1;
            debug!(key = %old_key, size = old_asset.footprint(), "Evicted least recently used asset");
        }

        debug!(
            key = %key,
            size,
            total_bytes = inner.total_bytes,
            evicted,
            "Stored asset"
        );
        evicted
    }

    /// Remove one entry; returns whether it was present
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let mut inner = self.lock();
        match inner.entries.pop(key) {
            Some(asset) => {
                inner.total_bytes -= asset.footprint();
                debug!(key = %key, "Invalidated asset");
                true
            }
            None => false,
        }
    }

    /// Remove every entry
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.total_bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn total_footprint(&self) -> u64 {
        self.lock().total_bytes
    }

    pub fn budget(&self) -> u64 {
        self.budget_bytes
    }

    /// Keys from least to most recently used
    pub fn keys_by_recency(&self) -> Vec<CacheKey> {
        // LruCache iterates most recent first
        let inner = self.lock();
        let mut keys: Vec<CacheKey> = inner.entries.iter().map(|(k, _)| k.clone()).collect();
        keys.reverse();
        keys
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.lock();
        StoreStats {
            entries: inner.entries.len(),
            total_bytes: inner.total_bytes,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    /// Asset whose footprint is exactly `bytes` (must be a multiple of 4)
    fn asset(bytes: u32) -> CachedAsset {
        CachedAsset::from_rgba(bytes / 4, 1, vec![0; bytes as usize]).unwrap()
    }

    fn key(name: &str) -> CacheKey {
        CacheKey::new("", name)
    }

    #[test]
    fn test_put_and_get() {
        let store = Store::new(1024);
        let a = asset(100);
        store.put(key("a"), a.clone());

        let got = store.get(&key("a")).unwrap();
        assert!(got.ptr_eq(&a));
        assert_eq!(store.total_footprint(), 100);
        assert!(store.get(&key("missing")).is_none());
    }

    #[test]
    fn test_hit_miss_counters() {
        let store = Store::new(1024);
        store.get(&key("a"));
        store.put(key("a"), asset(8));
        store.get(&key("a"));
        store.peek(&key("a"));

        let stats = store.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn test_replace_adjusts_footprint() {
        let store = Store::new(1024);
        store.put(key("a"), asset(400));
        store.put(key("a"), asset(100));

        assert_eq!(store.len(), 1);
        assert_eq!(store.total_footprint(), 100);
    }

    #[test]
    fn test_lru_eviction_keeps_most_recent() {
        // Room for three 100-byte assets
        let store = Store::new(300);
        for name in ["k1", "k2", "k3", "k4", "k5"] {
            store.put(key(name), asset(100));
            assert!(store.total_footprint() <= 300);
        }

        assert_eq!(store.keys_by_recency(), vec![key("k3"), key("k4"), key("k5")]);
        assert_eq!(store.stats().evictions, 2);
    }

    #[test]
    fn test_access_protects_from_eviction() {
        let store = Store::new(300);
        store.put(key("k1"), asset(100));
        store.put(key("k2"), asset(100));
        store.put(key("k3"), asset(100));

        // Touch k1 so k2 becomes least recently used
        assert!(store.get(&key("k1")).is_some());
        let evicted = store.put(key("k4"), asset(100));

        assert_eq!(evicted, 1);
        assert!(store.peek(&key("k2")).is_none());
        assert_eq!(store.keys_by_recency(), vec![key("k3"), key("k1"), key("k4")]);
    }

    #[test]
    fn test_large_insert_evicts_several() {
        let store = Store::new(300);
        store.put(key("k1"), asset(100));
        store.put(key("k2"), asset(100));
        store.put(key("k3"), asset(100));

        let evicted = store.put(key("big"), asset(240));
        assert_eq!(evicted, 3);
        assert_eq!(store.keys_by_recency(), vec![key("big")]);
        assert_eq!(store.total_footprint(), 240);
    }

    #[test]
    fn test_oversized_entry_remains_alone() {
        let store = Store::new(100);
        store.put(key("small"), asset(40));
        store.put(key("huge"), asset(400));

        assert_eq!(store.len(), 1);
        assert!(store.peek(&key("huge")).is_some());
        assert_eq!(store.total_footprint(), 400);

        // The next insertion brings the store back under budget
        store.put(key("small"), asset(40));
        assert_eq!(store.keys_by_recency(), vec![key("small")]);
        assert_eq!(store.total_footprint(), 40);
    }

    #[test]
    fn test_invalidate_and_clear() {
        let store = Store::new(1024);
        store.put(key("a"), asset(100));
        store.put(key("b"), asset(100));

        assert!(store.invalidate(&key("a")));
        assert!(!store.invalidate(&key("a")));
        assert_eq!(store.total_footprint(), 100);

        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.total_footprint(), 0);
    }

    #[test]
    fn test_budget_holds_under_concurrent_puts() {
        let store = Arc::new(Store::new(1000));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for i in 0..50 {
                        store.put(key(&format!("t{}-{}", t, i)), asset(96));
                        assert!(store.total_footprint() <= 1000);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let stats = store.stats();
        assert!(stats.total_bytes <= 1000);
        assert_eq!(stats.total_bytes, stats.entries as u64 * 96);
    }
}
