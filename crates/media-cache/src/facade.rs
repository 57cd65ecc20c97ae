//! Public cache API used by UI-facing consumers

use crate::asset::CachedAsset;
use crate::coordinator::{wait_settled, Join, PrefetchCoordinator};
use crate::error::Result;
use crate::fetcher::{AssetFetcher, FetchError, FetchResult};
use crate::key::CacheKey;
use crate::store::Store;
use crate::types::{CacheConfig, CacheStats};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

/// Media cache composed of a bounded [`Store`] and a [`PrefetchCoordinator`].
///
/// Construct one per process (or session) and hand clones to consumers; all
/// clones share the same store and in-flight state. Call
/// [`shutdown`](Self::shutdown) when the session ends.
#[derive(Clone)]
pub struct MediaCache {
    store: Arc<Store>,
    coordinator: PrefetchCoordinator,
}

impl MediaCache {
    /// Create a cache with the configured byte budget
    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(Store::new(config.budget_bytes));
        let coordinator = PrefetchCoordinator::new(Arc::clone(&store));
        info!(budget_bytes = config.budget_bytes, "Media cache initialized");
        Ok(Self { store, coordinator })
    }

    /// Synchronous store lookup; never waits on a fetch
    pub fn lookup(&self, key: &CacheKey) -> Option<CachedAsset> {
        self.store.get(key)
    }

    /// Return the cached asset, join an in-flight fetch for it, or start one.
    ///
    /// Concurrent calls for the same key run `fetch_fn` once and all observe
    /// the same outcome. A waiter whose asset was evicted before it resumed
    /// still receives the shared asset.
    pub async fn fetch_or_await<F, Fut>(&self, key: &CacheKey, fetch_fn: F) -> FetchResult
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FetchResult> + Send + 'static,
    {
        self.resolve(key, fetch_fn).await.map(|(asset, _)| asset)
    }

    /// Like [`fetch_with`](Self::fetch_with), but also reports whether the
    /// asset came straight from the store (`true`) or from a fetch.
    pub async fn fetch_with_hit(
        &self,
        key: &CacheKey,
        fetcher: &Arc<dyn AssetFetcher>,
    ) -> std::result::Result<(CachedAsset, bool), FetchError> {
        let fetcher = Arc::clone(fetcher);
        let owned_key = key.clone();
        self.resolve(key, move || async move { fetcher.fetch(&owned_key).await })
            .await
    }

    async fn resolve<F, Fut>(
        &self,
        key: &CacheKey,
        fetch_fn: F,
    ) -> std::result::Result<(CachedAsset, bool), FetchError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FetchResult> + Send + 'static,
    {
        if let Some(asset) = self.store.get(key) {
            return Ok((asset, true));
        }

        match self.coordinator.join(key, fetch_fn) {
            Join::Cached(asset) => Ok((asset, true)),
            Join::Started(rx) | Join::Joined(rx) => {
                wait_settled(rx).await.map(|asset| (asset, false))
            }
        }
    }

    /// [`fetch_or_await`](Self::fetch_or_await) through an [`AssetFetcher`]
    pub async fn fetch_with(
        &self,
        key: &CacheKey,
        fetcher: &Arc<dyn AssetFetcher>,
    ) -> FetchResult {
        let fetcher = Arc::clone(fetcher);
        let owned_key = key.clone();
        self.fetch_or_await(key, move || async move { fetcher.fetch(&owned_key).await })
            .await
    }

    /// Start loading `key` in the background unless it is cached or already
    /// in flight. Returns whether a new fetch was started.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime.
    pub fn trigger_prefetch<F, Fut>(&self, key: &CacheKey, fetch_fn: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FetchResult> + Send + 'static,
    {
        if self.store.contains(key) || self.coordinator.is_in_progress(key) {
            return false;
        }

        match self.coordinator.join(key, fetch_fn) {
            Join::Started(_) => {
                debug!(key = %key, "Prefetch triggered");
                true
            }
            Join::Cached(_) | Join::Joined(_) => false,
        }
    }

    /// [`trigger_prefetch`](Self::trigger_prefetch) through an [`AssetFetcher`]
    pub fn prefetch_with(&self, key: &CacheKey, fetcher: &Arc<dyn AssetFetcher>) -> bool {
        let fetcher = Arc::clone(fetcher);
        let owned_key = key.clone();
        self.trigger_prefetch(key, move || async move { fetcher.fetch(&owned_key).await })
    }

    /// Prefetch several keys, e.g. the gallery items adjacent to the one on
    /// screen. Returns how many fetches were started.
    pub fn prefetch_many<'a, I>(&self, keys: I, fetcher: &Arc<dyn AssetFetcher>) -> usize
    where
        I: IntoIterator<Item = &'a CacheKey>,
    {
        keys.into_iter()
            .filter(|key| self.prefetch_with(key, fetcher))
            .count()
    }

    /// Whether `key` is stored, without counting a hit or refreshing recency
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.store.contains(key)
    }

    pub fn is_in_progress(&self, key: &CacheKey) -> bool {
        self.coordinator.is_in_progress(key)
    }

    /// Wait for an in-flight fetch of `key` to settle, if there is one
    pub async fn await_completion(&self, key: &CacheKey) {
        self.coordinator.await_completion(key).await
    }

    /// Drop `key` from the store. A fetch for it that is still in flight
    /// completes and reaches its waiters, but its result is not stored.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.coordinator.invalidate_with_store(key)
    }

    /// Drop everything, including results of fetches still in flight
    pub fn clear(&self) {
        let pending = self.coordinator.clear_with_store();
        debug!(pending, "Cache cleared");
    }

    pub fn stats(&self) -> CacheStats {
        let store = self.store.stats();
        CacheStats {
            entries: store.entries,
            total_bytes: store.total_bytes,
            budget_bytes: self.store.budget(),
            hits: store.hits,
            misses: store.misses,
            evictions: store.evictions,
            in_flight: self.coordinator.in_flight_count(),
            fetches_started: self.coordinator.started_count(),
            fetches_coalesced: self.coordinator.coalesced_count(),
        }
    }

    /// Tear down at the end of a session: clear everything and log totals
    pub fn shutdown(&self) {
        self.clear();
        let stats = self.stats();
        info!(
            hits = stats.hits,
            misses = stats.misses,
            evictions = stats.evictions,
            fetches_started = stats.fetches_started,
            fetches_coalesced = stats.fetches_coalesced,
            "Media cache shut down"
        );
    }
}
