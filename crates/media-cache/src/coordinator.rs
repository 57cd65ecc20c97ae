//! Singleflight coordination of fetches
//!
//! At most one fetch per [`CacheKey`] runs at any instant. Later callers for
//! the same key subscribe to the in-flight fetch and receive its outcome.
//!
//! ```text
//! caller A ─┐
//!           │                                 detached task
//! caller B ─┼──► PrefetchCoordinator ───────► fetch_fn() ──► Store::put
//!           │          │                            │
//! caller C ─┘          ▼                            ▼
//!               [A, B, C wait on the      publish + remove PendingFetch
//!                same watch channel] ◄────── (one critical section)
//! ```
//!
//! Every caller, the initiator included, only waits on the settlement
//! channel. The fetch itself runs on a spawned task, so dropping any caller's
//! future leaves the fetch and all other waiters untouched.

use crate::asset::CachedAsset;
use crate::fetcher::{FetchError, FetchResult};
use crate::key::CacheKey;
use crate::store::Store;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, warn};

/// `None` until the fetch settles
type Settlement = Option<FetchResult>;

/// Record of a fetch that has started but not yet settled
struct PendingFetch {
    tx: watch::Sender<Settlement>,
    /// Set when the key is invalidated mid-flight; the result goes to waiters
    /// but never enters the store
    invalidated: bool,
}

struct Shared {
    store: Arc<Store>,
    pending: Mutex<HashMap<CacheKey, PendingFetch>>,
    started: AtomicU64,
    coalesced: AtomicU64,
}

impl Shared {
    // Lock order: pending, then store.
    fn lock_pending(&self) -> MutexGuard<'_, HashMap<CacheKey, PendingFetch>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish an outcome and retire the PendingFetch in one critical section
    fn settle(&self, key: &CacheKey, outcome: FetchResult) {
        let mut pending = self.lock_pending();
        let entry = pending.remove(key);

        match &outcome {
            Ok(_) if entry.as_ref().is_some_and(|e| e.invalidated) => {
                debug!(key = %key, "Dropped result of fetch invalidated in flight");
            }
            Ok(asset) => {
                self.store.put(key.clone(), asset.clone());
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Fetch failed");
            }
        }

        if let Some(entry) = entry {
            let waiters = entry.tx.receiver_count();
            entry.tx.send_replace(Some(outcome));
            debug!(key = %key, waiters, "Fetch settled");
        }
    }
}

/// Settles the key with [`FetchError::Aborted`] if the fetch task ends
/// without reporting, e.g. when `fetch_fn` panics or the runtime shuts down.
struct SettleGuard {
    shared: Arc<Shared>,
    key: CacheKey,
    settled: bool,
}

impl SettleGuard {
    fn finish(mut self, outcome: FetchResult) {
        self.settled = true;
        self.shared.settle(&self.key, outcome);
    }
}

impl Drop for SettleGuard {
    fn drop(&mut self) {
        if !self.settled {
            warn!(key = %self.key, "Fetch task ended without a result");
            self.shared.settle(&self.key, Err(FetchError::Aborted));
        }
    }
}

/// Outcome of registering interest in a key
pub(crate) enum Join {
    /// The asset was already stored
    Cached(CachedAsset),
    /// This call started a fetch
    Started(watch::Receiver<Settlement>),
    /// This call joined a fetch already in flight
    Joined(watch::Receiver<Settlement>),
}

impl Join {
    fn new(rx: watch::Receiver<Settlement>, started: bool) -> Self {
        if started {
            Join::Started(rx)
        } else {
            Join::Joined(rx)
        }
    }
}

/// Deduplicates concurrent fetches per key.
///
/// Cloning is cheap and every clone coordinates through the same state.
#[derive(Clone)]
pub struct PrefetchCoordinator {
    shared: Arc<Shared>,
}

impl PrefetchCoordinator {
    /// Create a coordinator that stores successful results in `store`
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                pending: Mutex::new(HashMap::new()),
                started: AtomicU64::new(0),
                coalesced: AtomicU64::new(0),
            }),
        }
    }

    /// Whether a fetch for `key` is in flight right now.
    ///
    /// The answer may be stale by the time the caller acts on it.
    pub fn is_in_progress(&self, key: &CacheKey) -> bool {
        self.shared.lock_pending().contains_key(key)
    }

    /// Wait until the in-flight fetch for `key` settles.
    ///
    /// Returns immediately when nothing is in flight. The asset is not
    /// returned: it may already be evicted, so callers re-query the store.
    pub async fn await_completion(&self, key: &CacheKey) {
        let rx = self
            .shared
            .lock_pending()
            .get(key)
            .map(|pending| pending.tx.subscribe());

        if let Some(rx) = rx {
            let _ = wait_settled(rx).await;
        }
    }

    /// Run `fetch_fn` for `key` unless a fetch is already in flight, in which
    /// case wait for that one instead. `fetch_fn` is invoked at most once per
    /// settlement and all callers receive the same outcome.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn run_exclusive<F, Fut>(&self, key: &CacheKey, fetch_fn: F) -> FetchResult
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FetchResult> + Send + 'static,
    {
        let (rx, _) = {
            let mut pending = self.shared.lock_pending();
            self.join_or_start(&mut pending, key, fetch_fn)
        };
        wait_settled(rx).await
    }

    /// Like [`run_exclusive`](Self::run_exclusive), but a stored asset found
    /// while holding the pending lock is returned without starting a fetch.
    ///
    /// This closes the window in which a fetch settles between a caller's
    /// store miss and its registration.
    pub(crate) fn join<F, Fut>(&self, key: &CacheKey, fetch_fn: F) -> Join
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FetchResult> + Send + 'static,
    {
        let mut pending = self.shared.lock_pending();
        if !pending.contains_key(key) {
            if let Some(asset) = self.shared.store.peek(key) {
                return Join::Cached(asset);
            }
        }
        let (rx, started) = self.join_or_start(&mut pending, key, fetch_fn);
        Join::new(rx, started)
    }

    fn join_or_start<F, Fut>(
        &self,
        pending: &mut HashMap<CacheKey, PendingFetch>,
        key: &CacheKey,
        fetch_fn: F,
    ) -> (watch::Receiver<Settlement>, bool)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FetchResult> + Send + 'static,
    {
        if let Some(existing) = pending.get(key) {
            self.shared.coalesced.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Joining in-flight fetch");
            return (existing.tx.subscribe(), false);
        }

        // Resolve the runtime before registering, so a missing runtime
        // panics without leaving a PendingFetch behind
        let runtime = tokio::runtime::Handle::current();

        let (tx, rx) = watch::channel(None);
        pending.insert(
            key.clone(),
            PendingFetch {
                tx,
                invalidated: false,
            },
        );
        self.shared.started.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, in_flight = pending.len(), "Starting fetch");

        let guard = SettleGuard {
            shared: Arc::clone(&self.shared),
            key: key.clone(),
            settled: false,
        };
        runtime.spawn(async move {
            let outcome = fetch_fn().await;
            guard.finish(outcome);
        });

        (rx, true)
    }

    /// Mark an in-flight fetch so its result does not survive settlement.
    ///
    /// Returns whether a fetch was in flight.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        match self.shared.lock_pending().get_mut(key) {
            Some(pending) => {
                pending.invalidated = true;
                true
            }
            None => false,
        }
    }

    /// Mark every in-flight fetch as invalidated
    pub fn invalidate_all(&self) -> usize {
        let mut pending = self.shared.lock_pending();
        for entry in pending.values_mut() {
            entry.invalidated = true;
        }
        pending.len()
    }

    /// Remove `key` from the store while holding the pending lock, so a
    /// settlement cannot slip in between marking and removal
    pub(crate) fn invalidate_with_store(&self, key: &CacheKey) -> bool {
        let mut pending = self.shared.lock_pending();
        if let Some(entry) = pending.get_mut(key) {
            entry.invalidated = true;
        }
        self.shared.store.invalidate(key)
    }

    pub(crate) fn clear_with_store(&self) -> usize {
        let mut pending = self.shared.lock_pending();
        for entry in pending.values_mut() {
            entry.invalidated = true;
        }
        self.shared.store.clear();
        pending.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.shared.lock_pending().len()
    }

    /// Fetches actually started
    pub fn started_count(&self) -> u64 {
        self.shared.started.load(Ordering::Relaxed)
    }

    /// Requests that joined an existing fetch
    pub fn coalesced_count(&self) -> u64 {
        self.shared.coalesced.load(Ordering::Relaxed)
    }
}

/// Wait for a settlement to be published
pub(crate) async fn wait_settled(mut rx: watch::Receiver<Settlement>) -> FetchResult {
    let outcome = match rx.wait_for(Option::is_some).await {
        Ok(settled) => (*settled).clone(),
        // Sender dropped without publishing
        Err(_) => None,
    };
    outcome.unwrap_or(Err(FetchError::Aborted))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn asset() -> CachedAsset {
        CachedAsset::from_rgba(4, 4, vec![0; 64]).unwrap()
    }

    async fn exploding_fetch() -> FetchResult {
        panic!("decoder exploded")
    }

    fn coordinator() -> (PrefetchCoordinator, Arc<Store>) {
        let store = Arc::new(Store::new(1024 * 1024));
        (PrefetchCoordinator::new(Arc::clone(&store)), store)
    }

    #[tokio::test]
    async fn test_run_exclusive_stores_result() {
        let (coordinator, store) = coordinator();
        let key = CacheKey::new("", "a.png");
        let a = asset();
        let expected = a.clone();

        let result = coordinator.run_exclusive(&key, move || async move { Ok(a) }).await;

        assert!(result.unwrap().ptr_eq(&expected));
        assert!(store.peek(&key).unwrap().ptr_eq(&expected));
        assert!(!coordinator.is_in_progress(&key));
        assert_eq!(coordinator.started_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_fetch() {
        let (coordinator, _store) = coordinator();
        let key = CacheKey::new("", "shared.png");
        let calls = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let first = {
            let coordinator = coordinator.clone();
            let key = key.clone();
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                coordinator
                    .run_exclusive(&key, move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        let _ = release_rx.await;
                        Ok(asset())
                    })
                    .await
            })
        };

        while !coordinator.is_in_progress(&key) {
            tokio::task::yield_now().await;
        }

        let joiners: Vec<_> = (0..4)
            .map(|_| {
                let coordinator = coordinator.clone();
                let key = key.clone();
                let calls = Arc::clone(&calls);
                tokio::spawn(async move {
                    coordinator
                        .run_exclusive(&key, move || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok(asset())
                        })
                        .await
                })
            })
            .collect();

        // Let the joiners register before releasing the fetch
        while coordinator.coalesced_count() < 4 {
            tokio::task::yield_now().await;
        }
        release_tx.send(()).unwrap();

        let leader = first.await.unwrap().unwrap();
        for joiner in joiners {
            assert!(joiner.await.unwrap().unwrap().ptr_eq(&leader));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.started_count(), 1);
    }

    #[tokio::test]
    async fn test_failure_reaches_all_waiters_and_is_retryable() {
        let (coordinator, store) = coordinator();
        let key = CacheKey::new("", "flaky.png");
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let first = {
            let coordinator = coordinator.clone();
            let key = key.clone();
            tokio::spawn(async move {
                coordinator
                    .run_exclusive(&key, move || async move {
                        let _ = release_rx.await;
                        Err(FetchError::TransientIo("connection reset".into()))
                    })
                    .await
            })
        };
        while !coordinator.is_in_progress(&key) {
            tokio::task::yield_now().await;
        }
        let second = {
            let coordinator = coordinator.clone();
            let key = key.clone();
            tokio::spawn(async move {
                coordinator
                    .run_exclusive(&key, || async { Ok(asset()) })
                    .await
            })
        };
        while coordinator.coalesced_count() < 1 {
            tokio::task::yield_now().await;
        }
        release_tx.send(()).unwrap();

        let expected = FetchError::TransientIo("connection reset".into());
        assert_eq!(first.await.unwrap().unwrap_err(), expected);
        assert_eq!(second.await.unwrap().unwrap_err(), expected);
        assert!(store.is_empty());
        assert!(!coordinator.is_in_progress(&key));

        // No stale failure state: the next call runs its own fetch
        let retried = coordinator.run_exclusive(&key, || async { Ok(asset()) }).await;
        assert!(retried.is_ok());
        assert_eq!(coordinator.started_count(), 2);
    }

    #[tokio::test]
    async fn test_await_completion_without_pending_returns_immediately() {
        let (coordinator, _store) = coordinator();
        tokio::time::timeout(
            Duration::from_millis(100),
            coordinator.await_completion(&CacheKey::new("", "idle.png")),
        )
        .await
        .expect("await_completion should not block");
    }

    #[tokio::test]
    async fn test_await_completion_waits_for_settlement() {
        let (coordinator, store) = coordinator();
        let key = CacheKey::new("", "slow.png");
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let fetch = {
            let coordinator = coordinator.clone();
            let key = key.clone();
            tokio::spawn(async move {
                coordinator
                    .run_exclusive(&key, move || async move {
                        let _ = release_rx.await;
                        Ok(asset())
                    })
                    .await
            })
        };
        while !coordinator.is_in_progress(&key) {
            tokio::task::yield_now().await;
        }

        let waiter = {
            let coordinator = coordinator.clone();
            let key = key.clone();
            tokio::spawn(async move { coordinator.await_completion(&key).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        release_tx.send(()).unwrap();
        waiter.await.unwrap();
        assert!(store.peek(&key).is_some());
        fetch.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_cancel_fetch() {
        let (coordinator, store) = coordinator();
        let key = CacheKey::new("", "cancel.png");
        let (release_tx, release_rx) = oneshot::channel::<()>();

        // The initiator gives up long before the fetch completes
        let initiator = coordinator.run_exclusive(&key, move || async move {
            let _ = release_rx.await;
            Ok(asset())
        });
        let timed_out = tokio::time::timeout(Duration::from_millis(10), initiator).await;
        assert!(timed_out.is_err());
        assert!(coordinator.is_in_progress(&key));

        let survivor = {
            let coordinator = coordinator.clone();
            let key = key.clone();
            tokio::spawn(async move {
                coordinator
                    .run_exclusive(&key, || async { Ok(asset()) })
                    .await
            })
        };
        while coordinator.coalesced_count() < 1 {
            tokio::task::yield_now().await;
        }
        release_tx.send(()).unwrap();

        assert!(survivor.await.unwrap().is_ok());
        assert!(store.peek(&key).is_some());
        assert_eq!(coordinator.started_count(), 1);
    }

    #[tokio::test]
    async fn test_panicking_fetch_releases_waiters() {
        let (coordinator, _store) = coordinator();
        let key = CacheKey::new("", "boom.png");

        let result = coordinator.run_exclusive(&key, exploding_fetch).await;

        assert_eq!(result.unwrap_err(), FetchError::Aborted);
        assert!(!coordinator.is_in_progress(&key));

        let retried = coordinator.run_exclusive(&key, || async { Ok(asset()) }).await;
        assert!(retried.is_ok());
    }

    #[tokio::test]
    async fn test_invalidate_in_flight_drops_result() {
        let (coordinator, store) = coordinator();
        let key = CacheKey::new("masks", "m.png");
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let fetch = {
            let coordinator = coordinator.clone();
            let key = key.clone();
            tokio::spawn(async move {
                coordinator
                    .run_exclusive(&key, move || async move {
                        let _ = release_rx.await;
                        Ok(asset())
                    })
                    .await
            })
        };
        while !coordinator.is_in_progress(&key) {
            tokio::task::yield_now().await;
        }

        assert!(coordinator.invalidate(&key));
        release_tx.send(()).unwrap();

        // The caller still gets the fetched asset, but it is not retained
        assert!(fetch.await.unwrap().is_ok());
        assert!(store.peek(&key).is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_invalidated_result_does_not_evict_other_entries() {
        // Room for exactly two assets
        let store = Arc::new(Store::new(asset().footprint() * 2));
        let coordinator = PrefetchCoordinator::new(Arc::clone(&store));
        let a = CacheKey::new("", "a.png");
        let b = CacheKey::new("", "b.png");
        let c = CacheKey::new("", "c.png");
        store.put(a.clone(), asset());
        store.put(b.clone(), asset());

        let (release_tx, release_rx) = oneshot::channel::<()>();
        let fetch = {
            let coordinator = coordinator.clone();
            let c = c.clone();
            tokio::spawn(async move {
                coordinator
                    .run_exclusive(&c, move || async move {
                        let _ = release_rx.await;
                        Ok(asset())
                    })
                    .await
            })
        };
        while !coordinator.is_in_progress(&c) {
            tokio::task::yield_now().await;
        }

        assert!(coordinator.invalidate(&c));
        release_tx.send(()).unwrap();
        assert!(fetch.await.unwrap().is_ok());

        assert!(store.peek(&c).is_none());
        assert!(store.peek(&a).is_some());
        assert!(store.peek(&b).is_some());
        assert_eq!(store.stats().evictions, 0);
    }

    #[tokio::test]
    async fn test_invalidate_without_pending_is_noop() {
        let (coordinator, _store) = coordinator();
        assert!(!coordinator.invalidate(&CacheKey::new("", "none.png")));
        assert_eq!(coordinator.invalidate_all(), 0);
    }
}
