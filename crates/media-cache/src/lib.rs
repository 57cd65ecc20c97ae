//! Media cache and prefetch coordinator for generated images and video frames
//!
//! Sits between many concurrent UI consumers and a slow fetch (disk or
//! network I/O plus decoding):
//!
//! - a byte-bounded LRU [`Store`] of decoded [`CachedAsset`]s,
//! - a [`PrefetchCoordinator`] that collapses concurrent fetches of the same
//!   [`CacheKey`] into one ("singleflight"),
//! - the [`MediaCache`] facade consumers talk to.
//!
//! The cache never performs I/O itself; fetches go through an
//! [`AssetFetcher`] or a caller-supplied closure.

mod asset;
mod coordinator;
mod error;
mod facade;
mod fetcher;
mod key;
mod store;
mod types;

pub use asset::CachedAsset;
pub use coordinator::PrefetchCoordinator;
pub use error::{MediaCacheError, Result};
pub use facade::MediaCache;
pub use fetcher::{decode_asset, AssetFetcher, FetchError, FetchResult};
pub use key::{AssetType, CacheKey, MediaKind};
pub use store::{Store, StoreStats};
pub use types::{CacheConfig, CacheStats, DEFAULT_BUDGET_BYTES};
