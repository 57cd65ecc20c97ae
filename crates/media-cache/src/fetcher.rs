//! Fetcher boundary: how a key becomes a decoded asset
//!
//! The cache never performs I/O itself. Concrete fetchers (HTTP, local disk)
//! implement [`AssetFetcher`]; the coordinator makes sure concurrent requests
//! for one key collapse into a single call.

use crate::asset::CachedAsset;
use crate::key::CacheKey;
use async_trait::async_trait;
use std::fmt;

/// Why a fetch did not produce an asset.
///
/// Every waiter on a fetch receives an identical copy of this value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The asset does not exist upstream
    NotFound(String),
    /// Network or disk hiccup; the caller may retry
    TransientIo(String),
    /// Bytes were retrieved but are not a valid image or frame
    DecodeFailure(String),
    /// The fetch task ended without producing a result
    Aborted,
}

impl FetchError {
    /// Whether a caller-driven retry can be expected to help
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::TransientIo(_) | FetchError::Aborted)
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::NotFound(msg) => write!(f, "Asset not found: {}", msg),
            FetchError::TransientIo(msg) => write!(f, "Transient I/O error: {}", msg),
            FetchError::DecodeFailure(msg) => write!(f, "Decode failure: {}", msg),
            FetchError::Aborted => write!(f, "Fetch aborted before settling"),
        }
    }
}

impl std::error::Error for FetchError {}

impl From<image::ImageError> for FetchError {
    fn from(err: image::ImageError) -> Self {
        FetchError::DecodeFailure(err.to_string())
    }
}

pub type FetchResult = std::result::Result<CachedAsset, FetchError>;

/// Produces decoded assets for cache keys
#[async_trait]
pub trait AssetFetcher: Send + Sync {
    async fn fetch(&self, key: &CacheKey) -> FetchResult;
}

/// Decode image bytes into an RGBA asset.
///
/// A numeric `variant` (e.g. `"256"`) bounds the longest edge; the image is
/// downscaled to fit while keeping its aspect ratio. Other variants leave the
/// image at full size.
pub fn decode_asset(bytes: &[u8], variant: Option<&str>) -> FetchResult {
    let image = image::load_from_memory(bytes)?;

    let image = match variant.and_then(|v| v.parse::<u32>().ok()) {
        Some(max_edge) if max_edge > 0 && (image.width() > max_edge || image.height() > max_edge) => {
            image.thumbnail(max_edge, max_edge)
        }
        _ => image,
    };

    let rgba = image.into_rgba8();
    let (width, height) = rgba.dimensions();
    CachedAsset::from_rgba(width, height, rgba.into_raw())
}
