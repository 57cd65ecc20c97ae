//! Fetchers that turn cache keys into decoded assets

use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use media_cache::{decode_asset, AssetFetcher, CacheKey, FetchError, FetchResult};
use reqwest::Client;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, warn};
use url::Url;

/// Decode on the blocking pool so large images don't stall the runtime
async fn decode_off_thread(bytes: Vec<u8>, variant: Option<String>) -> FetchResult {
    tokio::task::spawn_blocking(move || decode_asset(&bytes, variant.as_deref()))
        .await
        .unwrap_or(Err(FetchError::Aborted))
}

/// Fetches assets from the generation server's `/view` endpoint
pub struct HttpFetcher {
    client: Client,
    base_url: Url,
}

impl HttpFetcher {
    /// Create a fetcher for the server at `base_url`
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)?;
        if base_url.cannot_be_a_base() {
            return Err(ProxyError::Config(format!(
                "upstream URL cannot be a base: {}",
                base_url
            )));
        }

        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url })
    }

    /// URL of the asset on the upstream server
    pub fn view_url(&self, key: &CacheKey) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("view");
        }
        url.query_pairs_mut()
            .append_pair("filename", key.filename())
            .append_pair("subfolder", key.subfolder())
            .append_pair("type", key.asset_type().as_str());
        url
    }
}

#[async_trait]
impl AssetFetcher for HttpFetcher {
    async fn fetch(&self, key: &CacheKey) -> FetchResult {
        let url = self.view_url(key);
        debug!(key = %key, url = %url, "Fetching asset from upstream");

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| FetchError::TransientIo(e.to_string()))?;

        let status = response.status();
        // 404 for unknown files, 400 for paths the server refuses
        if status.is_client_error() {
            debug!(key = %key, status = %status, "Upstream has no such asset");
            return Err(FetchError::NotFound(format!(
                "upstream returned status {} for {}",
                status, key
            )));
        }
        if !status.is_success() {
            warn!(key = %key, status = %status, url = %url, "Failed to fetch asset");
            return Err(FetchError::TransientIo(format!(
                "upstream returned status {}",
                status
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| FetchError::TransientIo(e.to_string()))?;

        debug!(key = %key, size = bytes.len(), "Fetched asset bytes");
        decode_off_thread(bytes.to_vec(), key.variant().map(str::to_string)).await
    }
}

/// Reads assets from a local directory laid out like the server's storage:
/// `{root}/{type}/{subfolder}/{filename}`
pub struct DirFetcher {
    root: PathBuf,
}

impl DirFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve the on-disk path for a key, refusing anything that would
    /// escape the asset type's directory
    pub fn resolve(&self, key: &CacheKey) -> Option<PathBuf> {
        let relative = Path::new(key.subfolder()).join(key.filename());
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !safe || key.filename().is_empty() {
            return None;
        }
        Some(self.root.join(key.asset_type().as_str()).join(relative))
    }
}

#[async_trait]
impl AssetFetcher for DirFetcher {
    async fn fetch(&self, key: &CacheKey) -> FetchResult {
        let path = self.resolve(key).ok_or_else(|| {
            warn!(key = %key, "Rejected asset path outside the media directory");
            FetchError::NotFound(format!("invalid asset path: {}", key))
        })?;

        debug!(key = %key, path = ?path, "Reading asset from disk");
        let bytes = fs::read(&path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => FetchError::NotFound(path.display().to_string()),
            _ => FetchError::TransientIo(format!("{}: {}", path.display(), e)),
        })?;

        decode_off_thread(bytes, key.variant().map(str::to_string)).await
    }
}
