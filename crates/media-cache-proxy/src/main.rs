//! Media cache proxy - caching, prefetching preview service
//!
//! Serves generated images and video thumbnails to mobile clients from a
//! bounded in-memory bitmap cache. Concurrent requests for the same asset
//! share one upstream fetch.

mod error;
mod fetch;
mod server;
mod types;

use crate::error::Result;
use crate::fetch::{DirFetcher, HttpFetcher};
use crate::server::{start_server, ServerState, SharedState};
use crate::types::{FetchSource, ProxyConfig};
use media_cache::{AssetFetcher, CacheConfig, MediaCache};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let env_filter = EnvFilter::from_default_env()
        .add_directive("media_cache_proxy=info".parse()?)
        .add_directive("media_cache=info".parse()?);

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    };

    info!("Starting media cache proxy...");

    let config = load_config();
    info!("Port: {}", config.port);
    info!("Source: {:?}", config.source);
    info!("Cache budget: {} MB", config.budget_bytes / (1024 * 1024));
    info!("Fetch timeout: {} seconds", config.fetch_timeout_secs);

    // One cache for the lifetime of the process, injected into handlers
    let cache = MediaCache::new(CacheConfig::with_budget(config.budget_bytes))?;
    let fetcher = build_fetcher(&config)?;

    let state: SharedState = Arc::new(ServerState::new(cache.clone(), fetcher));

    start_server(state, config.port).await?;

    cache.shutdown();
    Ok(())
}

fn build_fetcher(config: &ProxyConfig) -> Result<Arc<dyn AssetFetcher>> {
    let fetcher: Arc<dyn AssetFetcher> = match &config.source {
        FetchSource::Upstream(url) => Arc::new(HttpFetcher::new(
            url,
            Duration::from_secs(config.fetch_timeout_secs),
        )?),
        FetchSource::Directory(root) => Arc::new(DirFetcher::new(root.clone())),
    };
    Ok(fetcher)
}

fn load_config() -> ProxyConfig {
    let defaults = ProxyConfig::default();

    let port = std::env::var("PORT")
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(defaults.port);

    // A local media directory takes precedence over the upstream server
    let source = match std::env::var("MEDIA_DIR") {
        Ok(dir) => FetchSource::Directory(PathBuf::from(dir)),
        Err(_) => std::env::var("UPSTREAM_URL")
            .map(FetchSource::Upstream)
            .unwrap_or(defaults.source),
    };

    let budget_bytes = std::env::var("CACHE_BUDGET_BYTES")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(defaults.budget_bytes);

    let fetch_timeout_secs = std::env::var("FETCH_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(defaults.fetch_timeout_secs);

    ProxyConfig {
        port,
        source,
        budget_bytes,
        fetch_timeout_secs,
    }
}
