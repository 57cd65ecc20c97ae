//! Core types for the media cache proxy

use media_cache::{CacheKey, CacheStats, DEFAULT_BUDGET_BYTES};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Where assets are fetched from on a cache miss
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchSource {
    /// Generation server exposing `/view?filename=&subfolder=&type=`
    Upstream(String),
    /// Local copy of the server's `output`/`input`/`temp` directories
    Directory(PathBuf),
}

/// Configuration for the media cache proxy
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub port: u16,
    pub source: FetchSource,
    pub budget_bytes: u64,
    pub fetch_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: 3005,
            source: FetchSource::Upstream("http://127.0.0.1:8188".to_string()),
            budget_bytes: DEFAULT_BUDGET_BYTES, // 256MB
            fetch_timeout_secs: 30,
        }
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub cache: CacheStats,
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub retryable: bool,
}

/// Body of `POST /prefetch`
#[derive(Debug, Deserialize)]
pub struct PrefetchRequest {
    pub keys: Vec<CacheKey>,
}

#[derive(Debug, Serialize)]
pub struct PrefetchResponse {
    pub requested: usize,
    /// Fetches newly started; the rest were cached or already in flight
    pub started: usize,
}

/// Response of `GET /asset/status`
#[derive(Debug, Serialize)]
pub struct AssetStatus {
    pub key: String,
    pub cached: bool,
    pub in_progress: bool,
}
