//! HTTP server for media cache endpoints
//!
//! Provides /health, /asset, /asset/status, /prefetch and /cache endpoints.

use crate::types::{AssetStatus, ErrorResponse, HealthResponse, PrefetchRequest, PrefetchResponse};
use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use chrono::{DateTime, Utc};
use media_cache::{AssetFetcher, CacheKey, CachedAsset, FetchError, MediaCache};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

/// Shared state for the HTTP server
pub struct ServerState {
    pub cache: MediaCache,
    pub fetcher: Arc<dyn AssetFetcher>,
    pub started_at: DateTime<Utc>,
}

impl ServerState {
    pub fn new(cache: MediaCache, fetcher: Arc<dyn AssetFetcher>) -> Self {
        Self {
            cache,
            fetcher,
            started_at: Utc::now(),
        }
    }
}

pub type SharedState = Arc<ServerState>;

/// Create the HTTP router
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/asset", get(get_asset).delete(invalidate_asset))
        .route("/asset/status", get(asset_status))
        .route("/prefetch", post(prefetch))
        .route("/cache", delete(clear_cache))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server and serve until Ctrl-C
pub async fn start_server(state: SharedState, port: u16) -> std::io::Result<()> {
    let router = create_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Health check endpoint
async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let uptime_secs = (Utc::now() - state.started_at).num_seconds() as u64;

    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs,
        cache: state.cache.stats(),
    })
}

/// Get an asset as PNG, fetching it (once, however many clients ask) on a miss
async fn get_asset(State(state): State<SharedState>, Query(key): Query<CacheKey>) -> Response {
    let (asset, from_cache) = match state.cache.fetch_with_hit(&key, &state.fetcher).await {
        Ok(found) => found,
        Err(e) => {
            warn!(key = %key, error = %e, "Failed to fetch asset");
            return fetch_error_response(&e);
        }
    };

    match encode_png(asset).await {
        Ok(png) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "image/png")
            .header(header::CACHE_CONTROL, "public, max-age=86400")
            .header("X-Cache", if from_cache { "HIT" } else { "MISS" })
            .header("X-Cache-Key", key.as_canonical())
            .body(Body::from(png))
            .unwrap_or_else(|e| {
                error!(key = %key, error = %e, "Failed to build asset response");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }),
        Err(e) => {
            error!(key = %key, error = %e, "Failed to encode asset");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "Failed to encode asset".to_string(),
                    retryable: true,
                }),
            )
                .into_response()
        }
    }
}

async fn encode_png(asset: CachedAsset) -> Result<Vec<u8>, String> {
    tokio::task::spawn_blocking(move || asset.encode_png().map_err(|e| e.to_string()))
        .await
        .map_err(|e| e.to_string())?
}

/// Map a fetch failure to a status code clients can act on: placeholder for
/// 404, retry affordance for the rest
fn fetch_error_response(err: &FetchError) -> Response {
    let status = match err {
        FetchError::NotFound(_) => StatusCode::NOT_FOUND,
        FetchError::DecodeFailure(_) => StatusCode::UNPROCESSABLE_ENTITY,
        FetchError::TransientIo(_) | FetchError::Aborted => StatusCode::BAD_GATEWAY,
    };

    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            retryable: err.is_retryable(),
        }),
    )
        .into_response()
}

/// Whether an asset is cached or being fetched, without fetching it
async fn asset_status(
    State(state): State<SharedState>,
    Query(key): Query<CacheKey>,
) -> Json<AssetStatus> {
    Json(AssetStatus {
        key: key.as_canonical(),
        cached: state.cache.contains(&key),
        in_progress: state.cache.is_in_progress(&key),
    })
}

/// Start background fetches for upcoming assets
async fn prefetch(
    State(state): State<SharedState>,
    Json(request): Json<PrefetchRequest>,
) -> (StatusCode, Json<PrefetchResponse>) {
    let started = state.cache.prefetch_many(&request.keys, &state.fetcher);
    info!(requested = request.keys.len(), started, "Prefetch requested");

    (
        StatusCode::ACCEPTED,
        Json(PrefetchResponse {
            requested: request.keys.len(),
            started,
        }),
    )
}

/// Drop a stale asset, e.g. a mask preview after the mask was edited
async fn invalidate_asset(
    State(state): State<SharedState>,
    Query(key): Query<CacheKey>,
) -> StatusCode {
    state.cache.invalidate(&key);
    info!(key = %key, "Asset invalidated");
    StatusCode::NO_CONTENT
}

async fn clear_cache(State(state): State<SharedState>) -> StatusCode {
    state.cache.clear();
    info!("Cache cleared");
    StatusCode::NO_CONTENT
}
