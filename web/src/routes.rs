//! HTTP surface.
//!
//! Routes:
//!   GET  /image?airport=&cam=&fmt=           → webcam frame (never an error status)
//!   GET  /api/health                         → health check
//!   GET  /api/cameras/{airport}/{cam}/status → cache/breaker/lock snapshot
//!   POST /api/cache/clear?airport=&cam=      → operator invalidation

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use axum::extract::{Path, Query, State};
use axum::http::header::{
    CACHE_CONTROL, CONTENT_TYPE, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED,
};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info};

use aerocam_common::key::{is_valid_airport_id, CameraKey, ImageFormat};
use aerocam_common::protocol::{CameraStatus, ClearResponse, ErrorResponse, HealthResponse};

use crate::cache::unix_secs;
use crate::coordinator::{CacheStatus, FrameMeta, RefreshCoordinator, Served};
use crate::registry::CameraRegistry;

const X_CACHE_STATUS: HeaderName = HeaderName::from_static("x-cache-status");
const X_IMAGE_TIMESTAMP: HeaderName = HeaderName::from_static("x-image-timestamp");

/// Shared state for route handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: RefreshCoordinator,
    pub registry: Arc<CameraRegistry>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(coordinator: RefreshCoordinator, registry: Arc<CameraRegistry>) -> Self {
        Self {
            coordinator,
            registry,
            start_time: Instant::now(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/image", get(image))
        .route("/api/health", get(health))
        .route("/api/cameras/{airport}/{cam}/status", get(camera_status))
        .route("/api/cache/clear", post(clear_cache))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server. Blocks until shutdown.
pub async fn run(
    state: AppState,
    listen_addr: &str,
    shutdown: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let app = router(state);

    let listener = TcpListener::bind(listen_addr).await?;
    info!("Aerocam HTTP server listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
            }
        })
        .await?;

    Ok(())
}

// ── image ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ImageQuery {
    airport: Option<String>,
    cam: Option<String>,
    fmt: Option<String>,
}

async fn image(
    State(state): State<AppState>,
    Query(query): Query<ImageQuery>,
    headers: HeaderMap,
) -> Response {
    let format = ImageFormat::from_param(query.fmt.as_deref());
    let camera = match (&query.airport, &query.cam) {
        (Some(airport), Some(cam)) => CameraKey::parse(airport, cam),
        _ => None,
    }
    .and_then(|key| state.registry.lookup(&key).map(|source| (key, source)));

    let served = match camera {
        Some((key, source)) => state.coordinator.serve(&key, &source, format).await,
        None => {
            debug!(
                airport = query.airport.as_deref().unwrap_or(""),
                cam = query.cam.as_deref().unwrap_or(""),
                "Unknown camera, serving placeholder"
            );
            state.coordinator.placeholder(format)
        }
    };

    image_response(served, &headers)
}

fn image_response(served: Served, request: &HeaderMap) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(served.format.content_type()),
    );
    headers.insert(X_CACHE_STATUS, HeaderValue::from_static(served.status.as_str()));

    let Some(meta) = &served.frame else {
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        return (StatusCode::OK, headers, served.body).into_response();
    };

    let cache_control = match served.status {
        CacheStatus::Hit | CacheStatus::Miss => {
            format!("public, max-age={}", meta.remaining.as_secs())
        }
        CacheStatus::Stale | CacheStatus::RateLimited => {
            "public, max-age=0, must-revalidate".to_string()
        }
    };
    set(&mut headers, CACHE_CONTROL, &cache_control);
    set(&mut headers, ETAG, &meta.etag);
    set(&mut headers, LAST_MODIFIED, &http_date(meta.modified));
    set(
        &mut headers,
        X_IMAGE_TIMESTAMP,
        &unix_secs(meta.modified).to_string(),
    );

    if not_modified(request, meta) {
        headers.remove(CONTENT_TYPE);
        return (StatusCode::NOT_MODIFIED, headers).into_response();
    }
    (StatusCode::OK, headers, served.body).into_response()
}

fn set(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

/// `If-None-Match` wins over `If-Modified-Since` when both are present.
fn not_modified(request: &HeaderMap, meta: &FrameMeta) -> bool {
    if let Some(inm) = request.get(IF_NONE_MATCH).and_then(|v| v.to_str().ok()) {
        return inm.split(',').map(str::trim).any(|tag| {
            tag == "*" || tag.strip_prefix("W/").unwrap_or(tag) == meta.etag
        });
    }
    request
        .get(IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
        .is_some_and(|since| since.timestamp() >= unix_secs(meta.modified) as i64)
}

/// IMF-fixdate, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
fn http_date(t: SystemTime) -> String {
    DateTime::<Utc>::from(t)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

// ── JSON endpoints ───────────────────────────────────────────────────────

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        cameras: state.registry.snapshot().camera_count(),
    })
}

async fn camera_status(
    State(state): State<AppState>,
    Path((airport, cam)): Path<(String, String)>,
) -> Result<Json<CameraStatus>, ApiError> {
    let key = CameraKey::parse(&airport, &cam)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "unknown camera"))?;
    let source = state
        .registry
        .lookup(&key)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "unknown camera"))?;
    Ok(Json(state.coordinator.status(&key, &source).await))
}

#[derive(Debug, Deserialize)]
struct ClearQuery {
    airport: Option<String>,
    cam: Option<String>,
}

async fn clear_cache(
    State(state): State<AppState>,
    Query(query): Query<ClearQuery>,
) -> Result<Json<ClearResponse>, ApiError> {
    let cache = state.coordinator.cache();
    let result = match (query.airport.as_deref(), query.cam.as_deref()) {
        (None, None) => cache.clear(None).await,
        (Some(airport), Some(cam)) => {
            let key = CameraKey::parse(airport, cam)
                .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "invalid airport or camera"))?;
            cache.clear(Some(&key)).await
        }
        (Some(airport), None) => {
            let airport = airport.trim().to_ascii_lowercase();
            if !is_valid_airport_id(&airport) {
                return Err(api_error(StatusCode::BAD_REQUEST, "invalid airport"));
            }
            let count = state
                .registry
                .snapshot()
                .airport(&airport)
                .map_or(0, |a| a.cameras.len());
            let mut removed = 0;
            for cam in 0..count {
                if let Some(key) = CameraKey::new(&airport, cam) {
                    removed += cache.clear(Some(&key)).await.map_err(clear_failed)?;
                }
            }
            Ok(removed)
        }
        (None, Some(_)) => {
            return Err(api_error(StatusCode::BAD_REQUEST, "cam requires airport"))
        }
    };

    let removed = result.map_err(clear_failed)?;
    info!(
        airport = query.airport.as_deref().unwrap_or("*"),
        cam = query.cam.as_deref().unwrap_or("*"),
        removed,
        "Cache cleared"
    );
    Ok(Json(ClearResponse { removed }))
}

fn clear_failed(e: std::io::Error) -> ApiError {
    error!("Cache clear failed: {e}");
    api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> FrameMeta {
        FrameMeta {
            modified: SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000),
            etag: "\"6553f100.0-400-jpg\"".into(),
            remaining: Duration::ZERO,
        }
    }

    fn request(name: HeaderName, value: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(name, HeaderValue::from_str(value).unwrap());
        h
    }

    #[test]
    fn test_http_date_format() {
        assert_eq!(http_date(meta().modified), "Tue, 14 Nov 2023 22:13:20 GMT");
    }

    #[test]
    fn test_if_none_match() {
        assert!(not_modified(&request(IF_NONE_MATCH, "\"6553f100.0-400-jpg\""), &meta()));
        assert!(not_modified(
            &request(IF_NONE_MATCH, "\"x\", W/\"6553f100.0-400-jpg\""),
            &meta()
        ));
        assert!(not_modified(&request(IF_NONE_MATCH, "*"), &meta()));
        assert!(!not_modified(&request(IF_NONE_MATCH, "\"other\""), &meta()));
    }

    #[test]
    fn test_if_modified_since() {
        let exact = http_date(meta().modified);
        assert!(not_modified(&request(IF_MODIFIED_SINCE, &exact), &meta()));
        assert!(!not_modified(
            &request(IF_MODIFIED_SINCE, "Tue, 14 Nov 2023 22:13:19 GMT"),
            &meta()
        ));
        assert!(!not_modified(&request(IF_MODIFIED_SINCE, "yesterday"), &meta()));
        assert!(!not_modified(&HeaderMap::new(), &meta()));
    }

    #[test]
    fn test_etag_mismatch_ignores_date() {
        let mut h = request(IF_NONE_MATCH, "\"other\"");
        h.insert(
            IF_MODIFIED_SINCE,
            HeaderValue::from_str(&http_date(meta().modified)).unwrap(),
        );
        assert!(!not_modified(&h, &meta()));
    }
}
