use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use std::sync::Arc;
use thiserror::Error;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};

pub mod admission;
pub mod cache;
pub mod config;
pub mod fetch;
pub mod key;
pub mod writeback;

use crate::admission::admit;
use crate::cache::{CacheLookup, CachedImage, ImageCache, ObjectStore};
use crate::config::ProxyConfig;
use crate::fetch::{forwardable_headers, Origin, OriginError, OriginOutcome, OriginRequest};
use crate::key::{CacheKey, NormalizedParams};
use crate::writeback::{TaskScheduler, WriteBack};

pub const FORBIDDEN_BODY: &str = "Forbidden";
pub const NOT_FOUND_BODY: &str = "Not Found";
pub const INTERNAL_ERROR_BODY: &str =
    "Internal server error. Please contact the site administrator.";

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Upstream error: {0}")]
    Origin(#[from] OriginError),
    #[error("Internal server error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ProxyError>;

// Callers only ever see a generic message; the cause is logged by the handler.
impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR_BODY).into_response()
    }
}

/// Everything a request needs, built once at startup.
pub struct AppState {
    pub config: Arc<ProxyConfig>,
    pub cache: ImageCache,
    pub origin: Arc<dyn Origin>,
    pub writeback: WriteBack,
}

impl AppState {
    pub fn new(
        config: ProxyConfig,
        store: Arc<dyn ObjectStore>,
        origin: Arc<dyn Origin>,
        scheduler: Arc<dyn TaskScheduler>,
    ) -> Self {
        let cache = ImageCache::new(store, config.cache_prefix.clone());
        let writeback = WriteBack::new(cache.clone(), scheduler, config.max_cache_object_size);
        Self {
            config: Arc::new(config),
            cache,
            origin,
            writeback,
        }
    }
}

fn hit_response(image: CachedImage) -> Result<Response> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, image.content_type)
        .header(header::ETAG, image.etag)
        .body(Body::from(image.bytes))
        .map_err(|e| ProxyError::Internal(e.to_string()))
}

/// Admission, key derivation, cache lookup, then upstream on a miss.
async fn proxy(
    state: &AppState,
    method: Method,
    uri: &Uri,
    headers: HeaderMap,
) -> Result<Response> {
    let path = uri.path();
    if !admit(path, &state.config.allowed_path_prefixes).is_admitted() {
        tracing::debug!(path, "Path not in allowlist");
        return Ok((StatusCode::FORBIDDEN, FORBIDDEN_BODY).into_response());
    }

    let params = NormalizedParams::from_query(uri.query());
    let key = CacheKey::derive(path, &params);

    if let CacheLookup::Hit(image) = state.cache.lookup(&key).await {
        tracing::info!(key = %key, "Cache hit");
        return hit_response(image);
    }

    tracing::info!(key = %key, "Cache miss, fetching from upstream");
    let request = OriginRequest {
        method,
        headers: forwardable_headers(&headers),
        path: path.to_string(),
        params,
    };

    match state.origin.send(request).await? {
        OriginOutcome::Success(response) => {
            Ok(state.writeback.attach(key, response).into_response())
        }
        OriginOutcome::FailureResponse(response) => {
            tracing::info!(
                key = %key,
                status = %response.status,
                "Upstream returned non-success status"
            );
            Ok(response.into_response())
        }
        OriginOutcome::NoResponse => {
            tracing::info!(key = %key, "No response from upstream");
            Ok((StatusCode::NOT_FOUND, NOT_FOUND_BODY).into_response())
        }
    }
}

async fn handler(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    match proxy(&state, method, &uri, headers).await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(url = %uri, error = %e, "Request failed");
            e.into_response()
        }
    }
}

fn panic_response(err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.as_str()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        *s
    } else {
        "unknown panic"
    };
    tracing::error!(panic = detail, "Request handler panicked");
    ProxyError::Internal(detail.to_string()).into_response()
}

/// Router that sends every method and path through the caching proxy.
pub fn router(state: AppState) -> Router {
    Router::new()
        .fallback(handler)
        .with_state(Arc::new(state))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
}
