use crate::cache::{CacheStorage, CacheSweeper};
use crate::config::Config;
use crate::error::{MirrorError, Result};
use crate::registry::{FetchBody, FetchResult, RegistryProxy};
use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::error;

const API_VERSION_HEADER: &str = "Docker-Distribution-API-Version";
const API_VERSION: &str = "registry/2.0";
const CACHE_STATUS_HEADER: &str = "X-Cache";

#[derive(Clone)]
pub struct AppState {
    pub proxy: Arc<RegistryProxy>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(proxy: Arc<RegistryProxy>) -> Self {
        Self {
            proxy,
            started_at: Instant::now(),
        }
    }
}

fn v2_subpath(uri: &Uri) -> String {
    let mut path = uri.path().to_string();

    // containerd may request /v2/v2/<repo>/... when the image reference carries /v2/
    if path.starts_with("/v2/v2/") {
        tracing::warn!(
            original_path = %path,
            "Detected malformed path with double /v2/ prefix - stripping extra prefix"
        );
        path = path.replacen("/v2/v2/", "/v2/", 1);
    }

    path.strip_prefix("/v2/").unwrap_or(&path).to_string()
}

async fn get_v2_wrapper(State(state): State<AppState>, uri: Uri) -> Response {
    let path = v2_subpath(&uri);
    tracing::debug!(path = %path, "GET /v2/ request");

    let result = state.proxy.handle_v2_path(&path).await;
    fetch_response(result, state.proxy.buffer_size(), true)
}

async fn head_v2_wrapper(State(state): State<AppState>, uri: Uri) -> Response {
    let path = v2_subpath(&uri);
    tracing::debug!(path = %path, "HEAD /v2/ request");

    let result = state.proxy.handle_v2_path(&path).await;
    fetch_response(result, state.proxy.buffer_size(), false)
}

/// Turn a fetch into an HTTP response; file-backed bodies stream from disk.
fn fetch_response(result: FetchResult, buffer_size: usize, include_body: bool) -> Response {
    let builder = Response::builder()
        .status(result.status)
        .header(header::CONTENT_TYPE, result.content_type.as_str())
        .header(header::CONTENT_LENGTH, result.content_length())
        .header(API_VERSION_HEADER, API_VERSION)
        .header(
            CACHE_STATUS_HEADER,
            if result.cache_hit { "HIT" } else { "MISS" },
        );

    let body = if include_body {
        match result.body {
            FetchBody::Buffered(data) => Body::from(data),
            FetchBody::File { file, .. } => {
                Body::from_stream(ReaderStream::with_capacity(file, buffer_size))
            }
        }
    } else {
        Body::empty()
    };

    match builder.body(body) {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "Failed to build registry response");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to build response").into_response()
        }
    }
}

async fn api_version() -> impl IntoResponse {
    tracing::debug!("GET /v2/ - API version request");
    (StatusCode::OK, [(API_VERSION_HEADER, API_VERSION)], "{}")
}

async fn health() -> impl IntoResponse {
    tracing::debug!("GET /health - Health check request");
    (StatusCode::OK, "ok")
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/v2/", get(api_version))
        .route("/v2", get(api_version))
        // Multi-segment repository names; _catalog is matched here as well
        .route("/v2/*path", get(get_v2_wrapper).head(head_v2_wrapper))
        .route("/health", get(health))
        .route("/status", get(status))
        .with_state(app_state)
}

/// Bind the configured address and start serving. See [`start_server_with_listener`].
pub async fn start_server(config: Config, cancel: CancellationToken) -> Result<JoinHandle<()>> {
    let addr = format!("{}:{}", config.server.bind_address, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| MirrorError::Config(format!("Failed to bind HTTP listener to {}: {}", addr, e)))?;
    start_server_with_listener(config, listener, cancel).await
}

/// Start the HTTP server and the cache sweeper on an already bound listener.
///
/// Both stop when `cancel` fires; the server drains in-flight requests first.
/// The returned handle completes once both have stopped.
pub async fn start_server_with_listener(
    config: Config,
    listener: TcpListener,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>> {
    let cache_dir = config.cache_dir();
    tracing::info!("Initializing cache storage at: {}", cache_dir.display());
    let cache = Arc::new(CacheStorage::new(cache_dir)?);

    let proxy = Arc::new(RegistryProxy::new(&config, cache.clone())?);
    let sweeper = CacheSweeper::from_config(cache, &config.cache).spawn(cancel.clone());

    let local_addr = listener.local_addr()?;
    let app = build_router(AppState::new(proxy));

    let handle = tokio::spawn(async move {
        tracing::info!("HTTP server listening on {}", local_addr);
        let shutdown = cancel.clone();
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
        {
            error!("HTTP server error: {}", e);
        }
        tracing::info!("HTTP server stopped");

        // Server may have exited on its own; make sure the sweeper follows
        cancel.cancel();
        if let Err(e) = sweeper.await {
            error!("Cache sweeper task failed: {:?}", e);
        }
    });

    Ok(handle)
}
