//! In-process mock of a Docker registry and its token endpoint.
#![allow(dead_code)]

use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode, Uri},
    response::Response,
    routing::get,
    Router,
};
use bytes::Bytes;
use mirror::Config;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;

pub const MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";

/// How the mock responds
#[derive(Clone)]
pub struct MockBehavior {
    pub token_status: StatusCode,
    pub token_body: String,
    pub token_delay: Duration,
    /// Keyed by `repository/manifests/reference`
    pub manifests: HashMap<String, (String, Vec<u8>)>,
    /// Keyed by digest
    pub blobs: HashMap<String, Vec<u8>>,
    pub manifest_delay: Duration,
    pub blob_delay: Duration,
    /// Send half of each blob, then abort the body
    pub break_blob_stream: bool,
    /// Send headers at once, then each 1 KiB of a blob after this pause
    pub trickle_blob_stream: Option<Duration>,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            token_status: StatusCode::OK,
            token_body: r#"{"token":"test-token","expires_in":300}"#.to_string(),
            token_delay: Duration::ZERO,
            manifests: HashMap::new(),
            blobs: HashMap::new(),
            manifest_delay: Duration::ZERO,
            blob_delay: Duration::ZERO,
            break_blob_stream: false,
            trickle_blob_stream: None,
        }
    }
}

impl MockBehavior {
    pub fn with_manifest(mut self, repository: &str, reference: &str, content_type: &str, body: &[u8]) -> Self {
        self.manifests.insert(
            format!("{}/manifests/{}", repository, reference),
            (content_type.to_string(), body.to_vec()),
        );
        self
    }

    pub fn with_blob(mut self, digest: &str, body: &[u8]) -> Self {
        self.blobs.insert(digest.to_string(), body.to_vec());
        self
    }
}

/// What the mock has seen
#[derive(Default)]
pub struct Recorded {
    pub token_requests: AtomicUsize,
    pub manifest_requests: AtomicUsize,
    pub blob_requests: AtomicUsize,
    pub blobs_in_flight: AtomicUsize,
    pub max_blobs_in_flight: AtomicUsize,
    pub token_queries: Mutex<Vec<HashMap<String, String>>>,
    pub token_auth_headers: Mutex<Vec<Option<String>>>,
    pub accept_headers: Mutex<Vec<Option<String>>>,
    pub authorization_headers: Mutex<Vec<Option<String>>>,
    pub content_paths: Mutex<Vec<String>>,
}

impl Recorded {
    pub fn token_requests(&self) -> usize {
        self.token_requests.load(Ordering::SeqCst)
    }

    pub fn manifest_requests(&self) -> usize {
        self.manifest_requests.load(Ordering::SeqCst)
    }

    pub fn blob_requests(&self) -> usize {
        self.blob_requests.load(Ordering::SeqCst)
    }

    pub fn network_calls(&self) -> usize {
        self.token_requests() + self.manifest_requests() + self.blob_requests()
    }
}

#[derive(Clone)]
struct MockState {
    behavior: Arc<MockBehavior>,
    recorded: Arc<Recorded>,
}

pub struct MockRegistry {
    pub addr: SocketAddr,
    pub recorded: Arc<Recorded>,
    _handle: tokio::task::JoinHandle<()>,
}

impl MockRegistry {
    pub async fn start(behavior: MockBehavior) -> Self {
        let recorded = Arc::new(Recorded::default());
        let state = MockState {
            behavior: Arc::new(behavior),
            recorded: recorded.clone(),
        };

        let app = Router::new()
            .route("/token", get(token_handler))
            .route("/v2/*path", get(content_handler))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            recorded,
            _handle: handle,
        }
    }

    pub fn registry_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn auth_url(&self) -> String {
        format!("http://{}/token", self.addr)
    }

    /// Config pointing at this mock with the cache under `cache_dir`
    pub fn config(&self, cache_dir: &Path) -> Config {
        let mut config = Config::default();
        config.upstream.registry_url = self.registry_url();
        config.upstream.auth_url = self.auth_url();
        config.upstream.timeout_secs = 5;
        config.cache.directory = cache_dir.to_string_lossy().into_owned();
        config
    }
}

async fn token_handler(
    State(state): State<MockState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    state.recorded.token_requests.fetch_add(1, Ordering::SeqCst);
    state.recorded.token_queries.lock().unwrap().push(query);
    state.recorded.token_auth_headers.lock().unwrap().push(
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    );

    if !state.behavior.token_delay.is_zero() {
        tokio::time::sleep(state.behavior.token_delay).await;
    }

    Response::builder()
        .status(state.behavior.token_status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(state.behavior.token_body.clone()))
        .unwrap()
}

async fn content_handler(State(state): State<MockState>, uri: Uri, headers: HeaderMap) -> Response {
    let path = uri.path().trim_start_matches("/v2/").to_string();
    let recorded = &state.recorded;
    recorded.content_paths.lock().unwrap().push(path.clone());
    recorded.authorization_headers.lock().unwrap().push(
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    );

    if path.contains("/manifests/") {
        recorded.manifest_requests.fetch_add(1, Ordering::SeqCst);
        recorded.accept_headers.lock().unwrap().push(
            headers
                .get(header::ACCEPT)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        );
        if !state.behavior.manifest_delay.is_zero() {
            tokio::time::sleep(state.behavior.manifest_delay).await;
        }
        return match state.behavior.manifests.get(&path) {
            Some((content_type, body)) => Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type.as_str())
                .body(Body::from(body.clone()))
                .unwrap(),
            None => not_found("MANIFEST_UNKNOWN", "manifest unknown"),
        };
    }

    if let Some(idx) = path.rfind("/blobs/") {
        recorded.blob_requests.fetch_add(1, Ordering::SeqCst);
        let now = recorded.blobs_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        recorded.max_blobs_in_flight.fetch_max(now, Ordering::SeqCst);
        if !state.behavior.blob_delay.is_zero() {
            tokio::time::sleep(state.behavior.blob_delay).await;
        }
        recorded.blobs_in_flight.fetch_sub(1, Ordering::SeqCst);

        let digest = &path[idx + "/blobs/".len()..];
        let body = match state.behavior.blobs.get(digest) {
            Some(body) => body.clone(),
            None => return not_found("BLOB_UNKNOWN", "blob unknown to registry"),
        };

        if state.behavior.break_blob_stream {
            let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(4);
            let half = Bytes::from(body[..body.len() / 2].to_vec());
            tokio::spawn(async move {
                let _ = tx.send(Ok(half)).await;
                tokio::time::sleep(Duration::from_millis(50)).await;
                let _ = tx
                    .send(Err(std::io::Error::new(
                        std::io::ErrorKind::ConnectionReset,
                        "upstream went away",
                    )))
                    .await;
            });
            return Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/octet-stream")
                .body(Body::from_stream(ReceiverStream::new(rx)))
                .unwrap();
        }

        if let Some(pause) = state.behavior.trickle_blob_stream {
            let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(1);
            tokio::spawn(async move {
                for chunk in body.chunks(1024) {
                    tokio::time::sleep(pause).await;
                    if tx.send(Ok(Bytes::from(chunk.to_vec()))).await.is_err() {
                        return;
                    }
                }
            });
            return Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/octet-stream")
                .body(Body::from_stream(ReceiverStream::new(rx)))
                .unwrap();
        }

        return Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(Body::from(body))
            .unwrap();
    }

    not_found("NAME_UNKNOWN", "unsupported path")
}

pub fn not_found_body(code: &str, message: &str) -> String {
    format!(
        r#"{{"errors":[{{"code":"{}","message":"{}","detail":null}}]}}"#,
        code, message
    )
}

fn not_found(code: &str, message: &str) -> Response {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(not_found_body(code, message)))
        .unwrap()
}

/// Poll until `check` passes or a few seconds elapse
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
