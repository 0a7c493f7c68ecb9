use crate::cache::{ArtifactClass, CacheEntry, CacheKey, CacheStorage};
use crate::config::{Config, DEFAULT_BLOB_CONTENT_TYPE, DEFAULT_MANIFEST_CONTENT_TYPE};
use crate::error::{MirrorError, Result};
use crate::registry::gate::ConcurrencyGate;
use crate::registry::token::{MemoryExpiringMap, Token, TokenStore};
use crate::registry::upstream::{build_http_client, UpstreamClient};
use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Response, StatusCode};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{debug, error, info, warn};

const MANIFESTS_MARKER: &str = "/manifests/";
const BLOBS_MARKER: &str = "/blobs/";
const CATALOG_PATH: &str = "_catalog";
const JSON_CONTENT_TYPE: &str = "application/json";

/// Machine-readable failure categories reported to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Unauthorized,
    Timeout(ArtifactClass),
    NotFound,
    Internal,
}

impl FailureKind {
    pub fn status(&self) -> StatusCode {
        match self {
            FailureKind::Unauthorized => StatusCode::UNAUTHORIZED,
            FailureKind::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            FailureKind::NotFound => StatusCode::NOT_FOUND,
            FailureKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            FailureKind::Unauthorized => "UNAUTHORIZED",
            FailureKind::Timeout(ArtifactClass::Manifest) => "MANIFEST_TIMEOUT",
            FailureKind::Timeout(ArtifactClass::Blob) => "BLOB_TIMEOUT",
            FailureKind::NotFound => "NOT_FOUND",
            FailureKind::Internal => "INTERNAL_ERROR",
        }
    }
}

/// Content of a [`FetchResult`]
#[derive(Debug)]
pub enum FetchBody {
    /// Held in memory: manifests fetched from upstream, upstream errors, structured failures
    Buffered(Bytes),
    /// An open handle on a cache file
    File { file: File, len: u64 },
}

/// What a fetch hands back to its caller. The caller owns the body.
#[derive(Debug)]
pub struct FetchResult {
    pub status: StatusCode,
    pub content_type: String,
    pub body: FetchBody,
    pub cache_hit: bool,
}

impl FetchResult {
    pub fn buffered(status: StatusCode, content_type: impl Into<String>, body: Bytes) -> Self {
        Self {
            status,
            content_type: content_type.into(),
            body: FetchBody::Buffered(body),
            cache_hit: false,
        }
    }

    fn from_entry(entry: CacheEntry, cache_hit: bool) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: entry.content_type,
            body: FetchBody::File {
                file: entry.file,
                len: entry.size,
            },
            cache_hit,
        }
    }

    /// Structured registry error: `{"errors":[{"code":..,"message":..}]}`
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        let body = serde_json::json!({
            "errors": [{
                "code": kind.code(),
                "message": message.into(),
            }]
        });
        Self::buffered(kind.status(), JSON_CONTENT_TYPE, Bytes::from(body.to_string()))
    }

    pub fn is_file(&self) -> bool {
        matches!(self.body, FetchBody::File { .. })
    }

    pub fn content_length(&self) -> u64 {
        match &self.body {
            FetchBody::Buffered(data) => data.len() as u64,
            FetchBody::File { len, .. } => *len,
        }
    }

    /// Drain the body into memory
    pub async fn into_bytes(self) -> Result<Bytes> {
        match self.body {
            FetchBody::Buffered(data) => Ok(data),
            FetchBody::File { mut file, len } => {
                let mut data = Vec::with_capacity(len as usize);
                file.read_to_end(&mut data).await?;
                Ok(Bytes::from(data))
            }
        }
    }
}

/// A `/v2/` sub-path, classified
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryRequest {
    Manifest { repository: String, reference: String },
    Blob { repository: String, digest: String },
    Catalog,
}

/// Classify the part of a request path after `/v2/`.
///
/// Repository names may contain slashes, so the last `/manifests/` or
/// `/blobs/` marker splits name from reference.
pub fn parse_v2_path(path: &str) -> Option<RegistryRequest> {
    let mut path = path.trim_start_matches('/');
    // Clients that put /v2/ into the image reference end up requesting /v2/v2/...
    if let Some(rest) = path.strip_prefix("v2/") {
        path = rest;
    }

    if path.trim_end_matches('/') == CATALOG_PATH {
        return Some(RegistryRequest::Catalog);
    }

    let manifest_idx = path.rfind(MANIFESTS_MARKER);
    let blob_idx = path.rfind(BLOBS_MARKER);

    let (idx, marker, is_manifest) = match (manifest_idx, blob_idx) {
        (Some(m), Some(b)) if b > m => (b, BLOBS_MARKER, false),
        (Some(m), _) => (m, MANIFESTS_MARKER, true),
        (None, Some(b)) => (b, BLOBS_MARKER, false),
        (None, None) => return None,
    };

    let repository = &path[..idx];
    let reference = &path[idx + marker.len()..];
    if repository.is_empty() || reference.is_empty() || reference.contains('/') {
        return None;
    }

    Some(if is_manifest {
        RegistryRequest::Manifest {
            repository: repository.to_string(),
            reference: reference.to_string(),
        }
    } else {
        RegistryRequest::Blob {
            repository: repository.to_string(),
            digest: reference.to_string(),
        }
    })
}

/// Prefix single-segment names with the default namespace (`nginx` -> `library/nginx`)
pub fn normalize_repository(name: &str, default_namespace: &str) -> String {
    let name = name.trim_matches('/');
    if name.contains('/') || default_namespace.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", default_namespace, name)
    }
}

/// Fetch-or-serve engine for manifests and blobs.
pub struct RegistryProxy {
    cache: Arc<CacheStorage>,
    tokens: Arc<TokenStore>,
    gate: ConcurrencyGate,
    upstream: UpstreamClient,
    default_namespace: String,
    buffer_size: usize,
}

impl RegistryProxy {
    /// Wire up a proxy from configuration with an in-memory token cache
    pub fn new(config: &Config, cache: Arc<CacheStorage>) -> Result<Self> {
        let client = build_http_client(&config.upstream)?;
        let tokens = Arc::new(TokenStore::new(
            client.clone(),
            &config.upstream,
            Arc::new(MemoryExpiringMap::<Token>::new()),
        ));
        Ok(Self::from_parts(
            config,
            cache,
            tokens,
            UpstreamClient::new(client, &config.upstream),
        ))
    }

    pub fn from_parts(
        config: &Config,
        cache: Arc<CacheStorage>,
        tokens: Arc<TokenStore>,
        upstream: UpstreamClient,
    ) -> Self {
        Self {
            cache,
            tokens,
            gate: ConcurrencyGate::new(config.upstream.concurrency),
            upstream,
            default_namespace: config.upstream.default_namespace.clone(),
            buffer_size: config.cache.buffer_size,
        }
    }

    pub fn cache(&self) -> &Arc<CacheStorage> {
        &self.cache
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Route a raw `/v2/` sub-path to the matching fetch.
    pub async fn handle_v2_path(&self, path: &str) -> FetchResult {
        match parse_v2_path(path) {
            Some(RegistryRequest::Manifest {
                repository,
                reference,
            }) => self.fetch_manifest(&repository, &reference).await,
            Some(RegistryRequest::Blob { repository, digest }) => {
                self.fetch_blob(&repository, &digest).await
            }
            Some(RegistryRequest::Catalog) => self.catalog().await,
            None => {
                debug!(path = %path, "Unsupported registry path");
                FetchResult::failure(
                    FailureKind::NotFound,
                    format!("Unsupported registry path: /v2/{}", path.trim_start_matches('/')),
                )
            }
        }
    }

    async fn catalog(&self) -> FetchResult {
        match self.list_cached_repositories().await {
            Ok(repositories) => {
                let body = serde_json::json!({ "repositories": repositories });
                FetchResult::buffered(StatusCode::OK, JSON_CONTENT_TYPE, Bytes::from(body.to_string()))
            }
            Err(e) => {
                error!(error = %e, "Failed to list cached repositories");
                FetchResult::failure(FailureKind::Internal, e.to_string())
            }
        }
    }

    /// Repositories that have at least one manifest in the cache
    pub async fn list_cached_repositories(&self) -> Result<Vec<String>> {
        self.cache.list_repositories().await
    }

    pub async fn fetch_manifest(&self, repository: &str, reference: &str) -> FetchResult {
        let repository = normalize_repository(repository, &self.default_namespace);
        let key = CacheKey::manifest(&repository, reference);

        if let Some(entry) = self.cache.try_read(&key).await {
            info!(
                repository = %repository,
                reference = %reference,
                size = entry.size,
                "Cache HIT for manifest"
            );
            return FetchResult::from_entry(entry, true);
        }
        info!(repository = %repository, reference = %reference, "Cache MISS for manifest");

        let token = match self.token_for(&repository).await {
            Ok(token) => token,
            Err(result) => return result,
        };

        let _permit = match self.gate.acquire().await {
            Ok(permit) => permit,
            Err(e) => return FetchResult::failure(FailureKind::Internal, e.to_string()),
        };

        match self.fetch_manifest_upstream(&key, &token).await {
            Ok(result) => result,
            Err(e) => {
                error!(
                    repository = %repository,
                    reference = %reference,
                    error = %e,
                    "Failed to fetch manifest from upstream"
                );
                failure_from_error(&e, ArtifactClass::Manifest)
            }
        }
    }

    async fn fetch_manifest_upstream(&self, key: &CacheKey, token: &Token) -> Result<FetchResult> {
        let response = self
            .upstream
            .get_manifest(key.repository(), key.reference(), token.value())
            .await?;

        let status = response.status();
        if !status.is_success() {
            return forward_upstream_error(key, response).await;
        }

        let content_type = header_content_type(&response, DEFAULT_MANIFEST_CONTENT_TYPE);
        let body = response.bytes().await?;

        info!(
            repository = %key.repository(),
            reference = %key.reference(),
            content_type = %content_type,
            size = body.len(),
            "Fetched manifest from upstream"
        );

        // Persist off the response path
        let cache = self.cache.clone();
        let cache_key = key.clone();
        let cache_type = content_type.clone();
        let data = body.clone();
        tokio::spawn(async move {
            if let Err(e) = cache.write_bytes(&cache_key, &cache_type, &data).await {
                warn!(
                    repository = %cache_key.repository(),
                    reference = %cache_key.reference(),
                    error = %e,
                    "Failed to cache manifest"
                );
            }
        });

        Ok(FetchResult::buffered(status, content_type, body))
    }

    pub async fn fetch_blob(&self, repository: &str, digest: &str) -> FetchResult {
        let repository = normalize_repository(repository, &self.default_namespace);
        let key = CacheKey::blob(&repository, digest);

        if let Some(entry) = self.cache.try_read(&key).await {
            info!(
                repository = %repository,
                digest = %digest,
                size = entry.size,
                "Cache HIT for blob"
            );
            return FetchResult::from_entry(entry, true);
        }
        info!(repository = %repository, digest = %digest, "Cache MISS for blob");

        let token = match self.token_for(&repository).await {
            Ok(token) => token,
            Err(result) => return result,
        };

        let _permit = match self.gate.acquire().await {
            Ok(permit) => permit,
            Err(e) => return FetchResult::failure(FailureKind::Internal, e.to_string()),
        };

        match self.fetch_blob_upstream(&key, &token).await {
            Ok(result) => result,
            Err(e) => {
                error!(
                    repository = %repository,
                    digest = %digest,
                    error = %e,
                    "Failed to fetch blob from upstream"
                );
                failure_from_error(&e, ArtifactClass::Blob)
            }
        }
    }

    async fn fetch_blob_upstream(&self, key: &CacheKey, token: &Token) -> Result<FetchResult> {
        let response = self
            .upstream
            .get_blob(key.repository(), key.reference(), token.value())
            .await?;

        if !response.status().is_success() {
            return forward_upstream_error(key, response).await;
        }

        let content_type = header_content_type(&response, DEFAULT_BLOB_CONTENT_TYPE);
        let written = self
            .cache
            .write_stream(key, &content_type, response.bytes_stream(), self.buffer_size)
            .await?;

        info!(
            repository = %key.repository(),
            digest = %key.reference(),
            size = written,
            "Blob cached from upstream"
        );

        // Serve from the file just written rather than holding the blob in memory
        let entry = self.cache.try_read(key).await.ok_or_else(|| {
            MirrorError::Cache(format!("Blob {} missing right after caching", key))
        })?;
        Ok(FetchResult::from_entry(entry, false))
    }

    async fn token_for(&self, repository: &str) -> std::result::Result<Token, FetchResult> {
        let scope = format!("repository:{}:pull", repository);
        self.tokens.get_token(&scope).await.map_err(|e| {
            FetchResult::failure(
                FailureKind::Unauthorized,
                format!("Failed to obtain registry token for {}: {}", scope, e),
            )
        })
    }
}

fn header_content_type(response: &Response, default: &str) -> String {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or(default)
        .to_string()
}

/// Pass an upstream non-success response through untouched. Never cached.
async fn forward_upstream_error(key: &CacheKey, response: Response) -> Result<FetchResult> {
    let status = response.status();
    let content_type = header_content_type(&response, JSON_CONTENT_TYPE);
    let body = response.bytes().await?;

    error!(
        repository = %key.repository(),
        reference = %key.reference(),
        status = %status,
        "Upstream returned {} for {}",
        status,
        key.class()
    );

    Ok(FetchResult::buffered(status, content_type, body))
}

fn failure_from_error(e: &MirrorError, class: ArtifactClass) -> FetchResult {
    if e.is_timeout() {
        FetchResult::failure(
            FailureKind::Timeout(class),
            format!("Upstream {} request timed out", class),
        )
    } else {
        FetchResult::failure(FailureKind::Internal, e.to_string())
    }
}
