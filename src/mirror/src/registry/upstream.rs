use crate::config::{UpstreamConfig, MANIFEST_ACCEPT_TYPES};
use crate::error::{MirrorError, Result};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Client, RequestBuilder, Response};
use std::io::ErrorKind;
use std::time::Duration;

/// Build the pooled HTTP client shared by token exchange and content fetches.
///
/// `timeout` bounds each body read, not the whole transfer.
pub fn build_http_client(config: &UpstreamConfig) -> Result<Client> {
    reqwest::Client::builder()
        // Connection pool configuration
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .read_timeout(config.timeout())
        .connect_timeout(Duration::from_secs(10))
        .user_agent(config.user_agent.clone())
        .build()
        .map_err(|e| MirrorError::Config(format!("Failed to create HTTP client: {}", e)))
}

/// HTTP client for the upstream registry's content endpoints
#[derive(Clone)]
pub struct UpstreamClient {
    client: Client,
    registry_url: String,
    /// Deadline for the response headers
    timeout: Duration,
}

impl UpstreamClient {
    pub fn new(client: Client, config: &UpstreamConfig) -> Self {
        Self {
            client,
            registry_url: config.registry_url.trim_end_matches('/').to_string(),
            timeout: config.timeout(),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn manifest_url(&self, repository: &str, reference: &str) -> String {
        format!(
            "{}/v2/{}/manifests/{}",
            self.registry_url, repository, reference
        )
    }

    pub fn blob_url(&self, repository: &str, digest: &str) -> String {
        format!("{}/v2/{}/blobs/{}", self.registry_url, repository, digest)
    }

    /// GET a manifest, accepting manifest lists first
    pub async fn get_manifest(&self, repository: &str, reference: &str, token: &str) -> Result<Response> {
        let url = self.manifest_url(repository, reference);
        tracing::debug!(url = %url, "Requesting manifest from upstream");

        let request = self
            .client
            .get(&url)
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .header(ACCEPT, MANIFEST_ACCEPT_TYPES.join(", "));
        self.send(request).await
    }

    pub async fn get_blob(&self, repository: &str, digest: &str, token: &str) -> Result<Response> {
        let url = self.blob_url(repository, digest);
        tracing::debug!(url = %url, "Requesting blob from upstream");

        let request = self
            .client
            .get(&url)
            .header(AUTHORIZATION, format!("Bearer {}", token));
        self.send(request).await
    }

    /// Send and wait for the response headers, up to `timeout`. The body is
    /// left to the caller and is only bounded per read.
    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        match tokio::time::timeout(self.timeout, request.send()).await {
            Ok(response) => Ok(response?),
            Err(_) => Err(MirrorError::Io(std::io::Error::new(
                ErrorKind::TimedOut,
                format!("no response headers within {}s", self.timeout.as_secs()),
            ))),
        }
    }
}
