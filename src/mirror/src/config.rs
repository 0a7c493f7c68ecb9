use crate::error::{MirrorError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default upstream registry (Docker Hub)
pub const DEFAULT_REGISTRY_URL: &str = "https://registry-1.docker.io";

/// Default token endpoint for Docker Hub
pub const DEFAULT_AUTH_URL: &str = "https://auth.docker.io/token";

/// Service name sent with every token request
pub const DEFAULT_AUTH_SERVICE: &str = "registry.docker.io";

/// Namespace prepended to single-segment repository names (`nginx` -> `library/nginx`)
pub const DEFAULT_NAMESPACE: &str = "library";

/// Manifest media types in preference order.
/// Manifest lists come first so multi-arch images resolve to the index, not one platform.
pub const MANIFEST_ACCEPT_TYPES: [&str; 4] = [
    "application/vnd.docker.distribution.manifest.list.v2+json",
    "application/vnd.docker.distribution.manifest.v2+json",
    "application/vnd.oci.image.manifest.v1+json",
    "application/vnd.oci.image.index.v1+json",
];

/// Content type recorded when upstream omits one on a manifest
pub const DEFAULT_MANIFEST_CONTENT_TYPE: &str =
    "application/vnd.docker.distribution.manifest.v2+json";

/// Content type for blobs and for cache entries with no sidecar
pub const DEFAULT_BLOB_CONTENT_TYPE: &str = "application/octet-stream";

/// Token lifetime when the auth server omits `expires_in` (5 minutes)
pub const DEFAULT_TOKEN_EXPIRY_SECS: u64 = 300;

/// Deletions between cooperative yields during a sweep
pub const SWEEP_YIELD_EVERY: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_directory")]
    pub directory: String,
    /// Age after which cached artifacts are removed by the sweeper
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Wait after a failed sweep before trying again
    #[serde(default = "default_sweep_retry_secs")]
    pub sweep_retry_secs: u64,
    /// Buffer used when streaming blobs to and from disk
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_registry_url")]
    pub registry_url: String,
    #[serde(default = "default_auth_url")]
    pub auth_url: String,
    #[serde(default = "default_auth_service")]
    pub service: String,
    #[serde(default = "default_namespace")]
    pub default_namespace: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Maximum number of upstream fetches in flight at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Optional Docker Hub account, used for higher pull rate limits
    #[serde(default)]
    pub auth: Option<RegistryAuth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_cache_directory() -> String {
    "./cache".to_string()
}

fn default_ttl_secs() -> u64 {
    604_800 // 7 days
}

fn default_sweep_interval_secs() -> u64 {
    3_600
}

fn default_sweep_retry_secs() -> u64 {
    1_800
}

fn default_buffer_size() -> usize {
    8_192
}

fn default_registry_url() -> String {
    DEFAULT_REGISTRY_URL.to_string()
}

fn default_auth_url() -> String {
    DEFAULT_AUTH_URL.to_string()
}

fn default_auth_service() -> String {
    DEFAULT_AUTH_SERVICE.to_string()
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_concurrency() -> usize {
    4
}

fn default_user_agent() -> String {
    "Docker-Client/24.0.6 (linux)".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: default_cache_directory(),
            ttl_secs: default_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            sweep_retry_secs: default_sweep_retry_secs(),
            buffer_size: default_buffer_size(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            registry_url: default_registry_url(),
            auth_url: default_auth_url(),
            service: default_auth_service(),
            default_namespace: default_namespace(),
            timeout_secs: default_timeout_secs(),
            concurrency: default_concurrency(),
            user_agent: default_user_agent(),
            auth: None,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn sweep_retry(&self) -> Duration {
        Duration::from_secs(self.sweep_retry_secs)
    }
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Parse a TOML configuration file. Missing sections and fields fall back to defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            MirrorError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw)
            .map_err(|e| MirrorError::Config(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.upstream.concurrency == 0 {
            return Err(MirrorError::Config(
                "upstream.concurrency must be at least 1".to_string(),
            ));
        }
        if self.cache.buffer_size == 0 {
            return Err(MirrorError::Config(
                "cache.buffer_size must be greater than zero".to_string(),
            ));
        }
        if self.cache.ttl_secs == 0
            || self.cache.sweep_interval_secs == 0
            || self.cache.sweep_retry_secs == 0
        {
            return Err(MirrorError::Config(
                "cache.ttl_secs, cache.sweep_interval_secs and cache.sweep_retry_secs must be greater than zero"
                    .to_string(),
            ));
        }
        if self.upstream.registry_url.is_empty() || self.upstream.auth_url.is_empty() {
            return Err(MirrorError::Config(
                "upstream.registry_url and upstream.auth_url are required".to_string(),
            ));
        }
        Ok(())
    }

    pub fn cache_dir(&self) -> PathBuf {
        PathBuf::from(&self.cache.directory)
    }
}
