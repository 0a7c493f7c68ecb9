pub mod cache;
pub mod config;
pub mod error;
pub mod registry;
pub mod server;

pub use cache::{CacheStorage, CacheSweeper, SweepReport};
pub use config::Config;
pub use error::{MirrorError, Result};
pub use registry::{FetchResult, RegistryProxy};

/// Start the registry mirror (HTTP server and cache sweeper) with the given configuration
pub async fn start_server(
    config: Config,
    cancel: tokio_util::sync::CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    server::start_server(config, cancel).await
}
