use mirror::{start_server, Config};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing (RUST_LOG overrides the default level)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => {
            tracing::info!("Loading configuration from {}", path.display());
            Config::from_file(&path)?
        }
        None => {
            tracing::info!("Using built-in default configuration");
            let config = Config::default();
            config.validate()?;
            config
        }
    };

    tracing::info!(
        "Starting docker-mirror server on {}:{}",
        config.server.bind_address,
        config.server.port
    );
    tracing::info!("Cache directory: {}", config.cache.directory);
    tracing::info!("Upstream registry: {}", config.upstream.registry_url);
    tracing::info!(
        "  API: http://{}:{}/v2/",
        config.server.bind_address,
        config.server.port
    );

    let cancel = CancellationToken::new();
    let handle = start_server(config, cancel.clone()).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, stopping server");
    cancel.cancel();

    if let Err(e) = handle.await {
        tracing::error!("Server task failed: {:?}", e);
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
