//! Mirror daemon binary.

use anyhow::{Context, Result};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use mirror_core::config::AppConfig;
use mirror_pipeline::{Ingestor, LocalStore, load_trusted_key};
use mirror_server::scheduler::spawn_scheduler;
use mirror_server::{AppState, create_router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Nightly build mirror: ingest, retention and promotion portal
#[derive(Parser, Debug)]
#[command(name = "mirrord")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "MIRROR_CONFIG",
        default_value = "config/mirror.toml"
    )]
    config: String,
}

fn load_config(path: &str) -> Result<AppConfig> {
    let mut figment = Figment::new();
    if std::path::Path::new(path).exists() {
        tracing::info!(config_path = %path, "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::info!(config_path = %path, "No config file found, using defaults and environment");
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("MIRROR_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    config
        .validate()
        .map_err(anyhow::Error::msg)
        .context("invalid configuration")?;
    Ok(config)
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown requested");
    shutdown.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("mirrord v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args.config)?;

    mirror_server::metrics::register_metrics();

    let remote = mirror_storage::from_config(&config.remote)
        .await
        .context("failed to initialize remote storage")?;
    remote
        .health_check()
        .await
        .context("remote storage health check failed")?;
    tracing::info!(backend = remote.backend_name(), "Remote storage initialized");

    let metadata = mirror_metadata::from_config(&config.metadata)
        .await
        .context("failed to initialize metadata store")?;
    tracing::info!("Metadata store initialized");

    let local = Arc::new(
        LocalStore::open(&config.local.path, metadata)
            .await
            .with_context(|| format!("failed to open local store at {}", config.local.path.display()))?,
    );

    let shutdown = CancellationToken::new();
    let state = AppState::new(config.clone(), local.clone(), remote, shutdown.child_token());

    let scheduler = if config.sweep.enabled {
        let signatures =
            load_trusted_key(&config.upstream).context("failed to load trusted signing key")?;
        let ingestor = Ingestor::new(
            &config,
            local,
            signatures,
            Arc::new(state.uploads.clone()),
        )
        .context("failed to initialize ingest pipeline")?;
        Some(spawn_scheduler(
            Arc::new(ingestor),
            config.sweep.interval(),
            shutdown.child_token(),
        ))
    } else {
        tracing::info!("Periodic sweeps disabled");
        None
    };

    let app = create_router(state.clone());

    let addr: SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", config.server.bind))?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    state.uploads.shutdown().await;
    if let Some(handle) = scheduler {
        handle.await.context("sweep scheduler panicked")?;
    }
    tracing::info!("Shutdown complete");
    Ok(())
}
