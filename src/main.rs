//! meshbucket -- virtual S3 bucket server.
//!
//! Startup never trusts a previous run: the index is loaded from the store
//! if still live and rebuilt from the backends otherwise.  SIGTERM/SIGINT
//! only stop accepting connections and wait for in-flight requests.

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use meshbucket::auth::SignatureVerifier;
use meshbucket::cache::{EdgeCache, MemoryEdgeCache};
use meshbucket::cluster::manager::ClusterSettings;
use meshbucket::cluster::ClusterManager;
use meshbucket::config::{Config, LoggingConfig};
use meshbucket::index::memory::MemoryIndexStore;
use meshbucket::index::sqlite::SqliteIndexStore;
use meshbucket::index::IndexStore;
use meshbucket::storage::registry::BackendRegistry;
use meshbucket::tasks::BackgroundWorker;

/// Command-line arguments for the meshbucket server.
#[derive(Parser, Debug)]
#[command(
    name = "meshbucket",
    version,
    about = "Single virtual S3 bucket spread across several S3-compatible backends"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "meshbucket.yaml")]
    config: String,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn open_index_store(config: &Config) -> anyhow::Result<Arc<dyn IndexStore>> {
    match config.index.engine.as_str() {
        "memory" => {
            info!("In-memory index store initialized");
            Ok(Arc::new(MemoryIndexStore::new()))
        }
        _ => {
            let store = SqliteIndexStore::new(&config.index.path)?;
            info!("SQLite index store initialized at {}", config.index.path);
            Ok(Arc::new(store))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = meshbucket::config::load_config(&cli.config)?;
    init_tracing(&config.logging);
    info!("Loaded configuration from {}", cli.config);

    let bind_addr = cli
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));

    if config.observability.metrics {
        meshbucket::metrics::init_metrics()?;
        meshbucket::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    let registry = BackendRegistry::from_descriptors(
        &config.backends,
        Duration::from_secs(config.cluster.backend_timeout_secs),
    )?;
    info!("{} backends registered", registry.len());

    let store = open_index_store(&config)?;
    let worker = BackgroundWorker::new(config.cluster.background_workers);
    let cluster = Arc::new(ClusterManager::new(
        Arc::new(registry),
        store,
        ClusterSettings::from_config(&config),
        worker,
    ));

    let edge_cache: Option<Arc<dyn EdgeCache>> = if config.edge_cache.enabled {
        info!(
            "Edge cache enabled: {} entries of up to {} bytes",
            config.edge_cache.max_entries, config.edge_cache.max_entry_bytes
        );
        Some(Arc::new(MemoryEdgeCache::new(
            config.edge_cache.max_entries,
            config.edge_cache.max_entry_bytes,
        )))
    } else {
        None
    };

    let verifier = SignatureVerifier::new(&config.auth);
    if verifier.is_lenient() {
        tracing::warn!("auth.secret_key is empty: only the access key is checked");
    }

    let shutdown_timeout = Duration::from_secs(config.server.shutdown_timeout);
    let state = Arc::new(meshbucket::AppState {
        config,
        cluster,
        verifier,
        edge_cache,
    });

    let app = meshbucket::server::app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("meshbucket listening on {}", bind_addr);

    // In-flight requests get `shutdown_timeout` to finish once a signal arrives.
    let (stopping_tx, mut stopping_rx) = tokio::sync::watch::channel(false);
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = stopping_tx.send(true);
        })
        .into_future();
    let deadline = async move {
        let _ = stopping_rx.changed().await;
        tokio::time::sleep(shutdown_timeout).await;
    };

    tokio::select! {
        result = server => result?,
        _ = deadline => tracing::warn!(
            "in-flight requests still running after {}s, exiting",
            shutdown_timeout.as_secs()
        ),
    }

    info!("meshbucket shut down");

    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {e}");
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
                tracing::error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        },
    }
}
