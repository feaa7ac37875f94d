// Start command implementation
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info};

use crate::config::{BackendConfig, CloudqConfig};
use crate::core::clock::SystemClock;
use crate::server::api::start_api_server;
use crate::server::metrics::start_metrics_server;
use crate::server::shutdown::{shutdown_with_timeout, ShutdownSignal};
use crate::service::QueueService;
use crate::storage::memory::{InMemoryBackend, InMemoryConfig};
use crate::storage::sqlite::{SqliteBackend, SqliteConfig};
use crate::storage::MessageStore;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Build the configured store
async fn build_store(config: &CloudqConfig) -> Result<Arc<dyn MessageStore>> {
    let store: Arc<dyn MessageStore> = match &config.storage.backend {
        BackendConfig::InMemory { max_messages } => {
            info!(max_messages, "In-memory storage backend initialized");
            Arc::new(InMemoryBackend::with_config(InMemoryConfig {
                max_messages: *max_messages,
            }))
        }
        BackendConfig::Sqlite {
            database_path,
            max_connections,
        } => {
            let backend = SqliteBackend::new(SqliteConfig {
                database_path: database_path.clone(),
                max_connections: *max_connections,
            })
            .await
            .context("Failed to initialize SQLite backend")?;
            info!(path = %database_path, "SQLite storage backend initialized");
            Arc::new(backend)
        }
    };
    Ok(store)
}

/// Launch cloudq: recover state, start background loops and servers, and
/// run until SIGINT or SIGTERM.
pub async fn execute(config: CloudqConfig) -> Result<()> {
    info!("Starting cloudq");

    let store = build_store(&config).await?;
    let service = Arc::new(QueueService::with_options(
        store,
        Arc::new(SystemClock::new()),
        config.service_options(),
    ));

    let report = service
        .recover()
        .await
        .context("Failed to recover delivery state")?;
    info!(
        leases = report.leases,
        dead_letters_routed = report.dead_letters_routed,
        "Recovered delivery state"
    );

    let signal = ShutdownSignal::new();
    let mut tasks = service.start_background(signal.sender());

    let api_service = service.clone();
    let bind_address = config.server.bind_address.clone();
    let api_port = config.server.api_port;
    let api_rx = signal.subscribe();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = start_api_server(api_service, bind_address, api_port, api_rx).await {
            error!("API server error: {}", e);
        }
    }));

    if config.metrics.enabled {
        let bind_address = config.server.bind_address.clone();
        let metrics_port = config.metrics.port;
        let metrics_rx = signal.subscribe();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = start_metrics_server(bind_address, metrics_port, metrics_rx).await {
                error!("Metrics server error: {}", e);
            }
        }));
    }

    info!(
        api_port = config.server.api_port,
        metrics_port = config.metrics.enabled.then_some(config.metrics.port),
        "cloudq is ready"
    );

    shutdown_with_timeout(signal, tasks, SHUTDOWN_TIMEOUT).await;
    Ok(())
}
