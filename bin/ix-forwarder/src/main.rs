//! Index Forwarder
//!
//! Reads NDJSON documents from stdin and delivers them to OpenSearch through the
//! retry coordinator. Undelivered documents wait in bounded per-destination queues
//! while the backend is slow or down.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `IX_OPENSEARCH_URL` | - | OpenSearch base URL (required) |
//! | `IX_OPENSEARCH_USERNAME` | - | Basic auth user |
//! | `IX_OPENSEARCH_PASSWORD` | empty | Basic auth password |
//! | `IX_INDEX_PREFIX` | `attackframework-tool-burp` | Index name prefix |
//! | `IX_INDEX_KEYS` | `traffic,tool,settings,sitemap,findings` | Destinations to drain |
//! | `IX_QUEUE_CAPACITY` | `10000` | Retry queue size per destination |
//! | `IX_DRAIN_BATCH_SIZE` | `100` | Documents per destination per drain cycle |
//! | `IX_BULK_SIZE` | `100` | Input documents buffered before a bulk push |
//! | `IX_FLUSH_INTERVAL_MS` | `1000` | Flush interval for partially filled buffers |
//! | `IX_METRICS_PORT` | `9090` | Health/metrics/stats port |
//! | `RUST_LOG` | `info` | Log level |

mod api;
mod forwarder;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use ix_common::{IndexClient, DEFAULT_INDEX_KEYS};
use ix_opensearch::naming::DEFAULT_INDEX_PREFIX;
use ix_opensearch::{OpenSearchClient, OpenSearchConfig};
use ix_retry::{IndexingRetryCoordinator, RetryConfig};
use ix_stats::ExportStats;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::io::BufReader;
use tokio::signal;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::forwarder::{ForwardSummary, Forwarder};

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_or_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_required(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| anyhow::anyhow!("{} environment variable is required", key))
}

fn parse_index_keys(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(String::from)
        .collect()
}

fn main() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(run());
    // The blocking stdin read cannot be cancelled; don't wait on it
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

async fn run() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into())
        )
        .init();

    info!("Starting Index Forwarder");

    // Configuration
    let base_url = env_required("IX_OPENSEARCH_URL")?;
    let index_prefix = env_or("IX_INDEX_PREFIX", DEFAULT_INDEX_PREFIX);
    let index_keys = parse_index_keys(&env_or("IX_INDEX_KEYS", &DEFAULT_INDEX_KEYS.join(",")));
    let queue_capacity: usize = env_or_parse("IX_QUEUE_CAPACITY", 10_000);
    let drain_batch_size: usize = env_or_parse("IX_DRAIN_BATCH_SIZE", 100);
    let bulk_size: usize = env_or_parse("IX_BULK_SIZE", 100);
    let flush_interval_ms: u64 = env_or_parse("IX_FLUSH_INTERVAL_MS", 1000);
    let metrics_port: u16 = env_or_parse("IX_METRICS_PORT", 9090);

    if index_keys.is_empty() {
        return Err(anyhow::anyhow!("IX_INDEX_KEYS must name at least one destination"));
    }

    let metrics = PrometheusBuilder::new().install_recorder()?;

    // Index backend
    let mut search_config = OpenSearchConfig::new(base_url.clone()).with_index_prefix(index_prefix);
    if let Ok(username) = std::env::var("IX_OPENSEARCH_USERNAME") {
        search_config = search_config.with_basic_auth(username, env_or("IX_OPENSEARCH_PASSWORD", ""));
    }
    let client = Arc::new(OpenSearchClient::new(search_config)?);

    let status = client.test_connection().await;
    if status.success {
        info!(
            url = %base_url,
            distribution = %status.distribution,
            version = %status.version,
            "Index backend reachable"
        );
    } else {
        warn!(url = %base_url, reason = %status.message, "Index backend unreachable at startup, documents will queue");
    }

    // Retry coordinator
    let stats = Arc::new(ExportStats::new(index_keys.clone()));
    let retry_config = RetryConfig {
        max_queue_size_per_destination: queue_capacity,
        drain_batch_size,
        ..Default::default()
    };
    let coordinator = Arc::new(IndexingRetryCoordinator::new(retry_config, client, stats.clone())?);
    coordinator.start()?;
    info!(destinations = ?index_keys, queue_capacity, "Retry coordinator started");

    // Setup shutdown signal
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Start health/metrics server
    let app = api::router(AppState {
        coordinator: coordinator.clone(),
        stats: stats.clone(),
        metrics,
    })
    .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], metrics_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Metrics server listening on http://{}/metrics", addr);

    let server_handle = {
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
                .ok();
        })
    };

    // Start reading input
    let mut reader_handle = {
        let forwarder = Forwarder::new(coordinator.clone(), stats.clone(), bulk_size);
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(forwarder.run(
            BufReader::new(tokio::io::stdin()),
            Duration::from_millis(flush_interval_ms.max(1)),
            shutdown_rx,
        ))
    };

    info!("Index Forwarder started");
    info!("Press Ctrl+C to shutdown");

    let input_finished = tokio::select! {
        _ = shutdown_signal() => false,
        result = &mut reader_handle => {
            log_reader_result(result);
            true
        }
    };

    if input_finished {
        info!(queued = coordinator.total_queued(), "Waiting for retry queue to drain");
        tokio::select! {
            _ = shutdown_signal() => info!("Shutdown signal received..."),
            _ = wait_for_drain(&coordinator) => info!("Retry queue drained"),
        }
    } else {
        info!("Shutdown signal received...");
    }

    let _ = shutdown_tx.send(());

    let _ = tokio::time::timeout(Duration::from_secs(30), async {
        if !input_finished {
            log_reader_result(reader_handle.await);
        }
        let _ = server_handle.await;
    })
    .await;

    coordinator.shutdown().await;

    let abandoned = coordinator.total_queued();
    if abandoned > 0 {
        warn!(abandoned, "Exiting with undelivered documents");
    }
    info!("Index Forwarder shutdown complete");
    Ok(())
}

fn log_reader_result(result: std::result::Result<ForwardSummary, tokio::task::JoinError>) {
    match result {
        Ok(summary) => info!(
            lines = summary.lines_read,
            malformed = summary.malformed,
            rejected = summary.rejected,
            delivered = summary.delivered,
            "Input finished"
        ),
        Err(e) => error!(error = %e, "Input reader task failed"),
    }
}

async fn wait_for_drain(coordinator: &IndexingRetryCoordinator) {
    while coordinator.total_queued() > 0 {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
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
