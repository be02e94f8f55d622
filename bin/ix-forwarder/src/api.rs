//! Health, metrics and stats endpoints

use std::sync::Arc;

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use ix_retry::IndexingRetryCoordinator;
use ix_stats::{ExportStats, IndexStatsSnapshot};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<IndexingRetryCoordinator>,
    pub stats: Arc<ExportStats>,
    pub metrics: PrometheusHandle,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    outage_mode: bool,
    version: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IndexStatsView {
    #[serde(flatten)]
    stats: IndexStatsSnapshot,
    queue_size: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsResponse {
    outage_mode: bool,
    consecutive_failures: u32,
    total_queued: usize,
    total_success_count: u64,
    total_failure_count: u64,
    indexes: Vec<IndexStatsView>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/stats", get(stats_handler))
        .with_state(state)
}

/// Always 200 while the process runs; an outage only degrades the status.
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let outage_mode = state.coordinator.is_outage();
    Json(HealthResponse {
        status: if outage_mode { "DEGRADED" } else { "UP" },
        outage_mode,
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

async fn stats_handler(State(state): State<AppState>) -> Json<StatsResponse> {
    let indexes = state
        .stats
        .snapshot()
        .into_iter()
        .map(|stats| IndexStatsView {
            queue_size: state.coordinator.queue_size(&stats.index_key),
            stats,
        })
        .collect();

    Json(StatsResponse {
        outage_mode: state.coordinator.is_outage(),
        consecutive_failures: state.coordinator.consecutive_failures(),
        total_queued: state.coordinator.total_queued(),
        total_success_count: state.stats.total_success_count(),
        total_failure_count: state.stats.total_failure_count(),
        indexes,
    })
}
