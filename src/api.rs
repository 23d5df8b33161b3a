//! Stats and health read API
//!
//! A small axum server exposing the aggregate counters and the latest
//! health report over HTTP. Everything here is read-only except the
//! counter reset endpoint; nothing feeds back into the pipeline. All
//! response bodies use camelCase keys.

use crate::config::ApiConfig;
use crate::error::ApiError;
use crate::health::{HealthReport, HealthStatus};
use crate::metrics::{MetricsAggregator, StatsSnapshot};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use log::info;
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Shared state handed to every request handler
#[derive(Clone)]
pub struct ApiState {
    pub metrics: Arc<MetricsAggregator>,
    pub health: watch::Receiver<HealthReport>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub total_events_processed: u64,
    pub total_events_filtered: u64,
    pub total_events_stored: u64,
    pub total_parse_failures: u64,
    pub total_forwarding_failures: u64,
    pub total_dropped_on_shutdown: u64,
    pub queue_saturation_waits: u64,
    pub filter_rate: f64,
    pub avg_processing_time: f64,
    pub min_processing_time: f64,
    pub max_processing_time: f64,
    pub timestamp: String,
}

impl From<StatsSnapshot> for StatsResponse {
    fn from(snapshot: StatsSnapshot) -> Self {
        Self {
            total_events_processed: snapshot.total_processed,
            total_events_filtered: snapshot.total_filtered,
            total_events_stored: snapshot.total_stored,
            total_parse_failures: snapshot.parse_failures,
            total_forwarding_failures: snapshot.forward_failures,
            total_dropped_on_shutdown: snapshot.dropped_on_shutdown,
            queue_saturation_waits: snapshot.saturation_waits,
            filter_rate: snapshot.filter_rate,
            avg_processing_time: snapshot.avg_processing_ms,
            min_processing_time: snapshot.min_processing_ms,
            max_processing_time: snapshot.max_processing_ms,
            timestamp: snapshot.timestamp.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceResponse {
    pub throughput: f64,
    pub efficiency: f64,
    pub avg_processing_time: f64,
    pub min_processing_time: f64,
    pub max_processing_time: f64,
    pub filter_rate: f64,
    pub timestamp: String,
}

impl From<StatsSnapshot> for PerformanceResponse {
    fn from(snapshot: StatsSnapshot) -> Self {
        Self {
            throughput: snapshot.throughput_per_minute,
            efficiency: snapshot.efficiency,
            avg_processing_time: snapshot.avg_processing_ms,
            min_processing_time: snapshot.min_processing_ms,
            max_processing_time: snapshot.max_processing_ms,
            filter_rate: snapshot.filter_rate,
            timestamp: snapshot.timestamp.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub connection: String,
    pub avg_processing_time: f64,
    pub total_events_processed: u64,
    pub filter_rate: f64,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub status: &'static str,
}

/// Build the router with all read endpoints registered
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/stats", get(get_stats))
        .route("/stats/reset", post(reset_stats))
        .route("/performance", get(get_performance))
        .route("/health", get(get_health))
        .with_state(state)
}

/// Serve the stats API until shutdown is requested
///
/// # Arguments
/// * `config` - API section of the configuration
/// * `state` - Metrics aggregator and health report channel
/// * `shutdown` - Channel that flips to `true` when the process is stopping
///
/// # Errors
/// Returns an error if the listen address cannot be bound or the server
/// terminates unexpectedly.
pub async fn serve(
    config: &ApiConfig,
    state: ApiState,
    shutdown: watch::Receiver<bool>,
) -> Result<(), ApiError> {
    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .map_err(|source| ApiError::Bind {
            addr: config.listen_addr.clone(),
            source,
        })?;
    let addr = listener.local_addr().map_err(|source| ApiError::Bind {
        addr: config.listen_addr.clone(),
        source,
    })?;
    info!("Stats API listening on http://{}", addr);

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .map_err(ApiError::Serve)?;

    info!("Stats API stopped");
    Ok(())
}

async fn get_stats(State(state): State<ApiState>) -> Json<StatsResponse> {
    Json(StatsResponse::from(state.metrics.snapshot()))
}

async fn get_performance(State(state): State<ApiState>) -> Json<PerformanceResponse> {
    Json(PerformanceResponse::from(state.metrics.snapshot()))
}

async fn get_health(State(state): State<ApiState>) -> Json<HealthResponse> {
    let report = state.health.borrow().clone();
    Json(HealthResponse {
        status: report.status,
        connection: report.connection.to_string(),
        avg_processing_time: report.avg_processing_ms,
        total_events_processed: report.total_processed,
        filter_rate: report.filter_rate,
        timestamp: report.timestamp.to_rfc3339(),
    })
}

async fn reset_stats(State(state): State<ApiState>) -> (StatusCode, Json<ResetResponse>) {
    state.metrics.reset();
    info!("Stats counters reset via API");
    (StatusCode::OK, Json(ResetResponse { status: "ok" }))
}

/// Resolve once shutdown is requested or the shutdown channel is gone
async fn shutdown_signal(mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
