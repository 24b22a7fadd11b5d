//! Status, health, metrics and KPI handlers.
//!
//! - `/health` - Liveness probe for systemd/load balancers (no auth)
//! - `/ready` - Readiness probe (no auth)
//! - `/status` - Version, uptime, process memory, delivery latency
//! - `/metrics` - Prometheus text format
//! - `/kpis` - Dashboard rollups
//!
//! # Example Response (`/status`)
//!
//! ```json
//! {
//!   "version": "0.1.0",
//!   "name": "hookdesk",
//!   "uptimeSeconds": 3600,
//!   "deliveriesAttempted": 1024,
//!   "memory": { "rssBytes": 52428800, "virtualBytes": 268435456 },
//!   "transportLatency": { "p50_ms": 12.5, "p95_ms": 45.2, "p99_ms": 98.7, ... },
//!   "status": "running",
//!   "timestamp": "2026-01-01T12:00:00Z"
//! }
//! ```

use std::sync::atomic::Ordering;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, instrument};

use crate::handlers::AppState;
use crate::metrics::LatencyMetrics;

/// Server version from Cargo.toml
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Server name from Cargo.toml
pub const SERVER_NAME: &str = env!("CARGO_PKG_NAME");

/// Liveness/readiness response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Health status (always "healthy" if responding)
    pub status: String,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "healthy".to_string(),
        }
    }
}

/// Detailed server status
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    /// Server version (from Cargo.toml)
    pub version: String,

    /// Server name
    pub name: String,

    /// Server uptime in seconds
    pub uptime_seconds: u64,

    /// Delivery attempts since start
    pub deliveries_attempted: u64,

    /// Dead-lettered deliveries since start
    pub deliveries_dead: u64,

    /// Audit writes that failed since start
    pub audit_failures: u64,

    /// Whether the background retry scheduler is enabled
    pub scheduler_enabled: bool,

    /// Memory usage metrics
    pub memory: MemoryMetrics,

    /// Transport call latency percentiles
    pub transport_latency: LatencyMetrics,

    /// Server status (always "running" if responding)
    pub status: String,

    /// ISO8601 timestamp of when status was generated
    pub timestamp: String,
}

/// Memory usage metrics collected from sysinfo.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryMetrics {
    /// Resident Set Size - actual physical memory used (bytes)
    pub rss_bytes: u64,

    /// Virtual memory size (bytes)
    pub virtual_bytes: u64,
}

/// Collect memory metrics for the current process; zeros if unavailable.
fn collect_memory_metrics() -> MemoryMetrics {
    let pid = Pid::from_u32(std::process::id());
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);

    match system.process(pid) {
        Some(process) => MemoryMetrics {
            rss_bytes: process.memory(),
            virtual_bytes: process.virtual_memory(),
        },
        None => {
            debug!("Could not find current process in sysinfo");
            MemoryMetrics::default()
        }
    }
}

/// `GET /health`
#[instrument(skip_all)]
pub async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse::default()))
}

/// `GET /ready`
#[instrument(skip_all)]
pub async fn readiness_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse::default()))
}

/// `GET /status`
#[instrument(skip_all)]
pub async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    debug!("Status check requested");
    let metrics = &state.metrics;

    let response = StatusResponse {
        version: SERVER_VERSION.to_string(),
        name: SERVER_NAME.to_string(),
        uptime_seconds: metrics.uptime_seconds(),
        deliveries_attempted: metrics.deliveries_attempted.load(Ordering::Relaxed),
        deliveries_dead: metrics.deliveries_dead.load(Ordering::Relaxed),
        audit_failures: metrics.audit_failures.load(Ordering::Relaxed),
        scheduler_enabled: state.config.scheduler_interval.is_some(),
        memory: collect_memory_metrics(),
        transport_latency: metrics.transport_latency(),
        status: "running".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    };

    (StatusCode::OK, Json(response))
}

/// `GET /metrics`
#[instrument(skip_all)]
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.to_prometheus_format(),
    )
}

/// `GET /kpis`
#[instrument(skip_all)]
pub async fn kpis_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.kpis.snapshot())
}

/// Unauthenticated probe routes
pub fn probe_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(readiness_handler))
}
