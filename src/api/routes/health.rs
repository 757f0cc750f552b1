//! Health Routes
//!
//! Health check endpoints for monitoring and Kubernetes probes.
//!
//! - GET /health/live - Liveness probe (process is alive)
//! - GET /health/ready - Readiness probe (ready to serve traffic)
//! - GET /health - Full health status

use axum::{extract::State, http::StatusCode, Json};
use std::sync::Arc;

use crate::api::dto::HealthResponse;
use crate::api::state::AppState;

/// GET /health/live
///
/// Kubernetes liveness probe.
/// Returns 200 if the process is alive, no dependency checks.
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// GET /health/ready
///
/// Returns 200 while every worker slot is supervised.
pub async fn readiness(State(state): State<Arc<AppState>>) -> StatusCode {
    if state.pool.is_running() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// GET /health
///
/// Full health status with component details.
pub async fn full_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let workers_ok = state.pool.is_running();
    let stats = state.pool.stats();

    let index_refreshed_at = match &state.index_cache {
        Some(cache) => {
            let snapshot = cache.snapshot().await;
            (snapshot.refreshed_at_ms > 0).then_some(snapshot.refreshed_at_ms)
        }
        None => None,
    };

    // crashes are recovered, so they degrade rather than fail the service
    let status = if !workers_ok {
        "unhealthy"
    } else if stats.crashes() > 0 {
        "degraded"
    } else {
        "healthy"
    };

    Json(HealthResponse {
        status: status.to_string(),
        workers: if workers_ok { "ok" } else { "error" }.to_string(),
        completed_requests: stats.completed(),
        worker_crashes: stats.crashes(),
        index_refreshed_at,
        uptime_seconds: state.uptime_seconds(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
