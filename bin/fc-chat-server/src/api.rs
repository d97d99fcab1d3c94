//! Read-only operational endpoints: liveness/readiness probes, a Prometheus scrape endpoint,
//! and introspection into warnings and circuit breaker state. No administrative mutation
//! endpoints are exposed here (§1 non-goal: admin console).

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use fc_common::{CircuitBreakerStats, HealthReport, HealthStatus, Warning};
use fc_net::ChatServer;
use serde::Serialize;

#[derive(Clone)]
pub struct AppState {
    pub server: Arc<ChatServer>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(liveness))
        .route("/readyz", get(readiness))
        .route("/metrics", get(metrics))
        .route("/stats", get(stats))
        .route("/warnings", get(warnings))
        .with_state(state)
}

/// Always 200 while the process is up; liveness does not consult dependency health, only that
/// the accept loop's task set is still running.
async fn liveness() -> impl IntoResponse {
    StatusCode::OK
}

async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    let report = build_health_report(&state.server);
    let code = match report.status {
        HealthStatus::Healthy | HealthStatus::Warning => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(report))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, state.server.metrics_handle.render())
}

#[derive(Serialize)]
struct StatsResponse {
    stats: fc_stats::StatsSnapshot,
    cache: fc_common::CacheMetricsSnapshot,
    backpressure: fc_common::BackpressureLevel,
    connected_sockets: usize,
    active_delivery_groups: usize,
}

async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    let server = &state.server;
    Json(StatsResponse {
        stats: server.stats.snapshot(),
        cache: server.cache.metrics(),
        backpressure: server.backpressure.level(),
        connected_sockets: server.hub.connected_count(),
        active_delivery_groups: server.engine.active_delivery_groups(),
    })
}

async fn warnings(State(state): State<AppState>) -> impl IntoResponse {
    let warnings: Vec<Warning> = state.server.warnings.unacknowledged();
    Json(warnings)
}

fn build_health_report(server: &ChatServer) -> HealthReport {
    let breakers: Vec<CircuitBreakerStats> = server.breakers.all_stats();
    let pools = server.thread_manager.all_stats();
    let status = if !server.thread_manager.is_healthy() {
        HealthStatus::Degraded
    } else {
        fc_robustness::breaker_health(&breakers)
    };
    HealthReport {
        status,
        pools,
        cache: server.cache.metrics(),
        backpressure: server.backpressure.level(),
        circuit_breakers: breakers,
        timestamp: chrono::Utc::now(),
    }
}
