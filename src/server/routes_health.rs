//! # Health & Observability Endpoints
//!
//! | Endpoint | Purpose | Kubernetes field |
//! |----------|---------|-----------|
//! | `GET /healthz` | Liveness — process is alive | `livenessProbe` |
//! | `GET /readyz` | Readiness — store reachable | `readinessProbe` |
//! | `GET /metrics` | Prometheus scraping endpoint | `ServiceMonitor` |
//!
//! Readiness runs the store's health check with a 2-second timeout and returns
//! 503 until it passes.

use super::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use std::sync::Arc;

/// Liveness check: 200 whenever the process is serving HTTP.
pub async fn handler_healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

pub async fn handler_readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let check =
        tokio::time::timeout(std::time::Duration::from_secs(2), state.store.health_check()).await;

    match check {
        Ok(Ok(())) => (StatusCode::OK, "ok"),
        Ok(Err(_)) => (StatusCode::SERVICE_UNAVAILABLE, "store unreachable"),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "store timeout"),
    }
}

/// Prometheus metrics in text exposition format.
pub async fn handler_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = state.prom_metrics.encode();
    (
        StatusCode::OK,
        [(
            "content-type",
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        body,
    )
}
