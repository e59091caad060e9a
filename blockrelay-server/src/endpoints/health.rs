//! Liveness and readiness probes.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Router, routing};

use crate::state::ServiceState;

/// While this file exists, the readiness probe fails so that load balancers drain the instance.
pub const SHUTDOWN_MARKER_PATH: &str = "/tmp/blockrelay.down";

/// Creates the router for `/health` and `/ready`.
pub fn router() -> Router<ServiceState> {
    Router::new()
        .route("/health", routing::get(health))
        .route("/ready", routing::get(ready))
}

async fn health() -> impl IntoResponse {
    "OK"
}

async fn ready(State(state): State<ServiceState>) -> impl IntoResponse {
    let is_shutting_down = tokio::fs::try_exists(SHUTDOWN_MARKER_PATH)
        .await
        .unwrap_or(false);
    if is_shutting_down {
        tracing::debug!("Shutdown marker exists, failing readiness");
        return (StatusCode::SERVICE_UNAVAILABLE, "Shutting down");
    }

    if state.pool.is_empty() {
        tracing::warn!("No upstream worker provisioned, failing readiness");
        return (StatusCode::SERVICE_UNAVAILABLE, "No upstream workers");
    }

    (StatusCode::OK, "OK")
}
