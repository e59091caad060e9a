//! Contains all HTTP endpoint handlers.
//!
//! Use [`routes`] to create a router with all endpoints.

use axum::Router;

use crate::state::ServiceState;

pub mod download;
pub mod health;

/// Creates the router serving health checks and downloads.
pub fn routes() -> Router<ServiceState> {
    Router::new()
        .merge(health::router())
        .merge(download::router())
}
