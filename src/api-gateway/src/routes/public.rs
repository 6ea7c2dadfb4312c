//! Gateway-owned routes. Everything else falls through to the proxy.

use axum::{routing::get, Router};

use crate::{handlers, state::AppState};

/// Create public routes router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(handlers::gateway::gateway_info))
        .route("/health", get(handlers::health::gateway_health))
        .route("/health/:service_name", get(handlers::health::service_health))
        .route("/metrics", get(handlers::gateway::metrics))
        .fallback(handlers::proxy::proxy_request)
}
