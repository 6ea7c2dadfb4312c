//! Observability Platform API Gateway Library
//!
//! Request-routing layer in front of the platform's backend services:
//! longest-prefix dispatch, per-service circuit breakers, trace-id
//! propagation, health aggregation and fire-and-forget event publishing.

pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware_layer;
pub mod routes;
pub mod services;
pub mod state;
pub mod trace_context;

// Re-export main types and functions for external use
pub use config::{
    Config, EventBusConfig, HealthConfig, ObservabilityConfig, RateLimitConfig, RegistryFile,
    ServerConfig,
};
pub use error::{GatewayError, Result};
pub use state::AppState;

use axum::{middleware, Router};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Build the main application router with all middleware and routes
pub fn build_router(state: AppState) -> Router {
    routes::public::router()
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn(
                    middleware_layer::trace::trace_context_middleware,
                ))
                .layer(middleware::from_fn_with_state(
                    state.clone(),
                    middleware_layer::rate_limit::rate_limit_middleware,
                )),
        )
        .with_state(state)
}
