//! Health check handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;

use crate::{
    error::{GatewayError, Result},
    state::AppState,
};
use observability_shared::{aggregate_status, GatewayHealth, HealthStatus};

/// Aggregate health, probed fresh on every call
pub async fn gateway_health(State(state): State<AppState>) -> (StatusCode, Json<GatewayHealth>) {
    let services = state.health.check_all(state.registry.routes()).await;
    let status = aggregate_status(&services);

    let status_code = match status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
    };

    (
        status_code,
        Json(GatewayHealth {
            gateway: "api-gateway".to_string(),
            status,
            uptime: state.uptime_secs(),
            services,
            timestamp: Utc::now(),
        }),
    )
}

/// Health of a single registered service
pub async fn service_health(
    State(state): State<AppState>,
    Path(service_name): Path<String>,
) -> Result<Response> {
    let route = state
        .registry
        .get(&service_name)
        .ok_or_else(|| GatewayError::ServiceNotFound(service_name.clone()))?;

    let record = state.health.check_one(route).await;
    let status_code = if record.status == HealthStatus::Healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    Ok((status_code, Json(record)).into_response())
}
