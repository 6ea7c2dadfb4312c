//! Gateway-owned endpoints: descriptor and metrics

use std::collections::BTreeMap;

use axum::{
    extract::State,
    http::{header, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

use crate::{error::Result, state::AppState};

/// Gateway descriptor with the route table, breaker snapshots and the
/// latest background health results
pub async fn gateway_info(State(state): State<AppState>) -> Json<Value> {
    let routes = state.registry.routes();

    let registered_services: Vec<Value> = routes
        .iter()
        .map(|route| {
            json!({
                "name": route.name,
                "prefix": route.prefix,
                "url": route.target_base_url,
            })
        })
        .collect();

    let circuit_breakers: BTreeMap<String, Value> = state
        .breakers
        .snapshots()
        .into_iter()
        .map(|snapshot| {
            let name = snapshot.service.clone();
            (name, serde_json::to_value(snapshot).unwrap_or(Value::Null))
        })
        .collect();

    // Only what the poller has already seen; no probe runs here
    let service_health: BTreeMap<String, Value> = state
        .health
        .cached(&state.registry)
        .into_iter()
        .map(|record| {
            let name = record.service.clone();
            (name, serde_json::to_value(record).unwrap_or(Value::Null))
        })
        .collect();

    Json(json!({
        "gateway": "Observability Platform API Gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "uptime": state.uptime_secs(),
        "registeredServices": registered_services,
        "endpoints": {
            "health": "/health",
            "metrics": "/metrics",
            "services": state.registry.prefixes(),
        },
        "circuitBreakers": circuit_breakers,
        "serviceHealth": service_health,
    }))
}

/// Prometheus text exposition
pub async fn metrics(State(state): State<AppState>) -> Result<Response> {
    let body = state.metrics.encode()?;

    let mut response = body.into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
    );
    Ok(response)
}
