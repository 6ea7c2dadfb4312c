//! Catch-all handler that hands every non-gateway path to the proxy

use axum::{
    body::Body,
    extract::{Request, State},
    http::header,
};
use tracing::debug;

use crate::{
    error::{GatewayError, Result},
    middleware_layer::trace::extract_client_ip,
    services::proxy::{ProxyRequest, UpstreamResponse},
    state::AppState,
    trace_context::TraceContext,
};

/// Buffer the inbound body and forward the request
pub async fn proxy_request(
    State(state): State<AppState>,
    request: Request<Body>,
) -> Result<UpstreamResponse> {
    let client_ip = extract_client_ip(&request);
    let trace = request
        .extensions()
        .get::<TraceContext>()
        .cloned()
        .unwrap_or_else(|| TraceContext::from_headers(request.headers()));

    let max_size = state.config.server.body_limit_bytes;

    let declared_length = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared_length.is_some_and(|len| len > max_size) {
        return Err(GatewayError::RequestTooLarge {
            trace_id: trace.trace_id,
            max_size,
        });
    }

    let (parts, body) = request.into_parts();

    let body = axum::body::to_bytes(body, max_size).await.map_err(|e| {
        debug!(error = %e, "Failed to buffer request body");
        GatewayError::RequestTooLarge {
            trace_id: trace.trace_id.clone(),
            max_size,
        }
    })?;

    let request = ProxyRequest {
        method: parts.method,
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_string),
        headers: parts.headers,
        body,
        trace,
        client_ip,
    };

    state.proxy.forward(request).await
}
