//! Trace-id stamping and request logging middleware
//!
//! Runs at the ingress edge for every request, gateway-owned or proxied.
//! The trace context is stored in the request extensions for handlers and
//! echoed back in the `X-Trace-Id` response header.

use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::{ConnectInfo, Request},
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::Response,
};
use tracing::{error, info, warn, Instrument};

use crate::trace_context::{TraceContext, TRACE_ID_HEADER};

/// Stamp a trace id on the request and log its start and completion
pub async fn trace_context_middleware(mut request: Request<Body>, next: Next) -> Response {
    let trace = TraceContext::from_headers(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let client_ip = extract_client_ip(&request);

    let user_agent = request
        .headers()
        .get("user-agent")
        .and_then(|header| header.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    let span = tracing::info_span!(
        "http_request",
        trace_id = %trace.trace_id,
        method = %method,
        path = %path,
        client_ip = %client_ip,
    );

    request.extensions_mut().insert(trace.clone());

    async move {
        info!(
            query = request.uri().query().unwrap_or(""),
            user_agent = %user_agent,
            "Incoming request"
        );

        let mut response = next.run(request).await;

        match HeaderValue::from_str(&trace.trace_id) {
            Ok(value) => {
                response.headers_mut().insert(TRACE_ID_HEADER, value);
            }
            Err(_) => warn!("Trace id is not a valid header value, not echoed"),
        }

        let status = response.status();
        let duration_ms = trace.elapsed().as_millis() as u64;

        if status.is_server_error() {
            error!(status = status.as_u16(), duration_ms, "Outgoing response");
        } else if status.is_client_error() {
            warn!(status = status.as_u16(), duration_ms, "Outgoing response");
        } else {
            info!(status = status.as_u16(), duration_ms, "Outgoing response");
        }

        response
    }
    .instrument(span)
    .await
}

/// Client address: forwarding headers first, then the socket peer
pub fn extract_client_ip(request: &Request<Body>) -> String {
    if let Some(ip) = client_ip_from_headers(request.headers()) {
        return ip;
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn client_ip_from_headers(headers: &HeaderMap) -> Option<String> {
    // Check X-Forwarded-For header first (for proxy/load balancer)
    if let Some(forwarded_for) = headers.get("x-forwarded-for").and_then(|h| h.to_str().ok()) {
        if let Some(first_ip) = forwarded_for.split(',').next() {
            let first_ip = first_ip.trim();
            if !first_ip.is_empty() {
                return Some(first_ip.to_string());
            }
        }
    }

    headers
        .get("x-real-ip")
        .and_then(|h| h.to_str().ok())
        .map(|ip| ip.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::Request as HttpRequest, routing::get, Extension, Router};
    use tower::ServiceExt;

    async fn echo_trace(Extension(trace): Extension<TraceContext>) -> String {
        trace.trace_id
    }

    fn app() -> Router {
        Router::new()
            .route("/echo", get(echo_trace))
            .layer(axum::middleware::from_fn(trace_context_middleware))
    }

    #[tokio::test]
    async fn test_inbound_trace_id_reaches_handler_and_response() {
        let response = app()
            .oneshot(
                HttpRequest::builder()
                    .uri("/echo")
                    .header("X-Trace-Id", "trace-abc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.headers()[TRACE_ID_HEADER], "trace-abc");
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"trace-abc");
    }

    #[tokio::test]
    async fn test_generated_trace_id_is_consistent() {
        let response = app()
            .oneshot(HttpRequest::builder().uri("/echo").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let header = response.headers()[TRACE_ID_HEADER].to_str().unwrap().to_string();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(header.as_bytes(), &body[..]);
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let request = HttpRequest::builder()
            .header("x-forwarded-for", "10.0.0.7, 172.16.0.1")
            .header("x-real-ip", "192.168.1.1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_client_ip(&request), "10.0.0.7");

        let request = HttpRequest::builder().body(Body::empty()).unwrap();
        assert_eq!(extract_client_ip(&request), "unknown");
    }
}
