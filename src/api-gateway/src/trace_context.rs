//! Per-request correlation identifier

use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use uuid::Uuid;

/// Header carrying the trace id in both directions
pub const TRACE_ID_HEADER: &str = "x-trace-id";
/// Header identifying the gateway to upstream services
pub const GATEWAY_HEADER: &str = "x-gateway";
pub const GATEWAY_IDENTITY: &str = "observability-gateway";

/// Trace context for one request, created at ingress and dropped with it
#[derive(Debug, Clone)]
pub struct TraceContext {
    pub trace_id: String,
    pub started_at: Instant,
}

impl TraceContext {
    /// Inherit the id from an inbound header value, or mint a new one
    pub fn from_header(value: Option<&str>) -> Self {
        let trace_id = match value.map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => new_trace_id(),
        };

        Self {
            trace_id,
            started_at: Instant::now(),
        }
    }

    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self::from_header(
            headers
                .get(TRACE_ID_HEADER)
                .and_then(|value| value.to_str().ok()),
        )
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

pub fn new_trace_id() -> String {
    Uuid::new_v4().to_string()
}
