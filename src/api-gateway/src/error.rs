//! Error handling for the gateway
//!
//! Every failure the gateway itself produces maps onto one variant here and
//! onto one JSON body shape. Upstream application errors (a backend answering
//! 4xx/5xx) are not errors at this level: they are forwarded verbatim.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Main error type for the gateway
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid registry entry '{service}': {message}")]
    Registry { service: String, message: String },

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No registered prefix matches the request path
    #[error("Route not found: {path}")]
    RouteNotFound {
        path: String,
        available_routes: Vec<String>,
    },

    /// The service's breaker rejected the call; nothing was sent upstream
    #[error("Circuit breaker open for service: {service}")]
    CircuitOpen {
        service: String,
        trace_id: String,
        retry_after_secs: u64,
    },

    /// Connection failure or timeout talking to the service
    #[error("Service {service} unavailable: {message}")]
    UpstreamTransport {
        service: String,
        trace_id: String,
        message: String,
    },

    /// `GET /health/:service` for a name the registry does not know
    #[error("Service {0} not found in registry")]
    ServiceNotFound(String),

    /// The client spent its request budget for the current window
    #[error("Rate limit exceeded, retry in {retry_after_secs}s")]
    RateLimited { limit: u32, retry_after_secs: u64 },

    #[error("Request too large: max_size={max_size}")]
    RequestTooLarge { trace_id: String, max_size: usize },

    #[error("Internal server error: {message}")]
    Internal {
        message: String,
        trace_id: Option<String>,
    },
}

impl GatewayError {
    /// Create configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Create a registry validation error
    pub fn registry(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Registry {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Create a new internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            trace_id: None,
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::RouteNotFound { .. } | GatewayError::ServiceNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            GatewayError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamTransport { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::RequestTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::HttpClient(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Config(_)
            | GatewayError::Configuration(_)
            | GatewayError::Registry { .. }
            | GatewayError::Prometheus(_)
            | GatewayError::Io(_)
            | GatewayError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error type string used in logs and error events
    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::RouteNotFound { .. } => "RoutingError",
            GatewayError::ServiceNotFound(_) => "NotFoundError",
            GatewayError::CircuitOpen { .. } => "CircuitOpen",
            GatewayError::UpstreamTransport { .. } => "ProxyError",
            GatewayError::RequestTooLarge { .. } => "RequestTooLarge",
            GatewayError::RateLimited { .. } => "RateLimitError",
            GatewayError::HttpClient(_) => "HttpClientError",
            GatewayError::Config(_) | GatewayError::Configuration(_) => "ConfigurationError",
            GatewayError::Registry { .. } => "RegistryError",
            GatewayError::Prometheus(_) => "MetricsError",
            GatewayError::Io(_) => "IoError",
            GatewayError::Internal { .. } => "InternalError",
        }
    }

    /// Check if this error should be logged at error level
    pub fn should_log(&self) -> bool {
        !matches!(
            self,
            GatewayError::RouteNotFound { .. }
                | GatewayError::ServiceNotFound(_)
                | GatewayError::CircuitOpen { .. }
                | GatewayError::RequestTooLarge { .. }
                | GatewayError::RateLimited { .. }
        )
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status_code = self.status_code();

        if self.should_log() {
            error!(
                error = %self,
                status_code = %status_code,
                error_type = self.error_type(),
                "Gateway error occurred"
            );
        }

        match self {
            GatewayError::RouteNotFound {
                path,
                available_routes,
            } => (
                status_code,
                Json(json!({
                    "success": false,
                    "message": "Route not found",
                    "path": path,
                    "availableRoutes": available_routes,
                })),
            )
                .into_response(),
            GatewayError::CircuitOpen {
                service,
                trace_id,
                retry_after_secs,
            } => {
                let mut response = (
                    status_code,
                    Json(json!({
                        "success": false,
                        "message": format!(
                            "Service {} temporarily unavailable (circuit breaker open)",
                            service
                        ),
                        "traceId": trace_id,
                        "retryAfter": retry_after_secs,
                    })),
                )
                    .into_response();
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
                response
            }
            GatewayError::UpstreamTransport {
                service,
                trace_id,
                message,
            } => (
                status_code,
                Json(json!({
                    "success": false,
                    "message": format!("Service {} unavailable", service),
                    "traceId": trace_id,
                    "error": message,
                })),
            )
                .into_response(),
            GatewayError::ServiceNotFound(name) => (
                status_code,
                Json(json!({
                    "success": false,
                    "message": format!("Service {} not found in registry", name),
                })),
            )
                .into_response(),
            GatewayError::RateLimited {
                limit,
                retry_after_secs,
            } => {
                let mut response = (
                    status_code,
                    Json(json!({
                        "success": false,
                        "message": "Too many requests from this IP, please try again later",
                    })),
                )
                    .into_response();
                let headers = response.headers_mut();
                headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
                headers.insert("ratelimit-limit", HeaderValue::from(limit));
                headers.insert("ratelimit-remaining", HeaderValue::from(0u32));
                headers.insert("ratelimit-reset", HeaderValue::from(retry_after_secs));
                response
            }
            GatewayError::RequestTooLarge { trace_id, max_size } => (
                status_code,
                Json(json!({
                    "success": false,
                    "message": format!("Request body exceeds {} bytes", max_size),
                    "traceId": trace_id,
                })),
            )
                .into_response(),
            GatewayError::Internal { trace_id, .. } => (
                status_code,
                Json(json!({
                    "success": false,
                    "message": "Internal gateway error",
                    "traceId": trace_id,
                })),
            )
                .into_response(),
            _ => (
                status_code,
                Json(json!({
                    "success": false,
                    "message": "Internal gateway error",
                })),
            )
                .into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            GatewayError::RouteNotFound {
                path: "/nope".into(),
                available_routes: vec![],
            }
            .status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::UpstreamTransport {
                service: "order-service".into(),
                trace_id: "t".into(),
                message: "connection refused".into(),
            }
            .status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::internal("boom").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_should_log() {
        assert!(!GatewayError::RouteNotFound {
            path: "/x".into(),
            available_routes: vec![],
        }
        .should_log());
        assert!(GatewayError::internal("server error").should_log());
    }

    #[tokio::test]
    async fn test_route_not_found_body() {
        let response = GatewayError::RouteNotFound {
            path: "/unknown".into(),
            available_routes: vec!["/products".into(), "/orders".into()],
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["message"], "Route not found");
        assert_eq!(body["path"], "/unknown");
        assert_eq!(body["availableRoutes"][1], "/orders");
    }

    #[tokio::test]
    async fn test_circuit_open_body_and_header() {
        let response = GatewayError::CircuitOpen {
            service: "payment-service".into(),
            trace_id: "trace-9".into(),
            retry_after_secs: 30,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], "30");

        let body = body_json(response).await;
        assert_eq!(body["traceId"], "trace-9");
        assert_eq!(body["retryAfter"], 30);
    }

    #[tokio::test]
    async fn test_rate_limited_body_and_headers() {
        let error = GatewayError::RateLimited {
            limit: 100,
            retry_after_secs: 42,
        };
        assert!(!error.should_log());

        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "42");
        assert_eq!(response.headers()["ratelimit-limit"], "100");
        assert_eq!(response.headers()["ratelimit-remaining"], "0");

        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(
            body["message"],
            "Too many requests from this IP, please try again later"
        );
    }
}
