//! Reverse proxy core
//!
//! One linear pipeline per request: resolve the route, ask the breaker,
//! forward with the route timeout, buffer the response, record the outcome.
//! The upstream exchange and its bookkeeping run on a spawned task so the
//! breaker and the event stream see the outcome even if the client hangs up.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use tracing::{debug, warn, Instrument};

use crate::{
    error::{GatewayError, Result},
    services::{
        circuit_breaker::{Admission, BreakerRegistry, CircuitBreaker},
        events::{
            EventSender, ExchangeFailure, ExchangeRecord, ERROR_TYPE_CIRCUIT_OPEN,
            ERROR_TYPE_PROXY,
        },
        metrics::GatewayMetrics,
        registry::{ServiceRegistry, ServiceRoute},
    },
    trace_context::{TraceContext, GATEWAY_HEADER, GATEWAY_IDENTITY, TRACE_ID_HEADER},
};

/// Connection-scoped headers that are never forwarded in either direction
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// An inbound request with its body already buffered
#[derive(Debug)]
pub struct ProxyRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub trace: TraceContext,
    pub client_ip: String,
}

/// A buffered upstream response, ready to hand back to the caller
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl IntoResponse for UpstreamResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Everything the spawned exchange needs, owned
struct Exchange {
    route: ServiceRoute,
    breaker: Option<Arc<CircuitBreaker>>,
    admission: Option<Admission>,
    metrics: Arc<GatewayMetrics>,
    events: EventSender,
    trace: TraceContext,
    method: String,
    path: String,
    request_body: Bytes,
    client_ip: String,
    user_agent: Option<String>,
}

/// Reverse proxy shared by all requests
pub struct ReverseProxy {
    client: reqwest::Client,
    registry: Arc<ServiceRegistry>,
    breakers: Arc<BreakerRegistry>,
    metrics: Arc<GatewayMetrics>,
    events: EventSender,
}

impl ReverseProxy {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        breakers: Arc<BreakerRegistry>,
        metrics: Arc<GatewayMetrics>,
        events: EventSender,
    ) -> Result<Self> {
        // Per-request timeouts come from the route
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            registry,
            breakers,
            metrics,
            events,
        })
    }

    /// Breaker for a route, or `None` when the route disables it
    pub fn breaker_for(&self, route: &ServiceRoute) -> Option<Arc<CircuitBreaker>> {
        route
            .circuit_policy
            .map(|policy| self.breakers.get_or_create(&route.name, policy))
    }

    /// Forward one request. Upstream 4xx/5xx come back as `Ok`; only
    /// gateway-produced failures are `Err`.
    pub async fn forward(&self, request: ProxyRequest) -> Result<UpstreamResponse> {
        let route = self
            .registry
            .resolve(&request.path)
            .ok_or_else(|| GatewayError::RouteNotFound {
                path: request.path.clone(),
                available_routes: self.registry.prefixes(),
            })?
            .clone();

        let breaker = self.breaker_for(&route);
        let user_agent = request
            .headers
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut exchange = Exchange {
            route,
            breaker,
            admission: None,
            metrics: self.metrics.clone(),
            events: self.events.clone(),
            trace: request.trace.clone(),
            method: request.method.to_string(),
            path: request.path.clone(),
            request_body: request.body.clone(),
            client_ip: request.client_ip.clone(),
            user_agent,
        };

        if let Some(breaker) = exchange.breaker.clone() {
            match breaker.admit() {
                Some(admission) => exchange.admission = Some(admission),
                None => return Err(exchange.reject(&breaker)),
            }
            exchange.metrics.set_circuit_state(&exchange.route.name, breaker.state());
        }

        let upstream = self.build_upstream_request(&exchange.route, &request)?;
        let trace_id = exchange.trace.trace_id.clone();

        tokio::spawn(exchange.run(upstream).instrument(tracing::Span::current()))
            .await
            .map_err(|e| GatewayError::Internal {
                message: format!("Proxy task failed: {}", e),
                trace_id: Some(trace_id),
            })?
    }

    fn build_upstream_request(
        &self,
        route: &ServiceRoute,
        request: &ProxyRequest,
    ) -> Result<reqwest::RequestBuilder> {
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes()).map_err(|e| {
            GatewayError::Internal {
                message: format!("Unsupported method {}: {}", request.method, e),
                trace_id: Some(request.trace.trace_id.clone()),
            }
        })?;

        let url = route.upstream_url(&request.path, request.query.as_deref());
        debug!(
            service = %route.name,
            upstream_url = %url,
            "Forwarding request"
        );

        let mut headers = reqwest::header::HeaderMap::new();
        for (name, value) in request.headers.iter() {
            if !forwardable_request_header(name) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
                reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
            ) {
                headers.append(name, value);
            }
        }

        if let Ok(value) = reqwest::header::HeaderValue::from_str(&request.trace.trace_id) {
            headers.insert(TRACE_ID_HEADER, value);
        }
        headers.insert(
            GATEWAY_HEADER,
            reqwest::header::HeaderValue::from_static(GATEWAY_IDENTITY),
        );

        let mut builder = self
            .client
            .request(method, url)
            .headers(headers)
            .timeout(route.request_timeout);

        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        Ok(builder)
    }
}

impl Exchange {
    async fn run(self, upstream: reqwest::RequestBuilder) -> Result<UpstreamResponse> {
        let started = Instant::now();

        match buffer_response(upstream).await {
            Ok(response) => {
                if let (Some(breaker), Some(admission)) = (&self.breaker, self.admission) {
                    breaker.record_success_for(admission);
                    self.metrics.set_circuit_state(&self.route.name, breaker.state());
                }

                let status = response.status.as_u16();
                self.metrics
                    .record_request(&self.route.name, status, started.elapsed());

                let response_body = (status >= 400).then(|| response.body.clone());
                self.publish(status, response.body.len() as u64, response_body, None);

                Ok(response)
            }
            Err(e) => {
                let message = describe_transport_error(&e, self.route.request_timeout);
                warn!(
                    service = %self.route.name,
                    trace_id = %self.trace.trace_id,
                    error = %message,
                    "Proxy error"
                );

                if let (Some(breaker), Some(admission)) = (&self.breaker, self.admission) {
                    breaker.record_failure_for(admission);
                    self.metrics.set_circuit_state(&self.route.name, breaker.state());
                }

                let status = StatusCode::SERVICE_UNAVAILABLE.as_u16();
                self.metrics
                    .record_request(&self.route.name, status, started.elapsed());
                self.publish(
                    status,
                    0,
                    None,
                    Some(ExchangeFailure {
                        error_type: ERROR_TYPE_PROXY,
                        message: message.clone(),
                    }),
                );

                Err(GatewayError::UpstreamTransport {
                    service: self.route.name.clone(),
                    trace_id: self.trace.trace_id.clone(),
                    message,
                })
            }
        }
    }

    /// Short-circuit without touching the network
    fn reject(self, breaker: &CircuitBreaker) -> GatewayError {
        let retry_after_secs = breaker.retry_after_secs();
        warn!(
            service = %self.route.name,
            trace_id = %self.trace.trace_id,
            retry_after_secs,
            "Circuit breaker open, request rejected"
        );

        self.metrics.record_circuit_rejection(&self.route.name);
        self.metrics.set_circuit_state(&self.route.name, breaker.state());
        self.publish(
            StatusCode::SERVICE_UNAVAILABLE.as_u16(),
            0,
            None,
            Some(ExchangeFailure {
                error_type: ERROR_TYPE_CIRCUIT_OPEN,
                message: format!("Circuit breaker open for {}", self.route.name),
            }),
        );

        GatewayError::CircuitOpen {
            service: self.route.name,
            trace_id: self.trace.trace_id,
            retry_after_secs,
        }
    }

    fn publish(
        &self,
        status_code: u16,
        response_size_bytes: u64,
        response_body: Option<Bytes>,
        failure: Option<ExchangeFailure>,
    ) {
        self.events.send(ExchangeRecord {
            trace_id: self.trace.trace_id.clone(),
            service_name: self.route.name.clone(),
            method: self.method.clone(),
            path: self.path.clone(),
            status_code,
            duration_ms: self.trace.elapsed().as_millis() as u64,
            request_body: (!self.request_body.is_empty()).then(|| self.request_body.clone()),
            response_body,
            response_size_bytes,
            client_ip: self.client_ip.clone(),
            user_agent: self.user_agent.clone(),
            failure,
        });
    }
}

/// Send and read the whole body. A body read failure counts as transport.
async fn buffer_response(
    upstream: reqwest::RequestBuilder,
) -> std::result::Result<UpstreamResponse, reqwest::Error> {
    let response = upstream.send().await?;

    let status = StatusCode::from_u16(response.status().as_u16())
        .unwrap_or(StatusCode::BAD_GATEWAY);

    let mut headers = HeaderMap::new();
    for (name, value) in response.headers().iter() {
        if !forwardable_response_header(name.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.append(name, value);
        }
    }

    let body = response.bytes().await?;

    Ok(UpstreamResponse {
        status,
        headers,
        body,
    })
}

fn forwardable_request_header(name: &HeaderName) -> bool {
    let name = name.as_str();
    !(HOP_BY_HOP_HEADERS.contains(&name)
        || name == "host"
        || name == "content-length"
        || name == TRACE_ID_HEADER
        || name == GATEWAY_HEADER)
}

fn forwardable_response_header(name: &str) -> bool {
    !(HOP_BY_HOP_HEADERS.contains(&name) || name == "content-length")
}

fn describe_transport_error(error: &reqwest::Error, timeout: Duration) -> String {
    if error.is_timeout() {
        format!("Upstream timed out after {}ms", timeout.as_millis())
    } else if error.is_connect() {
        format!("Connection failed: {}", error)
    } else {
        error.to_string()
    }
}
