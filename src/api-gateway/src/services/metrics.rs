//! Prometheus instrumentation for the gateway

use std::sync::Arc;
use std::time::Duration;

use prometheus::{Counter, CounterVec, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry};
use tracing::info;

use crate::{
    error::{GatewayError, Result},
    services::circuit_breaker::CircuitState,
};

/// Gateway metrics, registered on a private registry
#[derive(Clone)]
pub struct GatewayMetrics {
    registry: Arc<Registry>,

    // Proxy traffic
    pub requests_total: CounterVec,
    pub request_duration_seconds: HistogramVec,

    // Circuit breakers
    pub circuit_rejections_total: CounterVec,
    pub circuit_breaker_state: GaugeVec,

    // Client rate limiting
    pub rate_limited_total: Counter,

    // Event publishing
    pub events_published_total: CounterVec,
    pub events_dropped_total: CounterVec,
}

impl GatewayMetrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let requests_total = CounterVec::new(
            Opts::new(
                "gateway_requests_total",
                "Total number of proxied requests by service and status",
            ),
            &["service", "status"],
        )?;

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "gateway_request_duration_seconds",
                "Upstream round-trip duration in seconds",
            )
            .buckets(vec![
                0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
            ]),
            &["service"],
        )?;

        let circuit_rejections_total = CounterVec::new(
            Opts::new(
                "gateway_circuit_rejections_total",
                "Requests rejected by an open circuit breaker",
            ),
            &["service"],
        )?;

        let circuit_breaker_state = GaugeVec::new(
            Opts::new(
                "gateway_circuit_breaker_state",
                "Circuit breaker state (0=closed, 1=half-open, 2=open)",
            ),
            &["service"],
        )?;

        let rate_limited_total = Counter::with_opts(Opts::new(
            "gateway_rate_limited_total",
            "Requests rejected by the per-client rate limit",
        ))?;

        let events_published_total = CounterVec::new(
            Opts::new(
                "gateway_events_published_total",
                "Events published to the message bus",
            ),
            &["routing_key"],
        )?;

        let events_dropped_total = CounterVec::new(
            Opts::new(
                "gateway_events_dropped_total",
                "Events dropped before reaching the message bus",
            ),
            &["reason"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration_seconds.clone()))?;
        registry.register(Box::new(circuit_rejections_total.clone()))?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;
        registry.register(Box::new(rate_limited_total.clone()))?;
        registry.register(Box::new(events_published_total.clone()))?;
        registry.register(Box::new(events_dropped_total.clone()))?;

        info!(
            "Metrics service initialized with {} metric families",
            registry.gather().len()
        );

        Ok(Self {
            registry,
            requests_total,
            request_duration_seconds,
            circuit_rejections_total,
            circuit_breaker_state,
            rate_limited_total,
            events_published_total,
            events_dropped_total,
        })
    }

    /// Record one completed upstream exchange
    pub fn record_request(&self, service: &str, status: u16, duration: Duration) {
        self.requests_total
            .with_label_values(&[service, &status.to_string()])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[service])
            .observe(duration.as_secs_f64());
    }

    pub fn record_circuit_rejection(&self, service: &str) {
        self.circuit_rejections_total
            .with_label_values(&[service])
            .inc();
    }

    pub fn set_circuit_state(&self, service: &str, state: CircuitState) {
        self.circuit_breaker_state
            .with_label_values(&[service])
            .set(state.as_gauge());
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited_total.inc();
    }

    pub fn record_event_published(&self, routing_key: &str) {
        self.events_published_total
            .with_label_values(&[routing_key])
            .inc();
    }

    pub fn record_event_dropped(&self, reason: &str) {
        self.events_dropped_total.with_label_values(&[reason]).inc();
    }

    pub fn events_dropped(&self, reason: &str) -> u64 {
        self.events_dropped_total.with_label_values(&[reason]).get() as u64
    }

    /// Render all metrics in the Prometheus text exposition format
    pub fn encode(&self) -> Result<String> {
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();

        encoder
            .encode_to_string(&metric_families)
            .map_err(|e| GatewayError::internal(format!("Failed to encode metrics: {}", e)))
    }
}
