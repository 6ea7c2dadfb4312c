//! Application state for the gateway
//!
//! Built once at startup from a validated configuration. The registry is
//! read-only after construction; breakers and the health cache carry their
//! own synchronization.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::info;

use crate::config::Config;
use crate::error::Result;
use crate::services::{
    circuit_breaker::BreakerRegistry, events::EventSender, health::HealthChecker,
    metrics::GatewayMetrics, proxy::ReverseProxy, rate_limiter::ClientRateLimiter,
    registry::ServiceRegistry,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<ServiceRegistry>,
    pub breakers: Arc<BreakerRegistry>,
    pub health: Arc<HealthChecker>,
    pub proxy: Arc<ReverseProxy>,
    /// `None` when rate limiting is disabled
    pub rate_limiter: Option<Arc<ClientRateLimiter>>,
    pub metrics: Arc<GatewayMetrics>,
    pub started_at: Instant,
}

impl AppState {
    /// Validate the configuration and build every service.
    /// Exchange records go to `events`; the publisher task is owned by the caller.
    pub fn new(config: Config, events: EventSender, metrics: Arc<GatewayMetrics>) -> Result<Self> {
        info!("Initializing application state...");

        config.validate()?;

        let registry = Arc::new(ServiceRegistry::from_configs(&config.services)?);
        info!(services = registry.len(), "Service registry loaded");

        let breakers = Arc::new(BreakerRegistry::new());

        let health = Arc::new(HealthChecker::new(Duration::from_millis(
            config.health.probe_timeout_ms,
        ))?);

        let proxy = Arc::new(ReverseProxy::new(
            registry.clone(),
            breakers.clone(),
            metrics.clone(),
            events.with_metrics(metrics.clone()),
        )?);

        let rate_limiter = if config.rate_limit.enabled {
            info!(
                max_requests = config.rate_limit.max_requests,
                window_ms = config.rate_limit.window_ms,
                "Per-client rate limiting enabled"
            );
            Some(Arc::new(ClientRateLimiter::new(&config.rate_limit)?))
        } else {
            None
        };

        info!("All services initialized successfully");

        Ok(Self {
            config: Arc::new(config),
            registry,
            breakers,
            health,
            proxy,
            rate_limiter,
            metrics,
            started_at: Instant::now(),
        })
    }

    /// Seconds since the state was built
    pub fn uptime_secs(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }
}
