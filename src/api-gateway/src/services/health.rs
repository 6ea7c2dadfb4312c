//! Health checker for registered services

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    error::Result,
    services::registry::{ServiceRegistry, ServiceRoute},
};
use observability_shared::{HealthStatus, ServiceHealth};

/// Probes each service's health endpoint and keeps the latest result
pub struct HealthChecker {
    client: reqwest::Client,
    probe_timeout: Duration,
    cache: RwLock<HashMap<String, ServiceHealth>>,
}

impl HealthChecker {
    pub fn new(probe_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(probe_timeout)
            .build()?;

        Ok(Self {
            client,
            probe_timeout,
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Probe one service. Never fails: problems become an unhealthy record.
    pub async fn check_one(&self, route: &ServiceRoute) -> ServiceHealth {
        let url = route.health_url();
        let start = Instant::now();

        let (status, error) = match self.client.get(&url).send().await {
            Ok(response) => {
                let code = response.status();
                if code.as_u16() == 200 {
                    (HealthStatus::Healthy, None)
                } else if code.is_success() {
                    (
                        HealthStatus::Degraded,
                        Some(format!("Unexpected status {}", code.as_u16())),
                    )
                } else {
                    (
                        HealthStatus::Unhealthy,
                        Some(format!("Health endpoint returned {}", code.as_u16())),
                    )
                }
            }
            Err(e) if e.is_timeout() => (
                HealthStatus::Unhealthy,
                Some(format!(
                    "Health check timed out after {}ms",
                    self.probe_timeout.as_millis()
                )),
            ),
            Err(e) => (HealthStatus::Unhealthy, Some(e.to_string())),
        };

        let response_time = start.elapsed().as_millis() as u64;

        match status {
            HealthStatus::Healthy => {
                debug!(service = %route.name, response_time_ms = response_time, "Health check passed")
            }
            _ => warn!(
                service = %route.name,
                status = status.as_str(),
                error = error.as_deref().unwrap_or(""),
                "Health check failed"
            ),
        }

        let record = ServiceHealth {
            service: route.name.clone(),
            status,
            response_time,
            last_check: Utc::now(),
            error,
        };

        self.cache.write().insert(route.name.clone(), record.clone());
        record
    }

    /// Probe every route concurrently and wait for all of them
    pub async fn check_all(&self, routes: &[ServiceRoute]) -> Vec<ServiceHealth> {
        join_all(routes.iter().map(|route| self.check_one(route))).await
    }

    /// Latest cached result per service, in registry order
    pub fn cached(&self, registry: &ServiceRegistry) -> Vec<ServiceHealth> {
        let cache = self.cache.read();
        registry
            .routes()
            .iter()
            .filter_map(|route| cache.get(&route.name).cloned())
            .collect()
    }

    /// Refresh the cache on a fixed period until the runtime shuts down
    pub fn spawn_poller(
        self: Arc<Self>,
        registry: Arc<ServiceRegistry>,
        interval: Duration,
    ) -> JoinHandle<()> {
        info!(interval_secs = interval.as_secs(), "Starting background health poller");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let results = self.check_all(registry.routes()).await;
                let unhealthy = results
                    .iter()
                    .filter(|r| r.status == HealthStatus::Unhealthy)
                    .count();
                debug!(checked = results.len(), unhealthy, "Background health sweep complete");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use observability_shared::{aggregate_status, CircuitBreakerConfig, ServiceEntryConfig};
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    fn entry(name: &str, url: &str) -> ServiceEntryConfig {
        ServiceEntryConfig {
            name: name.to_string(),
            url: url.to_string(),
            prefix: format!("/{}", name),
            health_check: "/health".to_string(),
            timeout: 5000,
            retries: 0,
            api_root: None,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }

    fn route(name: &str, url: &str) -> ServiceRoute {
        ServiceRoute::try_from_config(&entry(name, url)).unwrap()
    }

    async fn server_answering(status: u16) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(status))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let checker = HealthChecker::new(Duration::from_secs(2)).unwrap();

        let ok = server_answering(200).await;
        let record = checker.check_one(&route("users", &ok.uri())).await;
        assert_eq!(record.status, HealthStatus::Healthy);
        assert!(record.error.is_none());

        let no_content = server_answering(204).await;
        let record = checker.check_one(&route("orders", &no_content.uri())).await;
        assert_eq!(record.status, HealthStatus::Degraded);

        let failing = server_answering(500).await;
        let record = checker.check_one(&route("payments", &failing.uri())).await;
        assert_eq!(record.status, HealthStatus::Unhealthy);
        assert!(record.error.unwrap().contains("500"));
    }

    #[tokio::test]
    async fn test_unreachable_and_slow_services_are_unhealthy() {
        let checker = HealthChecker::new(Duration::from_millis(200)).unwrap();

        let record = checker
            .check_one(&route("ghost", "http://127.0.0.1:1"))
            .await;
        assert_eq!(record.status, HealthStatus::Unhealthy);
        assert!(record.error.is_some());

        let slow = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&slow)
            .await;
        let record = checker.check_one(&route("slow", &slow.uri())).await;
        assert_eq!(record.status, HealthStatus::Unhealthy);
        assert!(record.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_check_all_returns_every_service_and_caches() {
        let checker = HealthChecker::new(Duration::from_secs(2)).unwrap();
        let up = server_answering(200).await;
        let down = server_answering(503).await;

        let routes = vec![
            route("users", &up.uri()),
            route("orders", &up.uri()),
            route("payments", &down.uri()),
            route("inventory", &down.uri()),
        ];
        let results = checker.check_all(&routes).await;
        assert_eq!(results.len(), 4);
        assert_eq!(aggregate_status(&results), HealthStatus::Unhealthy);

        let registry = ServiceRegistry::from_configs(&[]).unwrap();
        assert!(checker.cached(&registry).is_empty());
        assert_eq!(checker.cache.read().len(), 4);
    }

    #[tokio::test]
    async fn test_poller_fills_cache_in_registry_order() {
        let up = server_answering(200).await;
        let down = server_answering(503).await;
        let registry = Arc::new(
            ServiceRegistry::from_configs(&[entry("orders", &down.uri()), entry("users", &up.uri())])
                .unwrap(),
        );

        let checker = Arc::new(HealthChecker::new(Duration::from_secs(2)).unwrap());
        let poller = checker
            .clone()
            .spawn_poller(registry.clone(), Duration::from_millis(50));

        let cached = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let cached = checker.cached(&registry);
                if cached.len() == 2 {
                    return cached;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("poller did not fill the cache");
        poller.abort();

        assert_eq!(cached[0].service, "orders");
        assert_eq!(cached[0].status, HealthStatus::Unhealthy);
        assert_eq!(cached[1].service, "users");
        assert_eq!(cached[1].status, HealthStatus::Healthy);
    }
}
