//! Service registry: the typed, validated route table built once at startup

use std::time::Duration;

use reqwest::Url;

use crate::{
    error::{GatewayError, Result},
    services::circuit_breaker::CircuitPolicy,
};
use observability_shared::ServiceEntryConfig;

/// Paths served by the gateway itself; no service may claim them
const RESERVED_PREFIXES: &[&str] = &["/health", "/metrics"];

/// One routable backend service
#[derive(Debug, Clone)]
pub struct ServiceRoute {
    pub name: String,
    pub prefix: String,
    /// Base URL without a trailing slash
    pub target_base_url: String,
    /// Path the prefix is rewritten to on the upstream side
    pub api_root: String,
    pub health_check: String,
    pub request_timeout: Duration,
    /// Declared in configuration; the proxy makes a single attempt
    pub retry_count: u32,
    /// `None` when the breaker is disabled for this service
    pub circuit_policy: Option<CircuitPolicy>,
}

impl ServiceRoute {
    /// Validate one registry entry
    pub fn try_from_config(entry: &ServiceEntryConfig) -> Result<Self> {
        let name = entry.name.trim();
        if name.is_empty() {
            return Err(GatewayError::registry("<unnamed>", "name must not be empty"));
        }

        let prefix = entry.prefix.trim();
        if prefix.is_empty() {
            return Err(GatewayError::registry(name, "prefix is required"));
        }
        if !prefix.starts_with('/') {
            return Err(GatewayError::registry(name, "prefix must start with '/'"));
        }
        if prefix == "/" || prefix.ends_with('/') {
            return Err(GatewayError::registry(
                name,
                "prefix must name a path segment and not end with '/'",
            ));
        }
        if RESERVED_PREFIXES
            .iter()
            .any(|reserved| prefix == *reserved || prefix.starts_with(&format!("{}/", reserved)))
        {
            return Err(GatewayError::registry(
                name,
                format!("prefix {} is reserved by the gateway", prefix),
            ));
        }

        let url = Url::parse(&entry.url)
            .map_err(|e| GatewayError::registry(name, format!("invalid url {}: {}", entry.url, e)))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(GatewayError::registry(
                name,
                format!("unsupported url scheme {}", url.scheme()),
            ));
        }

        if entry.timeout == 0 {
            return Err(GatewayError::registry(name, "timeout must be positive"));
        }

        let circuit_policy = if entry.circuit_breaker.enabled {
            let policy = CircuitPolicy::from(&entry.circuit_breaker);
            if policy.failure_threshold == 0 {
                return Err(GatewayError::registry(name, "circuit breaker threshold must be positive"));
            }
            if policy.open_duration.is_zero() {
                return Err(GatewayError::registry(name, "circuit breaker timeout must be positive"));
            }
            if policy.success_threshold == 0 {
                return Err(GatewayError::registry(
                    name,
                    "circuit breaker success threshold must be positive",
                ));
            }
            Some(policy)
        } else {
            None
        };

        let api_root = match &entry.api_root {
            Some(root) => root.trim_end_matches('/').to_string(),
            None => format!("/api{}", prefix),
        };

        let health_check = if entry.health_check.starts_with('/') {
            entry.health_check.clone()
        } else {
            format!("/{}", entry.health_check)
        };

        Ok(Self {
            name: name.to_string(),
            prefix: prefix.to_string(),
            target_base_url: entry.url.trim_end_matches('/').to_string(),
            api_root,
            health_check,
            request_timeout: entry.request_timeout(),
            retry_count: entry.retries,
            circuit_policy,
        })
    }

    /// Whether `path` falls under this route's prefix on a segment boundary
    pub fn matches(&self, path: &str) -> bool {
        match path.strip_prefix(self.prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// Replace the matched prefix with the internal API root.
    /// `/products/42` under `/products` becomes `/api/products/42`.
    pub fn rewrite_path(&self, path: &str) -> String {
        let rest = path.strip_prefix(self.prefix.as_str()).unwrap_or(path);
        format!("{}{}", self.api_root, rest)
    }

    /// Full upstream URL for an inbound path and optional query string
    pub fn upstream_url(&self, path: &str, query: Option<&str>) -> String {
        match query {
            Some(q) if !q.is_empty() => {
                format!("{}{}?{}", self.target_base_url, self.rewrite_path(path), q)
            }
            _ => format!("{}{}", self.target_base_url, self.rewrite_path(path)),
        }
    }

    pub fn health_url(&self) -> String {
        format!("{}{}", self.target_base_url, self.health_check)
    }
}

/// Read-only route table, shared without synchronization
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    /// Configuration order, used for listings
    routes: Vec<ServiceRoute>,
    /// Indices into `routes`, longest prefix first
    dispatch_order: Vec<usize>,
}

impl ServiceRegistry {
    /// Build and validate the registry. Any invalid entry fails the whole load.
    pub fn from_configs(entries: &[ServiceEntryConfig]) -> Result<Self> {
        let mut routes: Vec<ServiceRoute> = Vec::with_capacity(entries.len());

        for entry in entries {
            let route = ServiceRoute::try_from_config(entry)?;

            if routes.iter().any(|r| r.name == route.name) {
                return Err(GatewayError::registry(&route.name, "duplicate service name"));
            }
            if let Some(existing) = routes.iter().find(|r| r.prefix == route.prefix) {
                return Err(GatewayError::registry(
                    &route.name,
                    format!("prefix {} already registered by {}", route.prefix, existing.name),
                ));
            }

            routes.push(route);
        }

        let mut dispatch_order: Vec<usize> = (0..routes.len()).collect();
        dispatch_order.sort_by(|a, b| routes[*b].prefix.len().cmp(&routes[*a].prefix.len()));

        Ok(Self {
            routes,
            dispatch_order,
        })
    }

    /// Longest-prefix dispatch
    pub fn resolve(&self, path: &str) -> Option<&ServiceRoute> {
        self.dispatch_order
            .iter()
            .map(|i| &self.routes[*i])
            .find(|route| route.matches(path))
    }

    /// Get service route by name
    pub fn get(&self, name: &str) -> Option<&ServiceRoute> {
        self.routes.iter().find(|r| r.name == name)
    }

    /// All routes in configuration order
    pub fn routes(&self) -> &[ServiceRoute] {
        &self.routes
    }

    pub fn prefixes(&self) -> Vec<String> {
        self.routes.iter().map(|r| r.prefix.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use observability_shared::CircuitBreakerConfig;

    fn entry(name: &str, prefix: &str) -> ServiceEntryConfig {
        ServiceEntryConfig {
            name: name.to_string(),
            url: "http://localhost:3001/".to_string(),
            prefix: prefix.to_string(),
            health_check: "/health".to_string(),
            timeout: 5000,
            retries: 3,
            api_root: None,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }

    #[test]
    fn test_path_rewrite() {
        let route = ServiceRoute::try_from_config(&entry("product-service", "/products")).unwrap();
        assert_eq!(route.rewrite_path("/products/42"), "/api/products/42");
        assert_eq!(route.rewrite_path("/products"), "/api/products");
        assert_eq!(
            route.upstream_url("/products/42", Some("expand=true")),
            "http://localhost:3001/api/products/42?expand=true"
        );
        assert_eq!(route.health_url(), "http://localhost:3001/health");
    }

    #[test]
    fn test_custom_api_root() {
        let mut config = entry("invoice-service", "/invoices");
        config.api_root = Some("/v2/billing/".to_string());
        let route = ServiceRoute::try_from_config(&config).unwrap();
        assert_eq!(route.rewrite_path("/invoices/7"), "/v2/billing/7");
    }

    #[test]
    fn test_longest_prefix_wins() {
        let registry = ServiceRegistry::from_configs(&[
            entry("order-service", "/orders"),
            entry("order-export", "/orders/export"),
        ])
        .unwrap();

        assert_eq!(registry.resolve("/orders/1").unwrap().name, "order-service");
        assert_eq!(registry.resolve("/orders/export/2024").unwrap().name, "order-export");
        assert_eq!(registry.resolve("/orders").unwrap().name, "order-service");
    }

    #[test]
    fn test_prefix_matches_on_segment_boundary() {
        let registry = ServiceRegistry::from_configs(&[entry("order-service", "/orders")]).unwrap();
        assert!(registry.resolve("/ordersummary").is_none());
        assert!(registry.resolve("/unknown").is_none());
        assert_eq!(registry.prefixes(), vec!["/orders".to_string()]);
    }

    #[test]
    fn test_invalid_entries_fail_load() {
        assert!(ServiceRegistry::from_configs(&[entry("a", "")]).is_err());
        assert!(ServiceRegistry::from_configs(&[entry("a", "products")]).is_err());
        assert!(ServiceRegistry::from_configs(&[entry("a", "/")]).is_err());
        assert!(ServiceRegistry::from_configs(&[entry("a", "/health")]).is_err());
        assert!(ServiceRegistry::from_configs(&[entry("a", "/x"), entry("b", "/x")]).is_err());
        assert!(ServiceRegistry::from_configs(&[entry("a", "/x"), entry("a", "/y")]).is_err());

        let mut zero_timeout = entry("a", "/x");
        zero_timeout.timeout = 0;
        assert!(ServiceRegistry::from_configs(&[zero_timeout]).is_err());

        let mut bad_url = entry("a", "/x");
        bad_url.url = "not a url".to_string();
        assert!(ServiceRegistry::from_configs(&[bad_url]).is_err());

        let mut zero_threshold = entry("a", "/x");
        zero_threshold.circuit_breaker.threshold = Some(0);
        assert!(ServiceRegistry::from_configs(&[zero_threshold]).is_err());
    }

    #[test]
    fn test_disabled_breaker_has_no_policy() {
        let mut config = entry("notification-service", "/notifications");
        config.circuit_breaker.enabled = false;
        let route = ServiceRoute::try_from_config(&config).unwrap();
        assert!(route.circuit_policy.is_none());
        assert_eq!(route.retry_count, 3);
    }
}
