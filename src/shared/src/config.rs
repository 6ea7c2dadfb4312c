//! Shared configuration types for the Observability Platform
//!
//! These structures describe one backend service as it appears in the
//! gateway's service registry file. Keys are camelCase so that a registry
//! written for the platform's other components deserializes unchanged.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default failures before a breaker opens
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
/// Default open window in milliseconds
pub const DEFAULT_OPEN_TIMEOUT_MS: u64 = 30_000;
/// Default consecutive half-open successes needed to close
pub const DEFAULT_SUCCESS_THRESHOLD: u32 = 2;

/// One registered backend service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEntryConfig {
    /// Service name, also the breaker key
    pub name: String,
    /// Target base URL, e.g. `http://product-service:3001`
    pub url: String,
    /// Route prefix the gateway dispatches on, e.g. `/products`
    #[serde(default)]
    pub prefix: String,
    /// Liveness endpoint relative to `url`
    #[serde(default = "default_health_check")]
    pub health_check: String,
    /// Upstream request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout: u64,
    /// Declared retry count. Recorded but not acted on by the proxy.
    #[serde(default)]
    pub retries: u32,
    /// Internal API root the prefix is rewritten to; defaults to `/api<prefix>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_root: Option<String>,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

/// Per-service circuit breaker policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    /// Consecutive transport failures before opening
    #[serde(default)]
    pub threshold: Option<u32>,
    /// Open window in milliseconds
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Consecutive half-open successes before closing
    #[serde(default)]
    pub success_threshold: Option<u32>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: None,
            timeout: None,
            success_threshold: None,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn failure_threshold(&self) -> u32 {
        self.threshold.unwrap_or(DEFAULT_FAILURE_THRESHOLD)
    }

    pub fn open_duration(&self) -> Duration {
        Duration::from_millis(self.timeout.unwrap_or(DEFAULT_OPEN_TIMEOUT_MS))
    }

    pub fn success_threshold(&self) -> u32 {
        self.success_threshold.unwrap_or(DEFAULT_SUCCESS_THRESHOLD)
    }
}

impl ServiceEntryConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }
}

fn default_health_check() -> String {
    "/health".to_string()
}

fn default_timeout_ms() -> u64 {
    30_000
}
