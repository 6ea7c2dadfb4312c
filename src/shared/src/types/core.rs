//! Health types exchanged between the gateway, its probes and dashboards

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health status of a service or of the gateway as a whole
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

/// Result of one liveness probe against one service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealth {
    pub service: String,
    pub status: HealthStatus,
    pub response_time: u64,
    pub last_check: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate health reported by `GET /health`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayHealth {
    pub gateway: String,
    pub status: HealthStatus,
    /// Seconds since the gateway started
    pub uptime: f64,
    pub services: Vec<ServiceHealth>,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate a set of probe results into one gateway status.
///
/// Unhealthy when at least half of the services are unhealthy, degraded when
/// any service is unhealthy or degraded below that line, healthy otherwise.
pub fn aggregate_status(services: &[ServiceHealth]) -> HealthStatus {
    let unhealthy = services
        .iter()
        .filter(|s| s.status == HealthStatus::Unhealthy)
        .count();
    let degraded = services
        .iter()
        .filter(|s| s.status == HealthStatus::Degraded)
        .count();

    if unhealthy > 0 {
        // unhealthy >= total / 2, kept in integers
        if unhealthy * 2 >= services.len() {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Degraded
        }
    } else if degraded > 0 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}
