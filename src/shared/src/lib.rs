//! Shared types and configuration fragments for the Observability Platform

pub mod config;
pub mod types;

pub use config::{CircuitBreakerConfig, ServiceEntryConfig};

pub use types::{
    aggregate_status, ErrorOccurredPayload, EventPayload, EventType, GatewayEvent, GatewayHealth,
    HealthStatus, RequestCompletedPayload, ServiceHealth, ServiceMetricPayload, ServiceMetrics,
};
