//! Shared type definitions for the Observability Platform
//!
//! Health records and gateway events, serialized the same way by every
//! component that produces or consumes them.

pub mod core;
pub mod events;

pub use self::core::{aggregate_status, GatewayHealth, HealthStatus, ServiceHealth};
pub use self::events::{
    ErrorOccurredPayload, EventPayload, EventType, GatewayEvent, RequestCompletedPayload,
    ServiceMetricPayload, ServiceMetrics, ROUTING_KEY_ERROR, ROUTING_KEY_METRICS,
    ROUTING_KEY_REQUEST,
};
