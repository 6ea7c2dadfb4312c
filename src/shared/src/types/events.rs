//! Gateway event schema
//!
//! Events are published to a topic exchange as JSON. The envelope fields
//! (`eventId`, `eventType`, `timestamp`, `traceId`, `service`) sit next to the
//! payload fields at the top level of the document, which is the shape the
//! platform's event consumer persists.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Routing key for completed request logs
pub const ROUTING_KEY_REQUEST: &str = "logs.request";
/// Routing key for per-service metric samples
pub const ROUTING_KEY_METRICS: &str = "metrics.service";
/// Routing key for error logs
pub const ROUTING_KEY_ERROR: &str = "logs.error";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "request.completed")]
    RequestCompleted,
    #[serde(rename = "metric.service")]
    ServiceMetric,
    #[serde(rename = "error.occurred")]
    ErrorOccurred,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::RequestCompleted => "request.completed",
            EventType::ServiceMetric => "metric.service",
            EventType::ErrorOccurred => "error.occurred",
        }
    }

    /// Topic-exchange routing key this event type is published under
    pub fn routing_key(&self) -> &'static str {
        match self {
            EventType::RequestCompleted => ROUTING_KEY_REQUEST,
            EventType::ServiceMetric => ROUTING_KEY_METRICS,
            EventType::ErrorOccurred => ROUTING_KEY_ERROR,
        }
    }
}

/// One event emitted by the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub trace_id: String,
    pub service: String,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl GatewayEvent {
    pub fn new(
        event_type: EventType,
        trace_id: impl Into<String>,
        service: impl Into<String>,
        payload: EventPayload,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            timestamp: Utc::now(),
            trace_id: trace_id.into(),
            service: service.into(),
            payload,
        }
    }

    pub fn routing_key(&self) -> &'static str {
        self.event_type.routing_key()
    }
}

// Variant order matters for deserialization: the error payload is the only
// one with `endpoint`, the request payload the only one with `method` + `path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    ErrorOccurred(ErrorOccurredPayload),
    RequestCompleted(RequestCompletedPayload),
    ServiceMetric(ServiceMetricPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestCompletedPayload {
    pub method: String,
    pub path: String,
    pub status_code: u16,
    /// Milliseconds
    pub duration: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body: Option<serde_json::Value>,
    pub response_size: u64,
    pub client_ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceMetricPayload {
    pub metrics: ServiceMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceMetrics {
    pub response_time_ms: u64,
    pub status_code: u16,
    pub request_count: u64,
    pub error_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorOccurredPayload {
    pub endpoint: String,
    pub method: String,
    pub status_code: u16,
    pub error_type: String,
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body: Option<serde_json::Value>,
}
