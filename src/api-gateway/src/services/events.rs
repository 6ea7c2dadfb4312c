//! Event publisher
//!
//! The proxy hands a finished [`ExchangeRecord`] to an [`EventSender`] and
//! moves on. A single publisher task owns the receiving end and the bus
//! connection; it turns each record into gateway events and publishes them
//! to a topic exchange. Publishing is best-effort: failures are logged and
//! counted, never surfaced to a caller.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use lapin::{
    options::{
        BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{config::EventBusConfig, services::metrics::GatewayMetrics};
use observability_shared::{
    ErrorOccurredPayload, EventPayload, EventType, GatewayEvent, RequestCompletedPayload,
    ServiceMetricPayload, ServiceMetrics,
};

/// Error type used for upstream application errors in `error.occurred`
pub const ERROR_TYPE_HTTP: &str = "HttpError";
/// Error type used when the upstream could not be reached
pub const ERROR_TYPE_PROXY: &str = "ProxyError";
/// Error type used when the breaker rejected the call
pub const ERROR_TYPE_CIRCUIT_OPEN: &str = "CircuitOpen";

const MAX_ERROR_MESSAGE_CHARS: usize = 500;

/// Queues declared and bound on connect, as `(queue, binding key)`
const BOUND_QUEUES: &[(&str, &str)] = &[
    ("logs-queue", "logs.*"),
    ("metrics-queue", "metrics.*"),
    ("traces-queue", "traces.*"),
];

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Event serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Message bus error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("Message bus not connected")]
    NotConnected,

    #[error("Timed out connecting to message bus after {0:?}")]
    ConnectTimeout(Duration),
}

/// A gateway-side failure attached to an exchange
#[derive(Debug, Clone)]
pub struct ExchangeFailure {
    pub error_type: &'static str,
    pub message: String,
}

/// One completed proxy exchange, owned by the publisher once sent
#[derive(Debug, Clone)]
pub struct ExchangeRecord {
    pub trace_id: String,
    pub service_name: String,
    pub method: String,
    pub path: String,
    pub status_code: u16,
    pub duration_ms: u64,
    pub request_body: Option<Bytes>,
    pub response_body: Option<Bytes>,
    pub response_size_bytes: u64,
    pub client_ip: String,
    pub user_agent: Option<String>,
    /// Set when the gateway produced the response itself
    pub failure: Option<ExchangeFailure>,
}

/// Derive the events for one exchange: request and metric always, error
/// when the status is 400 or above.
pub fn derive_events(record: &ExchangeRecord) -> Vec<GatewayEvent> {
    let is_error = record.status_code >= 400;
    let request_body = record.request_body.as_ref().and_then(|b| body_to_json(b));

    let mut events = Vec::with_capacity(if is_error { 3 } else { 2 });

    events.push(GatewayEvent::new(
        EventType::RequestCompleted,
        &record.trace_id,
        &record.service_name,
        EventPayload::RequestCompleted(RequestCompletedPayload {
            method: record.method.clone(),
            path: record.path.clone(),
            status_code: record.status_code,
            duration: record.duration_ms,
            request_body: if record.method.eq_ignore_ascii_case("GET") {
                None
            } else {
                request_body.clone()
            },
            response_size: record.response_size_bytes,
            client_ip: record.client_ip.clone(),
            user_agent: record.user_agent.clone(),
        }),
    ));

    events.push(GatewayEvent::new(
        EventType::ServiceMetric,
        &record.trace_id,
        &record.service_name,
        EventPayload::ServiceMetric(ServiceMetricPayload {
            metrics: ServiceMetrics {
                response_time_ms: record.duration_ms,
                status_code: record.status_code,
                request_count: 1,
                error_count: u64::from(is_error),
            },
        }),
    ));

    if is_error {
        let (error_type, error_message) = match &record.failure {
            Some(failure) => (failure.error_type.to_string(), failure.message.clone()),
            None => (
                ERROR_TYPE_HTTP.to_string(),
                extract_error_message(
                    record.response_body.as_deref(),
                    &record.method,
                    &record.path,
                    record.status_code,
                ),
            ),
        };

        events.push(GatewayEvent::new(
            EventType::ErrorOccurred,
            &record.trace_id,
            &record.service_name,
            EventPayload::ErrorOccurred(ErrorOccurredPayload {
                endpoint: record.path.clone(),
                method: record.method.clone(),
                status_code: record.status_code,
                error_type,
                error_message,
                request_body,
            }),
        ));
    }

    events
}

/// Best-effort error message from an upstream error body: common JSON
/// fields first, then the raw body truncated, then a synthesized line.
pub fn extract_error_message(body: Option<&[u8]>, method: &str, path: &str, status: u16) -> String {
    let body = body.unwrap_or_default();

    if let Ok(serde_json::Value::Object(map)) = serde_json::from_slice::<serde_json::Value>(body) {
        for field in ["message", "error", "errorMessage", "detail", "msg"] {
            match map.get(field) {
                Some(serde_json::Value::String(text)) if !text.is_empty() => {
                    return truncate(text);
                }
                Some(serde_json::Value::Object(nested)) => {
                    if let Some(serde_json::Value::String(text)) = nested.get("message") {
                        return truncate(text);
                    }
                }
                _ => {}
            }
        }
    }

    let raw = String::from_utf8_lossy(body);
    let raw = raw.trim();
    if !raw.is_empty() {
        return truncate(raw);
    }

    format!("{} {} failed with status {}", method, path, status)
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= MAX_ERROR_MESSAGE_CHARS {
        text.to_string()
    } else {
        let mut cut: String = text.chars().take(MAX_ERROR_MESSAGE_CHARS).collect();
        cut.push_str("...");
        cut
    }
}

/// JSON bodies are embedded as JSON, anything else as a string
fn body_to_json(body: &Bytes) -> Option<serde_json::Value> {
    if body.is_empty() {
        return None;
    }
    serde_json::from_slice(body)
        .ok()
        .or_else(|| Some(serde_json::Value::String(String::from_utf8_lossy(body).into_owned())))
}

/// Transport behind the publisher
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, routing_key: &str, payload: Vec<u8>) -> Result<(), PublishError>;

    fn is_ready(&self) -> bool;

    async fn close(&self) {}
}

/// Stand-in used when publishing is disabled or the bus was unreachable
#[derive(Debug, Default)]
pub struct DisconnectedBus;

#[async_trait]
impl EventBus for DisconnectedBus {
    async fn publish(&self, _routing_key: &str, _payload: Vec<u8>) -> Result<(), PublishError> {
        Err(PublishError::NotConnected)
    }

    fn is_ready(&self) -> bool {
        false
    }
}

/// RabbitMQ topic-exchange bus
pub struct AmqpEventBus {
    connection: Connection,
    channel: Channel,
    exchange: String,
}

impl AmqpEventBus {
    /// Connect, declare the exchange and bind the standard queues
    pub async fn connect(config: &EventBusConfig) -> Result<Self, PublishError> {
        let connection = Connection::connect(&config.url, ConnectionProperties::default()).await?;
        info!("Connected to RabbitMQ");

        let channel = connection.create_channel().await?;

        channel
            .exchange_declare(
                &config.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        info!(exchange = %config.exchange, "Exchange asserted");

        for (queue, binding_key) in BOUND_QUEUES {
            channel
                .queue_declare(
                    queue,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await?;
            channel
                .queue_bind(
                    queue,
                    &config.exchange,
                    binding_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
            debug!(queue = *queue, binding_key = *binding_key, "Queue bound");
        }

        Ok(Self {
            connection,
            channel,
            exchange: config.exchange.clone(),
        })
    }
}

#[async_trait]
impl EventBus for AmqpEventBus {
    async fn publish(&self, routing_key: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2);

        self.channel
            .basic_publish(
                &self.exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await?
            .await?;
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn close(&self) {
        if let Err(e) = self.connection.close(200, "gateway shutting down").await {
            warn!(error = %e, "Failed to close RabbitMQ connection cleanly");
        }
    }
}

/// Connect to the configured bus. Never fails: an unreachable or disabled
/// bus yields a [`DisconnectedBus`] and publishing becomes a no-op.
pub async fn connect_bus(config: &EventBusConfig) -> Arc<dyn EventBus> {
    if !config.enabled {
        info!("Event publishing disabled");
        return Arc::new(DisconnectedBus);
    }

    let timeout = Duration::from_secs(config.connect_timeout_seconds);
    let result = match tokio::time::timeout(timeout, AmqpEventBus::connect(config)).await {
        Ok(result) => result,
        Err(_) => Err(PublishError::ConnectTimeout(timeout)),
    };

    match result {
        Ok(bus) => {
            info!("All queues ready for event publishing");
            Arc::new(bus)
        }
        Err(e) => {
            error!(error = %e, "Failed to connect event publisher; events will be dropped");
            Arc::new(DisconnectedBus)
        }
    }
}

/// Sending half of the proxy-to-publisher handoff
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<ExchangeRecord>,
    metrics: Option<Arc<GatewayMetrics>>,
}

/// Bounded handoff channel between the proxy and the publisher task
pub fn channel(capacity: usize) -> (EventSender, mpsc::Receiver<ExchangeRecord>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventSender { tx, metrics: None }, rx)
}

impl EventSender {
    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Hand off a record without waiting. A full or closed channel drops it.
    pub fn send(&self, record: ExchangeRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(record)) => {
                warn!(trace_id = %record.trace_id, "Event channel full, exchange record dropped");
                self.count_drop("channel_full");
            }
            Err(mpsc::error::TrySendError::Closed(record)) => {
                debug!(trace_id = %record.trace_id, "Event publisher stopped, exchange record dropped");
                self.count_drop("channel_closed");
            }
        }
    }

    fn count_drop(&self, reason: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_event_dropped(reason);
        }
    }
}

/// Publishes gateway events on a bus it owns exclusively
pub struct EventPublisher {
    bus: Arc<dyn EventBus>,
    metrics: Option<Arc<GatewayMetrics>>,
}

impl EventPublisher {
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self { bus, metrics: None }
    }

    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn is_ready(&self) -> bool {
        self.bus.is_ready()
    }

    /// Best-effort publish; every failure is logged and dropped
    pub async fn publish(&self, topic: &str, event: &GatewayEvent) {
        if !self.bus.is_ready() {
            debug!(
                routing_key = topic,
                trace_id = %event.trace_id,
                "Cannot publish event - not connected"
            );
            self.count_drop("not_connected");
            return;
        }

        let payload = match serde_json::to_vec(event) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, routing_key = topic, "Failed to serialize event");
                self.count_drop("serialization");
                return;
            }
        };

        match self.bus.publish(topic, payload).await {
            Ok(()) => {
                debug!(
                    routing_key = topic,
                    event_type = event.event_type.as_str(),
                    trace_id = %event.trace_id,
                    "Event published"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_event_published(topic);
                }
            }
            Err(e) => {
                warn!(error = %e, routing_key = topic, trace_id = %event.trace_id, "Failed to publish event");
                self.count_drop("bus_error");
            }
        }
    }

    /// Publish every event derived from one exchange
    pub async fn publish_exchange(&self, record: &ExchangeRecord) {
        for event in derive_events(record) {
            self.publish(event.routing_key(), &event).await;
        }
    }

    /// Drain the handoff channel until every sender is gone, then close the bus
    pub async fn run(self, mut rx: mpsc::Receiver<ExchangeRecord>) {
        while let Some(record) = rx.recv().await {
            self.publish_exchange(&record).await;
        }

        self.bus.close().await;
        info!("Gateway event publisher disconnected");
    }

    fn count_drop(&self, reason: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_event_dropped(reason);
        }
    }
}

/// Spawn the publisher task. The bus connection is made inside the task, so
/// records sent before it is up simply wait in the channel.
pub fn spawn_publisher(
    config: EventBusConfig,
    rx: mpsc::Receiver<ExchangeRecord>,
    metrics: Arc<GatewayMetrics>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let bus = connect_bus(&config).await;
        EventPublisher::new(bus).with_metrics(metrics).run(rx).await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingBus {
        published: Mutex<Vec<(String, serde_json::Value)>>,
    }

    #[async_trait]
    impl EventBus for RecordingBus {
        async fn publish(&self, routing_key: &str, payload: Vec<u8>) -> Result<(), PublishError> {
            let value = serde_json::from_slice(&payload)?;
            self.published.lock().push((routing_key.to_string(), value));
            Ok(())
        }

        fn is_ready(&self) -> bool {
            true
        }
    }

    fn record(status_code: u16) -> ExchangeRecord {
        ExchangeRecord {
            trace_id: "trace-1".to_string(),
            service_name: "product-service".to_string(),
            method: "POST".to_string(),
            path: "/products".to_string(),
            status_code,
            duration_ms: 42,
            request_body: Some(Bytes::from_static(br#"{"name":"lamp"}"#)),
            response_body: None,
            response_size_bytes: 17,
            client_ip: "10.0.0.1".to_string(),
            user_agent: Some("curl/8.0".to_string()),
            failure: None,
        }
    }

    #[test]
    fn test_success_yields_two_events() {
        let events = derive_events(&record(200));
        let types: Vec<EventType> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(types, vec![EventType::RequestCompleted, EventType::ServiceMetric]);
        assert!(events.iter().all(|e| e.trace_id == "trace-1"));
    }

    #[test]
    fn test_error_status_yields_three_events() {
        let mut rec = record(404);
        rec.response_body = Some(Bytes::from_static(br#"{"success":false,"message":"Product not found"}"#));
        let events = derive_events(&rec);
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].event_type, EventType::ErrorOccurred);
        assert_eq!(events[2].routing_key(), "logs.error");

        match &events[2].payload {
            EventPayload::ErrorOccurred(payload) => {
                assert_eq!(payload.error_type, ERROR_TYPE_HTTP);
                assert_eq!(payload.error_message, "Product not found");
            }
            other => panic!("unexpected payload: {other:?}"),
        }

        match &events[1].payload {
            EventPayload::ServiceMetric(payload) => assert_eq!(payload.metrics.error_count, 1),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_transport_failure_uses_proxy_error_type() {
        let mut rec = record(503);
        rec.failure = Some(ExchangeFailure {
            error_type: ERROR_TYPE_PROXY,
            message: "operation timed out".to_string(),
        });
        let events = derive_events(&rec);
        match &events[2].payload {
            EventPayload::ErrorOccurred(payload) => {
                assert_eq!(payload.error_type, "ProxyError");
                assert_eq!(payload.error_message, "operation timed out");
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_get_requests_omit_request_body() {
        let mut rec = record(200);
        rec.method = "GET".to_string();
        match &derive_events(&rec)[0].payload {
            EventPayload::RequestCompleted(payload) => assert!(payload.request_body.is_none()),
            other => panic!("unexpected payload: {other:?}"),
        }

        match &derive_events(&record(201))[0].payload {
            EventPayload::RequestCompleted(payload) => {
                assert_eq!(payload.request_body.as_ref().unwrap()["name"], "lamp")
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_error_message_extraction_fallbacks() {
        assert_eq!(
            extract_error_message(Some(br#"{"error":{"message":"card declined"}}"#), "POST", "/payments", 402),
            "card declined"
        );
        assert_eq!(
            extract_error_message(Some(br#"{"error":"bad input"}"#), "POST", "/orders", 400),
            "bad input"
        );
        assert_eq!(
            extract_error_message(Some(b"Bad Gateway"), "GET", "/orders", 502),
            "Bad Gateway"
        );
        assert_eq!(
            extract_error_message(None, "DELETE", "/orders/3", 500),
            "DELETE /orders/3 failed with status 500"
        );

        let long = "x".repeat(2000);
        let message = extract_error_message(Some(long.as_bytes()), "GET", "/", 500);
        assert_eq!(message.len(), MAX_ERROR_MESSAGE_CHARS + 3);
    }

    #[tokio::test]
    async fn test_publisher_routes_events_by_type() {
        let bus = Arc::new(RecordingBus::default());
        let publisher = EventPublisher::new(bus.clone());

        let (sender, rx) = channel(8);
        sender.send(record(500));
        drop(sender);
        publisher.run(rx).await;

        let published = bus.published.lock();
        let keys: Vec<&str> = published.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["logs.request", "metrics.service", "logs.error"]);
        assert_eq!(published[0].1["traceId"], "trace-1");
        assert_eq!(published[2].1["errorType"], "HttpError");
    }

    #[tokio::test]
    async fn test_disconnected_bus_drops_silently() {
        let metrics = Arc::new(GatewayMetrics::new().unwrap());
        let publisher = EventPublisher::new(Arc::new(DisconnectedBus)).with_metrics(metrics.clone());
        assert!(!publisher.is_ready());

        publisher.publish_exchange(&record(200)).await;
        assert_eq!(metrics.events_dropped("not_connected"), 2);
    }

    #[tokio::test]
    async fn test_disabled_bus_connects_to_nothing() {
        let config = EventBusConfig {
            enabled: false,
            ..EventBusConfig::default()
        };
        assert!(!connect_bus(&config).await.is_ready());
    }

    #[test]
    fn test_full_channel_drops_instead_of_blocking() {
        let metrics = Arc::new(GatewayMetrics::new().unwrap());
        let (sender, _rx) = channel(1);
        let sender = sender.with_metrics(metrics.clone());

        sender.send(record(200));
        sender.send(record(200));
        assert_eq!(metrics.events_dropped("channel_full"), 1);
    }
}
