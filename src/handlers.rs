//! Side-effect handlers the outbox dispatches to, keyed by topic.

use crate::store::OutboxMessage;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub const TOPIC_BOOKING_CREATED: &str = "booking:created";
pub const TOPIC_BOOKING_UPDATED: &str = "booking:updated";
pub const TOPIC_BOOKING_DELETED: &str = "booking:deleted";
pub const TOPIC_BOOKING_BULK_CREATED: &str = "booking:bulk_created";
pub const TOPIC_EMAIL_NOTIFICATION: &str = "notification:email";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error("invalid payload for '{topic}': {reason}")]
    InvalidPayload { topic: String, reason: String },
    #[error("delivery failed: {0}")]
    Delivery(String),
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    fn invalid(message: &OutboxMessage, reason: impl Into<String>) -> Self {
        Self::InvalidPayload { topic: message.topic.clone(), reason: reason.into() }
    }
}

/// Performs one side effect.
///
/// `Ok(true)` marks the message delivered. `Ok(false)` and `Err(_)` both count as a failed
/// attempt; the error form carries a reason for the log.
#[async_trait]
pub trait SideEffectHandler: Send + Sync + fmt::Debug {
    async fn handle(&self, message: &OutboxMessage) -> Result<bool, HandlerError>;
}

/// Booking change kind carried in broadcast payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingChange {
    Create,
    Update,
    Delete,
}

impl BookingChange {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// Real-time fan-out to connected clients (a WebSocket hub, typically).
#[async_trait]
pub trait Broadcaster: Send + Sync + fmt::Debug {
    async fn booking_update(
        &self,
        change: BookingChange,
        booking_id: &str,
        data: &Value,
    ) -> Result<(), HandlerError>;

    async fn bulk_operation(
        &self,
        change: BookingChange,
        count: u64,
        booking_ids: &[String],
    ) -> Result<(), HandlerError>;
}

/// Broadcaster that only logs; useful until a transport is wired in.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingBroadcaster;

#[async_trait]
impl Broadcaster for TracingBroadcaster {
    async fn booking_update(
        &self,
        change: BookingChange,
        booking_id: &str,
        _data: &Value,
    ) -> Result<(), HandlerError> {
        tracing::info!(target: "bulwark::handlers", change = change.as_str(), booking_id, "booking broadcast");
        Ok(())
    }

    async fn bulk_operation(
        &self,
        change: BookingChange,
        count: u64,
        booking_ids: &[String],
    ) -> Result<(), HandlerError> {
        tracing::info!(
            target: "bulwark::handlers",
            change = change.as_str(),
            count,
            ids = booking_ids.len(),
            "bulk booking broadcast"
        );
        Ok(())
    }
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Broadcasts booking changes.
///
/// Single-booking topics expect `{"bookingId", "type", "data"}` with `type` one of
/// `create`/`update`/`delete`; an unknown type is a failed attempt. The bulk topic expects
/// `{"count", "bookingIds"}`.
#[derive(Debug, Clone)]
pub struct BookingBroadcastHandler {
    broadcaster: Arc<dyn Broadcaster>,
}

impl BookingBroadcastHandler {
    pub fn new(broadcaster: Arc<dyn Broadcaster>) -> Self {
        Self { broadcaster }
    }

    async fn single(&self, message: &OutboxMessage) -> Result<bool, HandlerError> {
        let payload = &message.payload;
        let booking_id = payload
            .get("bookingId")
            .and_then(id_string)
            .ok_or_else(|| HandlerError::invalid(message, "missing bookingId"))?;
        let kind = payload.get("type").and_then(Value::as_str).unwrap_or_default();
        let Some(change) = BookingChange::parse(kind) else {
            tracing::warn!(target: "bulwark::handlers", id = %message.id, kind, "unknown booking message type");
            return Ok(false);
        };
        let data = payload.get("data").unwrap_or(&Value::Null);
        self.broadcaster.booking_update(change, &booking_id, data).await?;
        Ok(true)
    }

    async fn bulk(&self, message: &OutboxMessage) -> Result<bool, HandlerError> {
        let payload = &message.payload;
        let ids: Vec<String> = payload
            .get("bookingIds")
            .and_then(Value::as_array)
            .ok_or_else(|| HandlerError::invalid(message, "missing bookingIds"))?
            .iter()
            .filter_map(id_string)
            .collect();
        let count = payload.get("count").and_then(Value::as_u64).unwrap_or(ids.len() as u64);
        self.broadcaster.bulk_operation(BookingChange::Create, count, &ids).await?;
        Ok(true)
    }
}

#[async_trait]
impl SideEffectHandler for BookingBroadcastHandler {
    async fn handle(&self, message: &OutboxMessage) -> Result<bool, HandlerError> {
        if message.topic == TOPIC_BOOKING_BULK_CREATED {
            self.bulk(message).await
        } else {
            self.single(message).await
        }
    }
}

/// Logs `{"to", "template", "data"}` notifications. No mail is sent.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmailLogHandler;

#[async_trait]
impl SideEffectHandler for EmailLogHandler {
    async fn handle(&self, message: &OutboxMessage) -> Result<bool, HandlerError> {
        let to = message
            .payload
            .get("to")
            .and_then(Value::as_str)
            .ok_or_else(|| HandlerError::invalid(message, "missing recipient"))?;
        let template = message.payload.get("template").and_then(Value::as_str).unwrap_or("default");
        tracing::info!(target: "bulwark::handlers", to, template, "email notification");
        Ok(true)
    }
}

/// Topic to handler lookup.
#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn SideEffectHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Booking topics to `broadcaster`, email notifications to [`EmailLogHandler`].
    pub fn with_defaults(broadcaster: Arc<dyn Broadcaster>) -> Self {
        let booking: Arc<dyn SideEffectHandler> = Arc::new(BookingBroadcastHandler::new(broadcaster));
        let mut registry = Self::new();
        for topic in [
            TOPIC_BOOKING_CREATED,
            TOPIC_BOOKING_UPDATED,
            TOPIC_BOOKING_DELETED,
            TOPIC_BOOKING_BULK_CREATED,
        ] {
            registry.handlers.insert(topic.to_string(), booking.clone());
        }
        registry.register(TOPIC_EMAIL_NOTIFICATION, Arc::new(EmailLogHandler));
        registry
    }

    /// Install `handler` for `topic`, replacing any previous one.
    pub fn register(&mut self, topic: impl Into<String>, handler: Arc<dyn SideEffectHandler>) -> &mut Self {
        self.handlers.insert(topic.into(), handler);
        self
    }

    pub fn get(&self, topic: &str) -> Option<Arc<dyn SideEffectHandler>> {
        self.handlers.get(topic).cloned()
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.handlers.keys().cloned().collect();
        topics.sort();
        topics
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingBroadcaster;
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use serde_json::json;

    fn message(topic: &str, payload: Value) -> OutboxMessage {
        OutboxMessage::new(topic, payload, ManualClock::default().now())
    }

    #[tokio::test]
    async fn booking_changes_are_broadcast() {
        let hub = Arc::new(RecordingBroadcaster::default());
        let handler = BookingBroadcastHandler::new(hub.clone());
        let created = message(TOPIC_BOOKING_CREATED, json!({"bookingId": 42, "type": "create", "data": {}}));
        assert!(handler.handle(&created).await.unwrap());
        let bulk = message(TOPIC_BOOKING_BULK_CREATED, json!({"count": 2, "bookingIds": ["a", "b"]}));
        assert!(handler.handle(&bulk).await.unwrap());
        assert_eq!(hub.events(), vec!["create:42", "bulk-create:2:a,b"]);
    }

    #[tokio::test]
    async fn unknown_booking_type_fails_the_attempt() {
        let hub = Arc::new(RecordingBroadcaster::default());
        let handler = BookingBroadcastHandler::new(hub.clone());
        let msg = message(TOPIC_BOOKING_UPDATED, json!({"bookingId": "b1", "type": "archive"}));
        assert!(!handler.handle(&msg).await.unwrap());
        assert!(hub.events().is_empty());
    }

    #[tokio::test]
    async fn malformed_payloads_are_errors() {
        let handler = BookingBroadcastHandler::new(Arc::new(RecordingBroadcaster::default()));
        let err = handler.handle(&message(TOPIC_BOOKING_DELETED, json!({"type": "delete"}))).await.unwrap_err();
        assert!(matches!(err, HandlerError::InvalidPayload { .. }));
        assert!(EmailLogHandler.handle(&message(TOPIC_EMAIL_NOTIFICATION, json!({}))).await.is_err());
    }

    #[tokio::test]
    async fn broadcaster_failures_propagate() {
        let handler = BookingBroadcastHandler::new(Arc::new(RecordingBroadcaster::failing()));
        let msg = message(TOPIC_BOOKING_CREATED, json!({"bookingId": 1, "type": "create"}));
        assert_eq!(handler.handle(&msg).await, Err(HandlerError::Delivery("hub offline".into())));
    }

    #[tokio::test]
    async fn defaults_cover_every_topic() {
        let registry = HandlerRegistry::with_defaults(Arc::new(TracingBroadcaster));
        assert_eq!(
            registry.topics(),
            vec![
                TOPIC_BOOKING_BULK_CREATED,
                TOPIC_BOOKING_CREATED,
                TOPIC_BOOKING_DELETED,
                TOPIC_BOOKING_UPDATED,
                TOPIC_EMAIL_NOTIFICATION,
            ]
        );
        let email = registry.get(TOPIC_EMAIL_NOTIFICATION).unwrap();
        let msg = message(TOPIC_EMAIL_NOTIFICATION, json!({"to": "a@b.c", "template": "booking_confirmed"}));
        assert!(email.handle(&msg).await.unwrap());
        assert!(registry.get("billing:invoice").is_none());
    }
}
