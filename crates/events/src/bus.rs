//! Message bus contracts (mechanics only).
//!
//! The approval workflow talks to an ordered, at-least-once pub/sub transport
//! with consumer-group offset tracking. This module fixes the seam:
//!
//! - [`MessageProducer`]: keyless append to a topic, resolved once the broker
//!   acknowledges (or the send times out)
//! - [`MessageConsumer`]: single-owner polling cursor inside a consumer group,
//!   with manual offset commit
//!
//! ```text
//! dispatch loop ──produce──▶ "product-events" ──▶ reviewer
//!                                                   │
//! feedback consumer ◀──poll/commit── "feedback" ◀───┘
//! ```
//!
//! Implementations live in `catalogflow-infra` (Redis Streams) and in
//! [`crate::in_memory_bus`] (tests/dev).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// A message ready to be appended to a topic.
///
/// Records are keyless. `message_id` is generated once per logical send and
/// reused by transport-level retries so the broker can drop duplicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRecord {
    pub message_id: Uuid,
    pub payload: Vec<u8>,
    pub sent_at: DateTime<Utc>,
}

impl OutboundRecord {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            message_id: Uuid::now_v7(),
            payload,
            sent_at: Utc::now(),
        }
    }
}

/// Broker acknowledgement for a produced record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    /// Transport-specific position (stream entry id, log index, ...).
    pub offset: String,
    /// Broker-assigned append time (never earlier than the send time).
    pub timestamp: DateTime<Utc>,
}

/// A message read from a topic by a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub offset: String,
    pub payload: Vec<u8>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl InboundMessage {
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Produce failure as reported by the transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProduceError {
    #[error("produce timed out after {0:?}")]
    Timeout(Duration),

    #[error("not enough replicas acknowledged: {acked}/{required}")]
    NotEnoughReplicas { acked: usize, required: usize },

    #[error("broker rejected message: {0}")]
    Rejected(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("producer is closed")]
    Closed,
}

impl ProduceError {
    /// Worth another attempt with the same `message_id`.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProduceError::Timeout(_)
                | ProduceError::NotEnoughReplicas { .. }
                | ProduceError::Connection(_)
        )
    }
}

/// Consume-side failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConsumeError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("command error: {0}")]
    Command(String),

    /// Subscription could not be created (bad address, topic or group).
    #[error("consumer setup failed: {0}")]
    Setup(String),
}

/// Keyless publish side of the bus.
///
/// Implementations are shared process-wide (`Send + Sync`) and must be safe
/// for concurrent `produce` calls.
#[async_trait]
pub trait MessageProducer: Send + Sync {
    /// Append `record` to `topic`, resolving once the broker acknowledged it.
    async fn produce(&self, topic: &str, record: OutboundRecord) -> Result<Delivery, ProduceError>;

    /// Wait (bounded) until every in-flight produce has resolved.
    async fn flush(&self, timeout: Duration) -> Result<(), ProduceError>;

    /// Stop accepting new records. Later `produce` calls fail with `Closed`.
    async fn close(&self);
}

#[async_trait]
impl<P> MessageProducer for Arc<P>
where
    P: MessageProducer + ?Sized,
{
    async fn produce(&self, topic: &str, record: OutboundRecord) -> Result<Delivery, ProduceError> {
        (**self).produce(topic, record).await
    }

    async fn flush(&self, timeout: Duration) -> Result<(), ProduceError> {
        (**self).flush(timeout).await
    }

    async fn close(&self) {
        (**self).close().await
    }
}

/// Consumer-group cursor on one topic.
///
/// Owned by a single task. Offsets are never committed implicitly; callers
/// commit after they are done with a message.
#[async_trait]
pub trait MessageConsumer: Send {
    /// Wait up to `timeout` for the next message.
    async fn poll(&mut self, timeout: Duration) -> Result<Option<InboundMessage>, ConsumeError>;

    /// Mark `message` (and everything before it) as consumed for the group.
    async fn commit(&mut self, message: &InboundMessage) -> Result<(), ConsumeError>;

    /// Release the subscription.
    async fn close(&mut self);
}

#[async_trait]
impl<C> MessageConsumer for Box<C>
where
    C: MessageConsumer + ?Sized,
{
    async fn poll(&mut self, timeout: Duration) -> Result<Option<InboundMessage>, ConsumeError> {
        (**self).poll(timeout).await
    }

    async fn commit(&mut self, message: &InboundMessage) -> Result<(), ConsumeError> {
        (**self).commit(message).await
    }

    async fn close(&mut self) {
        (**self).close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_records_get_distinct_ids() {
        let a = OutboundRecord::new(b"{}".to_vec());
        let b = OutboundRecord::new(b"{}".to_vec());
        assert_ne!(a.message_id, b.message_id);
    }

    #[test]
    fn transient_classification() {
        assert!(ProduceError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(ProduceError::Connection("reset".into()).is_transient());
        assert!(ProduceError::NotEnoughReplicas { acked: 1, required: 2 }.is_transient());
        assert!(!ProduceError::Rejected("too large".into()).is_transient());
        assert!(!ProduceError::Closed.is_transient());
    }
}
