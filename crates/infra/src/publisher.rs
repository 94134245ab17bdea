//! Message publisher: JSON serialization over a shared producer.
//!
//! One publisher (and one producer connection) serves the whole process. The
//! transport settings (full replica acks, idempotent retries, bounded
//! in-flight, timeouts) live in the producer; this layer only serializes,
//! stamps, logs, and reports.
//!
//! Failures are returned, never raised past the caller: a product that failed
//! to publish is counted by the dispatch loop and the batch moves on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use catalogflow_events::{Delivery, MessageProducer, OutboundRecord, ProduceError};
use catalogflow_products::Product;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("failed to serialize payload: {0}")]
    Serialization(String),

    #[error(transparent)]
    Produce(#[from] ProduceError),
}

/// Serializing front of a [`MessageProducer`].
#[derive(Debug)]
pub struct MessagePublisher<P> {
    producer: P,
    default_topic: String,
    shut_down: AtomicBool,
}

impl<P> MessagePublisher<P>
where
    P: MessageProducer,
{
    pub fn new(producer: P, default_topic: impl Into<String>) -> Self {
        Self {
            producer,
            default_topic: default_topic.into(),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Serialize `payload` to JSON and append it to `topic`.
    ///
    /// Resolves once the broker acknowledged the message (or the producer gave
    /// up). The returned [`Delivery`] carries the offset and broker timestamp.
    #[instrument(skip(self, payload), fields(topic = %topic))]
    pub async fn publish<T>(&self, topic: &str, payload: &T) -> Result<Delivery, PublishError>
    where
        T: Serialize + ?Sized,
    {
        let bytes = serde_json::to_vec(payload).map_err(|e| {
            error!(error = %e, "failed to serialize message");
            PublishError::Serialization(e.to_string())
        })?;

        let record = OutboundRecord::new(bytes);
        let message_id = record.message_id;

        match self.producer.produce(topic, record).await {
            Ok(delivery) => {
                info!(
                    %message_id,
                    offset = %delivery.offset,
                    "message delivered"
                );
                Ok(delivery)
            }
            Err(err) => {
                error!(%message_id, error = %err, "message delivery failed");
                Err(err.into())
            }
        }
    }

    /// Publish a snapshot of `product` to the default topic.
    pub async fn publish_product(&self, product: &Product) -> Result<Delivery, PublishError> {
        self.publish(&self.default_topic, product).await
    }

    /// Publish any payload to the default topic.
    pub async fn send<T>(&self, payload: &T) -> Result<Delivery, PublishError>
    where
        T: Serialize + ?Sized,
    {
        self.publish(&self.default_topic, payload).await
    }

    /// Drain in-flight messages (bounded by `timeout`), then close the producer.
    ///
    /// Only the first call acts.
    pub async fn shutdown(&self, timeout: Duration) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Err(err) = self.producer.flush(timeout).await {
            warn!(error = %err, "producer flush incomplete at shutdown");
        }
        self.producer.close().await;
        info!("message publisher shut down");
    }
}
