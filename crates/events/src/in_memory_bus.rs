//! In-memory message bus for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::bus::{
    ConsumeError, Delivery, InboundMessage, MessageConsumer, MessageProducer, OutboundRecord,
    ProduceError,
};

/// Message ids remembered for duplicate suppression.
const DEDUP_WINDOW: usize = 10_000;

/// Decides whether a produce call should fail (test fault injection).
pub type ProduceFault = Arc<dyn Fn(&str, &OutboundRecord) -> Option<ProduceError> + Send + Sync>;

#[derive(Debug, Clone)]
struct StoredMessage {
    payload: Vec<u8>,
    timestamp: DateTime<Utc>,
}

/// Recent `message_id -> Delivery`, oldest evicted first.
struct DedupWindow {
    capacity: usize,
    deliveries: HashMap<Uuid, Delivery>,
    order: VecDeque<Uuid>,
}

impl Default for DedupWindow {
    fn default() -> Self {
        Self {
            capacity: DEDUP_WINDOW,
            deliveries: HashMap::new(),
            order: VecDeque::new(),
        }
    }
}

impl DedupWindow {
    fn get(&self, id: &Uuid) -> Option<&Delivery> {
        self.deliveries.get(id)
    }

    fn remember(&mut self, id: Uuid, delivery: Delivery) {
        if self.deliveries.insert(id, delivery).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.deliveries.remove(&oldest);
            }
        }
    }
}

#[derive(Default)]
struct BusState {
    topics: HashMap<String, Vec<StoredMessage>>,
    /// Next offset to read, per (topic, group).
    committed: HashMap<(String, String), usize>,
    /// Duplicate suppression for retried sends.
    delivered: DedupWindow,
    fault: Option<ProduceFault>,
    failing_polls: usize,
    closed: bool,
}

/// In-memory topic log.
///
/// - Append-only per topic, offsets are log indexes
/// - Consumer groups resume from their last committed offset
/// - Sends carrying an already seen `message_id` are acknowledged, not appended
/// - No IO; the async methods never block on anything but the poll wait
#[derive(Default)]
pub struct InMemoryBus {
    state: Mutex<BusState>,
    notify: Notify,
}

impl core::fmt::Debug for InMemoryBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryBus").finish_non_exhaustive()
    }
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BusState>, String> {
        self.state.lock().map_err(|_| "lock poisoned".to_string())
    }

    /// Open a consumer on `topic` for `group`, positioned at the group's
    /// committed offset (or the start of the topic).
    pub fn consumer(self: &Arc<Self>, topic: impl Into<String>, group: impl Into<String>) -> InMemoryConsumer {
        let topic = topic.into();
        let group = group.into();
        let cursor = self.committed_offset(&topic, &group).unwrap_or(0);
        InMemoryConsumer {
            bus: Arc::clone(self),
            topic,
            group,
            cursor,
            closed: false,
        }
    }

    /// Install a fault hook consulted before every append.
    pub fn set_produce_fault<F>(&self, fault: F)
    where
        F: Fn(&str, &OutboundRecord) -> Option<ProduceError> + Send + Sync + 'static,
    {
        if let Ok(mut state) = self.lock() {
            state.fault = Some(Arc::new(fault));
        }
    }

    pub fn clear_produce_fault(&self) {
        if let Ok(mut state) = self.lock() {
            state.fault = None;
        }
    }

    /// Make the next `n` polls (on any consumer) fail with a connection error.
    pub fn fail_next_polls(&self, n: usize) {
        if let Ok(mut state) = self.lock() {
            state.failing_polls = n;
        }
    }

    /// Append a raw payload, bypassing faults (e.g. an external reviewer).
    pub fn append_raw(&self, topic: &str, payload: impl Into<Vec<u8>>) -> Option<Delivery> {
        let delivery = {
            let mut state = self.lock().ok()?;
            append(&mut state, topic, payload.into())
        };
        self.notify.notify_waiters();
        Some(delivery)
    }

    /// All messages currently in `topic`.
    pub fn messages(&self, topic: &str) -> Vec<InboundMessage> {
        let Ok(state) = self.lock() else {
            return vec![];
        };
        state
            .topics
            .get(topic)
            .map(|log| {
                log.iter()
                    .enumerate()
                    .map(|(offset, m)| to_inbound(topic, offset, m))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Next offset the group will read from, if it ever committed.
    pub fn committed_offset(&self, topic: &str, group: &str) -> Option<usize> {
        self.lock()
            .ok()?
            .committed
            .get(&(topic.to_string(), group.to_string()))
            .copied()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().map(|s| s.closed).unwrap_or(true)
    }
}

fn append(state: &mut BusState, topic: &str, payload: Vec<u8>) -> Delivery {
    let log = state.topics.entry(topic.to_string()).or_default();
    let timestamp = Utc::now();
    log.push(StoredMessage { payload, timestamp });
    Delivery {
        topic: topic.to_string(),
        offset: (log.len() - 1).to_string(),
        timestamp,
    }
}

fn to_inbound(topic: &str, offset: usize, m: &StoredMessage) -> InboundMessage {
    InboundMessage {
        topic: topic.to_string(),
        offset: offset.to_string(),
        payload: m.payload.clone(),
        timestamp: Some(m.timestamp),
    }
}

#[async_trait]
impl MessageProducer for InMemoryBus {
    async fn produce(&self, topic: &str, record: OutboundRecord) -> Result<Delivery, ProduceError> {
        let delivery = {
            let mut state = self.lock().map_err(ProduceError::Connection)?;
            if state.closed {
                return Err(ProduceError::Closed);
            }
            if let Some(fault) = state.fault.clone() {
                if let Some(err) = fault(topic, &record) {
                    return Err(err);
                }
            }
            if let Some(existing) = state.delivered.get(&record.message_id) {
                return Ok(existing.clone());
            }

            let delivery = append(&mut state, topic, record.payload);
            state.delivered.remember(record.message_id, delivery.clone());
            delivery
        };

        self.notify.notify_waiters();
        Ok(delivery)
    }

    async fn flush(&self, _timeout: Duration) -> Result<(), ProduceError> {
        // Appends complete inside `produce`; nothing is ever in flight.
        Ok(())
    }

    async fn close(&self) {
        if let Ok(mut state) = self.lock() {
            state.closed = true;
        }
    }
}

/// Consumer-group cursor over an [`InMemoryBus`] topic.
#[derive(Debug)]
pub struct InMemoryConsumer {
    bus: Arc<InMemoryBus>,
    topic: String,
    group: String,
    cursor: usize,
    closed: bool,
}

impl InMemoryConsumer {
    fn try_next(&mut self) -> Result<Option<InboundMessage>, ConsumeError> {
        let mut state = self.bus.lock().map_err(ConsumeError::Connection)?;
        if state.failing_polls > 0 {
            state.failing_polls -= 1;
            return Err(ConsumeError::Connection("injected poll failure".to_string()));
        }

        let next = state
            .topics
            .get(&self.topic)
            .and_then(|log| log.get(self.cursor))
            .map(|m| to_inbound(&self.topic, self.cursor, m));

        if next.is_some() {
            self.cursor += 1;
        }
        Ok(next)
    }
}

#[async_trait]
impl MessageConsumer for InMemoryConsumer {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<InboundMessage>, ConsumeError> {
        if self.closed {
            return Err(ConsumeError::Connection("consumer closed".to_string()));
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let bus = Arc::clone(&self.bus);
            let notified = bus.notify.notified();
            tokio::pin!(notified);
            // Register before checking the log so an append in between still wakes us.
            notified.as_mut().enable();

            if let Some(msg) = self.try_next()? {
                return Ok(Some(msg));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn commit(&mut self, message: &InboundMessage) -> Result<(), ConsumeError> {
        let offset: usize = message
            .offset
            .parse()
            .map_err(|_| ConsumeError::Command(format!("invalid offset {}", message.offset)))?;

        let mut state = self.bus.lock().map_err(ConsumeError::Connection)?;
        state
            .committed
            .insert((self.topic.clone(), self.group.clone()), offset + 1);
        Ok(())
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}
