//! Redis Streams-backed message bus (durable, at-least-once delivery).
//!
//! Maps the pub/sub contract of `catalogflow-events` onto Redis Streams:
//! - **Topic**: a stream key (`product-events`, `feedback`)
//! - **Offset**: the stream entry id (`<ms>-<seq>`)
//! - **Consumer groups**: `XGROUP CREATE ... 0 MKSTREAM`, so a new group starts
//!   from the earliest entry
//! - **Commit**: `XACK`; nothing is acknowledged implicitly. A failed `XACK`
//!   leaves the entry pending, and the next poll re-reads it
//!
//! ## Producer guarantees
//!
//! - **Full replica acknowledgement**: after the append the producer issues
//!   `WAIT <replicas> <timeout>` with the replica count discovered at connect.
//!   Fewer acks fail the attempt with `NotEnoughReplicas`.
//! - **Idempotent retries**: the append runs as one Lua script keyed by the
//!   record's `message_id`. A retry of an already appended record returns the
//!   earlier entry id instead of appending again.
//! - **Bounded in-flight**: at most `max_in_flight` produces run at once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::StreamReadReply;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use catalogflow_events::{
    ConsumeError, Delivery, InboundMessage, MessageConsumer, MessageProducer, OutboundRecord,
    ProduceError,
};

/// Atomic "append unless already appended" keyed by message id.
///
/// KEYS[1] stream, KEYS[2] dedup marker
/// ARGV[1] message id, ARGV[2] sent_at, ARGV[3] payload, ARGV[4] marker ttl (ms)
const APPEND_ONCE_SCRIPT: &str = r#"
local existing = redis.call('GET', KEYS[2])
if existing then
    return existing
end
local id = redis.call('XADD', KEYS[1], '*', 'message_id', ARGV[1], 'sent_at', ARGV[2], 'payload', ARGV[3])
redis.call('SET', KEYS[2], id, 'PX', ARGV[4])
return id
"#;

/// Producer delivery settings.
///
/// Fixed by the workflow rather than read from configuration.
#[derive(Debug, Clone)]
pub struct ProducerSettings {
    /// Concurrent produces allowed on the shared connection.
    pub max_in_flight: usize,
    /// Upper bound for one append + replica wait round trip.
    pub request_timeout: Duration,
    /// Overall deadline for a record, retries included.
    pub message_timeout: Duration,
    pub retry_backoff: Duration,
    /// How long a message id is remembered for duplicate suppression.
    pub dedup_ttl: Duration,
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            max_in_flight: 5,
            request_timeout: Duration::from_secs(5),
            message_timeout: Duration::from_secs(10),
            retry_backoff: Duration::from_millis(100),
            dedup_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Process-wide producer over one reconnecting connection.
#[derive(Clone)]
pub struct RedisStreamsProducer {
    conn: ConnectionManager,
    settings: ProducerSettings,
    replicas: usize,
    in_flight: Arc<Semaphore>,
    closed: Arc<AtomicBool>,
    append: Arc<redis::Script>,
}

impl std::fmt::Debug for RedisStreamsProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamsProducer")
            .field("settings", &self.settings)
            .field("replicas", &self.replicas)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl RedisStreamsProducer {
    /// Connect and discover how many replicas must acknowledge each append.
    pub async fn connect(
        redis_url: impl AsRef<str>,
        settings: ProducerSettings,
    ) -> Result<Self, ProduceError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| ProduceError::Connection(e.to_string()))?;
        let mut conn = ConnectionManager::new(client)
            .await
            .map_err(|e| ProduceError::Connection(e.to_string()))?;

        let info: String = redis::cmd("INFO")
            .arg("replication")
            .query_async(&mut conn)
            .await
            .map_err(|e| ProduceError::Connection(format!("INFO replication failed: {}", e)))?;
        let replicas = parse_connected_replicas(&info);

        info!(
            replicas,
            max_in_flight = settings.max_in_flight,
            "redis streams producer connected"
        );

        Ok(Self {
            conn,
            in_flight: Arc::new(Semaphore::new(settings.max_in_flight)),
            settings,
            replicas,
            closed: Arc::new(AtomicBool::new(false)),
            append: Arc::new(redis::Script::new(APPEND_ONCE_SCRIPT)),
        })
    }

    /// One append + replica wait. Reuses `record.message_id`, so repeating it
    /// after an ambiguous failure never appends twice.
    async fn attempt(&self, topic: &str, record: &OutboundRecord) -> Result<Delivery, ProduceError> {
        let mut conn = self.conn.clone();

        let entry_id: String = self
            .append
            .key(topic)
            .key(dedup_key(topic, record))
            .arg(record.message_id.to_string())
            .arg(record.sent_at.to_rfc3339())
            .arg(record.payload.as_slice())
            .arg(self.settings.dedup_ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(map_produce_error)?;

        if self.replicas > 0 {
            let acked: usize = redis::cmd("WAIT")
                .arg(self.replicas)
                .arg(self.settings.request_timeout.as_millis() as u64)
                .query_async(&mut conn)
                .await
                .map_err(map_produce_error)?;
            if acked < self.replicas {
                return Err(ProduceError::NotEnoughReplicas {
                    acked,
                    required: self.replicas,
                });
            }
        }

        Ok(Delivery {
            topic: topic.to_string(),
            timestamp: entry_timestamp(&entry_id).unwrap_or_else(Utc::now),
            offset: entry_id,
        })
    }
}

#[async_trait]
impl MessageProducer for RedisStreamsProducer {
    #[instrument(
        skip(self, record),
        fields(topic = %topic, message_id = %record.message_id),
        err
    )]
    async fn produce(&self, topic: &str, record: OutboundRecord) -> Result<Delivery, ProduceError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProduceError::Closed);
        }

        let message_timeout = self.settings.message_timeout;
        let deadline = Instant::now() + message_timeout;

        let _permit = match tokio::time::timeout_at(deadline, self.in_flight.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(ProduceError::Closed),
            Err(_) => return Err(ProduceError::Timeout(message_timeout)),
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let budget = remaining.min(self.settings.request_timeout);

            let last = match tokio::time::timeout(budget, self.attempt(topic, &record)).await {
                Ok(Ok(delivery)) => return Ok(delivery),
                Ok(Err(err)) if !err.is_transient() => return Err(err),
                Ok(Err(err)) => err,
                Err(_) => ProduceError::Timeout(budget),
            };

            if Instant::now() + self.settings.retry_backoff >= deadline {
                return Err(match last {
                    ProduceError::Timeout(_) => ProduceError::Timeout(message_timeout),
                    other => other,
                });
            }

            warn!(attempt, error = %last, "produce attempt failed, retrying");
            tokio::time::sleep(self.settings.retry_backoff).await;
        }
    }

    async fn flush(&self, timeout: Duration) -> Result<(), ProduceError> {
        let all = self.settings.max_in_flight as u32;
        match tokio::time::timeout(timeout, self.in_flight.acquire_many(all)).await {
            Ok(_) => Ok(()),
            Err(_) => Err(ProduceError::Timeout(timeout)),
        }
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("redis streams producer closed");
        }
    }
}

/// Consumer-group cursor on one stream.
///
/// Owns a dedicated connection: `XREADGROUP ... BLOCK` would otherwise stall
/// the producer's shared connection.
pub struct RedisStreamsConsumer {
    conn: MultiplexedConnection,
    topic: String,
    group: String,
    consumer_name: String,
    cursor: ReadCursor,
}

impl std::fmt::Debug for RedisStreamsConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamsConsumer")
            .field("topic", &self.topic)
            .field("group", &self.group)
            .field("consumer_name", &self.consumer_name)
            .finish()
    }
}

impl RedisStreamsConsumer {
    /// Connect and ensure the consumer group exists (idempotent).
    pub async fn connect(
        redis_url: impl AsRef<str>,
        topic: impl Into<String>,
        group: impl Into<String>,
        consumer_name: impl Into<String>,
    ) -> Result<Self, ConsumeError> {
        let topic = topic.into();
        let group = group.into();

        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| ConsumeError::Setup(e.to_string()))?;
        let mut conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| ConsumeError::Setup(e.to_string()))?;

        // "0": a new group starts from the earliest entry.
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&topic)
            .arg(&group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match created {
            Ok(_) => info!(topic = %topic, group = %group, "consumer group created"),
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => {
                return Err(ConsumeError::Setup(format!("XGROUP CREATE failed: {}", e)));
            }
        }

        Ok(Self {
            conn,
            topic,
            group,
            consumer_name: consumer_name.into(),
            cursor: ReadCursor::default(),
        })
    }

    async fn read_one(
        &mut self,
        id: &str,
        block: Option<Duration>,
    ) -> Result<Option<InboundMessage>, ConsumeError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer_name)
            .arg("COUNT")
            .arg(1);
        if let Some(block) = block {
            cmd.arg("BLOCK").arg(block.as_millis().max(1) as u64);
        }
        cmd.arg("STREAMS").arg(&self.topic).arg(id);

        let reply: Option<StreamReadReply> = cmd
            .query_async(&mut self.conn)
            .await
            .map_err(map_consume_error)?;

        let entry = reply
            .into_iter()
            .flat_map(|r| r.keys)
            .flat_map(|k| k.ids)
            .next();

        Ok(entry.map(|entry| InboundMessage {
            topic: self.topic.clone(),
            timestamp: entry_timestamp(&entry.id),
            payload: entry.get::<Vec<u8>>("payload").unwrap_or_default(),
            offset: entry.id,
        }))
    }
}

#[async_trait]
impl MessageConsumer for RedisStreamsConsumer {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<InboundMessage>, ConsumeError> {
        if self.cursor == ReadCursor::Pending {
            if let Some(message) = self.read_one(ReadCursor::Pending.start_id(), None).await? {
                debug!(offset = %message.offset, "redelivering pending entry");
                return Ok(Some(message));
            }
            self.cursor = ReadCursor::New;
        }
        self.read_one(ReadCursor::New.start_id(), Some(timeout)).await
    }

    #[instrument(skip(self, message), fields(topic = %self.topic, offset = %message.offset), err)]
    async fn commit(&mut self, message: &InboundMessage) -> Result<(), ConsumeError> {
        let acked: redis::RedisResult<i64> = redis::cmd("XACK")
            .arg(&self.topic)
            .arg(&self.group)
            .arg(&message.offset)
            .query_async(&mut self.conn)
            .await;
        self.cursor = self.cursor.after_ack(acked.is_ok());
        acked.map(|_| ()).map_err(map_consume_error)
    }

    async fn close(&mut self) {
        debug!(
            topic = %self.topic,
            group = %self.group,
            consumer = %self.consumer_name,
            "redis streams consumer closed"
        );
    }
}

/// Which entries the next `XREADGROUP` asks for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum ReadCursor {
    /// This consumer's delivered but unacknowledged entries.
    #[default]
    Pending,
    /// Entries never delivered to the group.
    New,
}

impl ReadCursor {
    fn start_id(self) -> &'static str {
        match self {
            ReadCursor::Pending => "0",
            ReadCursor::New => ">",
        }
    }

    fn after_ack(self, acked: bool) -> Self {
        if acked { self } else { ReadCursor::Pending }
    }
}

fn dedup_key(topic: &str, record: &OutboundRecord) -> String {
    format!("{}:dedup:{}", topic, record.message_id)
}

/// `connected_slaves:<n>` from `INFO replication`; 0 when absent.
fn parse_connected_replicas(info: &str) -> usize {
    info.lines()
        .find_map(|line| line.trim().strip_prefix("connected_slaves:"))
        .and_then(|n| n.trim().parse().ok())
        .unwrap_or(0)
}

/// Append time encoded in a stream entry id (`<unix ms>-<seq>`).
fn entry_timestamp(entry_id: &str) -> Option<DateTime<Utc>> {
    let millis = entry_id.split('-').next()?.parse::<i64>().ok()?;
    Utc.timestamp_millis_opt(millis).single()
}

fn map_produce_error(err: redis::RedisError) -> ProduceError {
    if err.is_timeout() {
        ProduceError::Timeout(Duration::ZERO)
    } else if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        ProduceError::Connection(err.to_string())
    } else {
        ProduceError::Rejected(err.to_string())
    }
}

fn map_consume_error(err: redis::RedisError) -> ConsumeError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        ConsumeError::Connection(err.to_string())
    } else {
        ConsumeError::Command(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replica_count_from_info() {
        let info = "# Replication\r\nrole:master\r\nconnected_slaves:2\r\nmaster_repl_offset:0\r\n";
        assert_eq!(parse_connected_replicas(info), 2);
        assert_eq!(parse_connected_replicas("# Replication\r\nrole:master\r\n"), 0);
    }

    #[test]
    fn entry_ids_carry_append_time() {
        let ts = entry_timestamp("1700000000123-0").unwrap();
        assert_eq!(ts.timestamp_millis(), 1_700_000_000_123);
        assert!(entry_timestamp("not-an-id").is_none());
    }

    #[test]
    fn dedup_key_is_per_topic_and_message() {
        let record = OutboundRecord::new(b"{}".to_vec());
        let key = dedup_key("product-events", &record);
        assert!(key.starts_with("product-events:dedup:"));
        assert!(key.ends_with(&record.message_id.to_string()));
    }

    #[test]
    fn failed_ack_goes_back_to_pending_entries() {
        let cursor = ReadCursor::default();
        assert_eq!(cursor.start_id(), "0");

        let cursor = ReadCursor::New;
        assert_eq!(cursor.after_ack(true), ReadCursor::New);
        assert_eq!(cursor.start_id(), ">");

        let cursor = cursor.after_ack(false);
        assert_eq!(cursor, ReadCursor::Pending);
        assert_eq!(cursor.start_id(), "0");
    }

    #[test]
    fn default_settings() {
        let s = ProducerSettings::default();
        assert_eq!(s.max_in_flight, 5);
        assert_eq!(s.request_timeout, Duration::from_secs(5));
        assert_eq!(s.message_timeout, Duration::from_secs(10));
    }
}
