//! Infrastructure message bus implementations.
//!
//! The bus contracts live in `catalogflow-events` as pure mechanics (plus the
//! in-memory bus used by tests and the dev profile). This module provides the
//! Redis Streams transport used in production.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{ProducerSettings, RedisStreamsConsumer, RedisStreamsProducer};
