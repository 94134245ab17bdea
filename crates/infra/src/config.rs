//! Process configuration, read once at startup from the environment.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_BUS_URL: &str = "redis://localhost:6379";
pub const DEFAULT_PRODUCT_EVENTS_TOPIC: &str = "product-events";
pub const DEFAULT_FEEDBACK_TOPIC: &str = "feedback";
pub const DEFAULT_FEEDBACK_GROUP: &str = "producer-feedback-group";
pub const DEFAULT_FEEDBACK_CONSUMER: &str = "feedback-consumer-1";
pub const DEFAULT_DISPATCH_DELAY_MS: u64 = 50;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set when USE_PERSISTENT_STORES=true")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub http_addr: SocketAddr,
    /// Postgres + Redis when true; in-memory store and bus otherwise.
    pub use_persistent_stores: bool,
    pub database_url: Option<String>,
    pub bus_url: String,
    pub product_events_topic: String,
    pub feedback_topic: String,
    pub feedback_group: String,
    pub feedback_consumer_name: String,
    pub dispatch_delay: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let http_addr = match get("HTTP_ADDR") {
            Some(raw) => raw.parse().map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
                name: "HTTP_ADDR",
                value: raw.clone(),
                reason: e.to_string(),
            })?,
            None => DEFAULT_HTTP_ADDR
                .parse()
                .map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
                    name: "HTTP_ADDR",
                    value: DEFAULT_HTTP_ADDR.to_string(),
                    reason: e.to_string(),
                })?,
        };

        let use_persistent_stores = match get("USE_PERSISTENT_STORES") {
            Some(raw) => parse_bool(&raw).ok_or_else(|| ConfigError::Invalid {
                name: "USE_PERSISTENT_STORES",
                value: raw.clone(),
                reason: "expected true or false".to_string(),
            })?,
            None => false,
        };

        let database_url = get("DATABASE_URL");
        if use_persistent_stores && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        let dispatch_delay = match get("DISPATCH_DELAY_MS") {
            Some(raw) => Duration::from_millis(raw.trim().parse().map_err(
                |e: std::num::ParseIntError| ConfigError::Invalid {
                    name: "DISPATCH_DELAY_MS",
                    value: raw.clone(),
                    reason: e.to_string(),
                },
            )?),
            None => Duration::from_millis(DEFAULT_DISPATCH_DELAY_MS),
        };

        Ok(Self {
            http_addr,
            use_persistent_stores,
            database_url,
            bus_url: get("BUS_URL")
                .or_else(|| get("REDIS_URL"))
                .unwrap_or_else(|| DEFAULT_BUS_URL.to_string()),
            product_events_topic: get("PRODUCT_EVENTS_TOPIC")
                .unwrap_or_else(|| DEFAULT_PRODUCT_EVENTS_TOPIC.to_string()),
            feedback_topic: get("FEEDBACK_TOPIC")
                .unwrap_or_else(|| DEFAULT_FEEDBACK_TOPIC.to_string()),
            feedback_group: get("FEEDBACK_CONSUMER_GROUP")
                .unwrap_or_else(|| DEFAULT_FEEDBACK_GROUP.to_string()),
            feedback_consumer_name: get("FEEDBACK_CONSUMER_NAME")
                .unwrap_or_else(|| DEFAULT_FEEDBACK_CONSUMER.to_string()),
            dispatch_delay,
        })
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}
