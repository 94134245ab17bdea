//! Infrastructure layer: configuration, product store, message transport, and
//! the two workflow loops (outbound dispatch, feedback consumption).

pub mod config;
pub mod dispatch;
pub mod event_bus;
pub mod product_store;
pub mod publisher;
pub mod workers;


pub use config::{AppConfig, ConfigError};
pub use dispatch::{DispatchOutcome, DispatchReport, DispatchSeverity, OutboundDispatcher, Selection};
pub use publisher::{MessagePublisher, PublishError};
