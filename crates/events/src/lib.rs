//! Message bus contracts for the approval workflow.
//!
//! Transport-agnostic producer/consumer traits plus an in-memory bus used by
//! tests and the dev profile. Broker-backed implementations live in
//! `catalogflow-infra`.

pub mod bus;
pub mod in_memory_bus;

pub use bus::{
    ConsumeError, Delivery, InboundMessage, MessageConsumer, MessageProducer, OutboundRecord,
    ProduceError,
};
pub use in_memory_bus::{InMemoryBus, InMemoryConsumer, ProduceFault};
