//! Background workers.

pub mod feedback_consumer;

pub use feedback_consumer::{
    FeedbackConsumer, FeedbackConsumerConfig, FeedbackConsumerHandle, FeedbackOutcome,
    FeedbackStats,
};
