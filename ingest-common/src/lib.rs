pub mod attributes;
pub mod config;
pub mod envelope;
pub mod metrics;
pub mod pubsub;
pub mod queue;
pub mod time;
