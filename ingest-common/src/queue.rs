//! The message-queue collaborator, seen from the services that use it.
//!
//! Ingestion only receives pushed messages; replay pulls from a dead-letter subscription,
//! acknowledges what it handled and publishes to topics. Implementations live in
//! [`crate::pubsub`]; tests provide in-memory ones.
use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("request to the queue service failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("queue service responded with status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },
    #[error("queue service returned an invalid response: {0}")]
    InvalidResponse(String),
    #[error("invalid queue client configuration: {0}")]
    ConfigurationError(String),
}

/// A message as delivered by the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueMessage {
    pub message_id: String,
    pub data: Vec<u8>,
    pub attributes: HashMap<String, String>,
    pub ordering_key: Option<String>,
    pub publish_time: Option<String>,
}

/// A message pulled from a subscription, with the token needed to acknowledge it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub ack_id: String,
    pub message: QueueMessage,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    pub data: Vec<u8>,
    pub attributes: HashMap<String, String>,
    pub ordering_key: Option<String>,
}

#[async_trait]
pub trait DeadLetterSource {
    /// Pull up to `max_messages`. An empty result means the subscription is drained.
    async fn pull(&self, max_messages: usize) -> Result<Vec<ReceivedMessage>, QueueError>;

    async fn acknowledge(&self, ack_ids: &[String]) -> Result<(), QueueError>;
}

#[async_trait]
pub trait Publisher {
    /// Publish one message, returning the id the queue assigned to it.
    async fn publish(&self, topic: &str, message: OutboundMessage) -> Result<String, QueueError>;
}
