//! Message broker capabilities and the task producer/consumer built on them.
//!
//! Delivery is at-least-once: a fetched message stays uncommitted until its
//! handler succeeds, and an uncommitted message is eventually redelivered.
//! Messages sharing a key land on one partition and are delivered in publish
//! order.

pub mod consumer;
pub mod memory;
pub mod producer;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::BrokerError;

pub use consumer::{BatchItem, ConsumerState, TaskConsumer, TaskHandler};
pub use memory::{MemoryBroker, MemorySubscription};
pub use producer::TaskProducer;

/// A message header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub key: String,
    pub value: String,
}

impl Header {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A message on its way to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    /// Partitioning key
    pub key: String,
    pub payload: Vec<u8>,
    pub headers: Vec<Header>,
}

/// A fetched message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: String,
    pub payload: Vec<u8>,
    pub headers: Vec<Header>,
    /// Identifies this particular delivery; a redelivery gets a new one
    pub delivery_id: u64,
}

impl Message {
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.key == key)
            .map(|h| h.value.as_str())
    }
}

/// Cumulative consumer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Messages fetched, redeliveries included
    pub messages: u64,
    /// Payload bytes fetched
    pub bytes: u64,
    /// Messages produced but not yet committed by this consumer's group
    pub lag: u64,
}

/// Publishing side of the broker.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, topic: &str, message: OutgoingMessage) -> Result<(), BrokerError>;

    /// Publish several messages in one call; either all are accepted or none.
    async fn publish_batch(
        &self,
        topic: &str,
        messages: Vec<OutgoingMessage>,
    ) -> Result<(), BrokerError>;

    /// Create the topic if it does not exist yet.
    async fn ensure_topic(
        &self,
        topic: &str,
        partitions: u32,
        replication_factor: u32,
    ) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

/// Consuming side of the broker, shared by every worker of a group.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Wait for the next message. Fails with [`BrokerError::Cancelled`] once
    /// `cancel` fires and with [`BrokerError::Closed`] after [`close`](Self::close).
    async fn fetch(&self, cancel: &CancellationToken) -> Result<Message, BrokerError>;

    /// Acknowledge a message so it is not redelivered.
    async fn commit(&self, message: &Message) -> Result<(), BrokerError>;

    fn stats(&self) -> ConsumerStats;

    async fn close(&self) -> Result<(), BrokerError>;
}
