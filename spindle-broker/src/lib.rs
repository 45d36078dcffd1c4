//! The message broker seam between the scheduler and the workers.
//!
//! Messages are 16-byte raw reservation UUIDs published to a fanout
//! exchange and consumed from a durable queue with explicit
//! acknowledgement. `AmqpBroker` is the production driver; `MemoryBroker`
//! backs tests and the single-process server role.

pub mod amqp;
pub mod memory;

pub use amqp::AmqpBroker;
pub use memory::MemoryBroker;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("consume failed: {0}")]
    Consume(String),

    #[error("ack failed: {0}")]
    Ack(String),
}

/// Acknowledgement handle for a consumed message.
#[async_trait]
pub trait Ack: Send {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError>;
}

/// A consumed message plus its acknowledgement handle.
pub struct JobDelivery {
    pub body: Vec<u8>,
    acker: Box<dyn Ack>,
}

impl JobDelivery {
    pub fn new(body: Vec<u8>, acker: Box<dyn Ack>) -> Self {
        Self { body, acker }
    }

    /// Acknowledge the message. Workers do this before dispatch
    /// (at-most-once delivery).
    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }
}

/// Publish/consume surface over the broker.
#[async_trait]
pub trait JobBroker: Send + Sync {
    /// Publish one message to the fanout exchange.
    async fn publish(&self, body: &[u8]) -> Result<(), BrokerError>;

    /// Current depth of the bound queue.
    async fn queue_depth(&self) -> Result<u64, BrokerError>;

    /// Next message, or `None` when the consumer is closed.
    async fn next(&self) -> Result<Option<JobDelivery>, BrokerError>;
}
