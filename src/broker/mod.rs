//! Broker backends for relayq.
//!
//! relayq does not depend on a particular wire protocol. It needs a durable
//! point-to-point queue with acknowledge/reject semantics, and the traits in
//! this module describe exactly that contract:
//! - **In-Memory**: an in-process broker, used for single-process setups and tests
//! - **AMQP**: RabbitMQ or any AMQP 0.9.1 broker (requires `amqp-broker`)
//!
//! # Examples
//!
//! ```rust,no_run
//! use relayq::prelude::*;
//! use std::sync::Arc;
//!
//! // In-memory broker (default)
//! let broker: Arc<dyn BrokerConnector> = Arc::new(InMemoryBroker::new());
//!
//! // AMQP broker (requires amqp-broker feature)
//! # #[cfg(feature = "amqp-broker")]
//! let broker: Arc<dyn BrokerConnector> =
//!     Arc::new(relayq::broker::AmqpConnector::new(&BrokerConfig::default()));
//! ```

use crate::error::RelayResult;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;

pub mod memory;
pub use memory::InMemoryBroker;

#[cfg(feature = "amqp-broker")]
#[cfg_attr(docsrs, doc(cfg(feature = "amqp-broker")))]
pub mod amqp;

#[cfg(feature = "amqp-broker")]
#[cfg_attr(docsrs, doc(cfg(feature = "amqp-broker")))]
pub use amqp::AmqpConnector;

/// What a channel is opened for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    /// Publishing; with `confirms` every publish waits for the broker
    Publish {
        /// Enable per-message delivery confirmation
        confirms: bool,
    },
    /// Consuming with at most `prefetch` unacknowledged deliveries
    Consume {
        /// Unacknowledged delivery limit (0 = unlimited)
        prefetch: u16,
    },
}

/// Queue declaration arguments
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDeclare {
    /// Only check that the queue exists
    pub passive: bool,
    /// Survive broker restarts
    pub durable: bool,
    /// Where rejected messages are routed
    pub dead_letter_queue: Option<String>,
}

impl QueueDeclare {
    /// Durable queue without dead-letter routing
    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Default::default()
        }
    }

    /// Check-only declaration
    pub fn passive() -> Self {
        Self {
            passive: true,
            ..Default::default()
        }
    }

    /// Route rejected messages to `queue`
    pub fn with_dead_letter(mut self, queue: impl Into<String>) -> Self {
        self.dead_letter_queue = Some(queue.into());
        self
    }
}

/// State reported by a queue declaration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueInfo {
    /// Messages ready for delivery
    pub message_count: u32,
    /// Active consumers
    pub consumer_count: u32,
}

/// Per-publish properties
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishProperties {
    /// Written to disk by the broker
    pub persistent: bool,
    /// Return the message instead of silently dropping it when unroutable
    pub mandatory: bool,
}

impl Default for PublishProperties {
    fn default() -> Self {
        Self {
            persistent: true,
            mandatory: true,
        }
    }
}

/// Broker verdict on a publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// Durably received
    Ack,
    /// Broker refused the message
    Nack,
    /// Mandatory message had no queue to go to
    Returned,
    /// Channel does not use confirms
    NotRequested,
}

/// Settles one delivery
#[async_trait]
pub trait Acker: Send {
    /// Positive acknowledgement, the message is removed
    async fn ack(self: Box<Self>) -> RelayResult<()>;

    /// Negative acknowledgement; without requeue the message goes to the
    /// queue's dead-letter target, if any
    async fn reject(self: Box<Self>, requeue: bool) -> RelayResult<()>;
}

/// One delivery of one message
pub struct Delivery {
    /// Channel-scoped delivery identifier
    pub delivery_tag: u64,
    /// Whether the message was delivered before without being settled
    pub redelivered: bool,
    /// Raw message body
    pub body: Vec<u8>,
    /// Settles this delivery
    pub acker: Box<dyn Acker>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .finish_non_exhaustive()
    }
}

/// Deliveries from one consumer subscription
pub type DeliveryStream = BoxStream<'static, RelayResult<Delivery>>;

/// Establishes connections to a broker
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Open a new connection.
    ///
    /// Unreachable brokers must surface as transient errors
    /// ([`RelayError::is_transient`](crate::error::RelayError::is_transient));
    /// authentication and configuration failures as non-transient ones.
    async fn connect(&self) -> RelayResult<Arc<dyn BrokerConnection>>;
}

/// A live transport to the broker
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Whether the connection is still usable
    fn is_open(&self) -> bool;

    /// Open a channel configured for `mode`
    async fn open_channel(&self, mode: ChannelMode) -> RelayResult<Box<dyn BrokerChannel>>;

    /// Close the connection and all of its channels
    async fn close(&self) -> RelayResult<()>;
}

/// A session on a connection
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Whether the channel is still usable
    fn is_open(&self) -> bool;

    /// Declare (or with `passive`, check) a queue
    async fn declare_queue(&self, queue: &str, declare: QueueDeclare) -> RelayResult<QueueInfo>;

    /// Publish `body` to `queue`, waiting for the confirmation if enabled
    async fn publish(
        &self,
        queue: &str,
        body: &[u8],
        properties: PublishProperties,
    ) -> RelayResult<Confirmation>;

    /// Start consuming `queue`
    async fn consume(&self, queue: &str) -> RelayResult<DeliveryStream>;

    /// Close the channel
    async fn close(&self) -> RelayResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declare_builders() {
        let declare = QueueDeclare::durable().with_dead_letter("tasks.dlq");
        assert!(declare.durable);
        assert!(!declare.passive);
        assert_eq!(declare.dead_letter_queue.as_deref(), Some("tasks.dlq"));

        assert!(QueueDeclare::passive().passive);
    }

    #[test]
    fn test_publish_defaults_are_persistent_and_mandatory() {
        let properties = PublishProperties::default();
        assert!(properties.persistent);
        assert!(properties.mandatory);
    }
}
