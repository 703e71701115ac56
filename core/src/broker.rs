//! Broker transport abstraction.
//!
//! Courier talks to its broker through three small object-safe traits that
//! mirror the AMQP 0-9-1 object model:
//!
//! ```text
//! Connector ──connect()──► Connection ──create_channel()──► Channel
//!                                                            │
//!                              declare_exchange / declare_queue / bind_queue
//!                              publish / consume ──► DeliveryStream ──► Delivery
//!                                                                        │
//!                                                                ack() / reject()
//! ```
//!
//! Only one exchange kind is used: a durable **topic** exchange where the
//! routing key is the event type. Two queue shapes exist, see [`QueueSpec`].
//!
//! # Implementations
//!
//! - `courier_amqp::AmqpConnector` - RabbitMQ via `lapin`
//! - `courier_testing::InMemoryBroker` - in-process topic exchange with fault
//!   injection
//!
//! # Dyn Compatibility
//!
//! Methods return `Pin<Box<dyn Future>>` instead of using `async fn` so the
//! traits can be shared as `Arc<dyn Channel>` between the link, waiters and
//! consumers.

use futures::Stream;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Errors reported by a broker transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The broker could not be reached or refused the connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The channel or its connection is closed.
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Declaring or binding an exchange or queue failed.
    #[error("Topology error on '{object}': {reason}")]
    Topology {
        /// The exchange or queue being declared or bound
        object: String,
        /// The reason for failure
        reason: String,
    },

    /// The broker did not accept a published message.
    #[error("Publish to '{exchange}' with key '{routing_key}' failed: {reason}")]
    PublishFailed {
        /// Target exchange
        exchange: String,
        /// Routing key of the message
        routing_key: String,
        /// The reason for failure
        reason: String,
    },

    /// Starting a consumer failed.
    #[error("Consume on '{queue}' failed: {reason}")]
    ConsumeFailed {
        /// The queue being consumed
        queue: String,
        /// The reason for failure
        reason: String,
    },

    /// Acknowledging or rejecting a delivery failed.
    #[error("Acknowledgement failed: {0}")]
    Acknowledgement(String),
}

/// Boxed future returned by transport operations.
pub type BrokerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BrokerError>> + Send + 'a>>;

/// Stream of deliveries from one consumer.
///
/// The stream ends when the consumer is cancelled or its channel closes.
/// Dropping the stream cancels the consumer.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, BrokerError>> + Send>>;

/// Declaration parameters for a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    /// Queue name, or `None` to let the broker assign one.
    pub name: Option<String>,
    /// Survives a broker restart.
    pub durable: bool,
    /// Usable only by the declaring connection, deleted when it closes.
    pub exclusive: bool,
    /// Deleted once its last consumer is cancelled.
    pub auto_delete: bool,
}

impl QueueSpec {
    /// A named, durable, shared queue for a long-lived worker role.
    #[must_use]
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }

    /// An anonymous, exclusive, auto-deleting queue for a single waiter.
    #[must_use]
    pub const fn ephemeral() -> Self {
        Self {
            name: None,
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

/// Settles a delivery with the broker.
pub trait Acknowledger: Send + Sync {
    /// Positively acknowledge the delivery.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Acknowledgement`] if the channel is gone.
    fn ack(&self) -> BrokerFuture<'_, ()>;

    /// Reject the delivery, optionally returning it to its queue.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Acknowledgement`] if the channel is gone.
    fn reject(&self, requeue: bool) -> BrokerFuture<'_, ()>;
}

/// A message received from a queue, awaiting settlement.
pub struct Delivery {
    /// Routing key the message was published with (its event type).
    pub routing_key: String,
    /// Raw message body.
    pub body: Vec<u8>,
    /// The broker has delivered this message before.
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    /// Create a delivery settled through `acker`.
    #[must_use]
    pub fn new(
        routing_key: impl Into<String>,
        body: Vec<u8>,
        redelivered: bool,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            routing_key: routing_key.into(),
            body,
            redelivered,
            acker,
        }
    }

    /// Acknowledge this delivery.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Acknowledgement`] if the broker rejects it.
    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    /// Reject this delivery.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Acknowledgement`] if the broker rejects it.
    pub async fn reject(self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("body_len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

/// Opens connections to a broker.
pub trait Connector: Send + Sync {
    /// Open a new connection.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if the broker is unreachable.
    fn connect(&self) -> BrokerFuture<'_, Arc<dyn Connection>>;

    /// Endpoint description for logs, without credentials.
    fn describe(&self) -> String;
}

/// A live broker connection.
pub trait Connection: Send + Sync {
    /// Returns `true` while the connection is usable.
    fn is_open(&self) -> bool;

    /// Open a channel on this connection.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ChannelClosed`] if the connection is closed.
    fn create_channel(&self) -> BrokerFuture<'_, Arc<dyn Channel>>;

    /// Close the connection. Closing an already closed connection succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if the close handshake fails.
    fn close(&self) -> BrokerFuture<'_, ()>;
}

/// A channel multiplexed over a [`Connection`].
pub trait Channel: Send + Sync {
    /// Returns `true` while the channel and its connection are usable.
    fn is_open(&self) -> bool;

    /// Declare a durable topic exchange. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Topology`] if the declaration is refused.
    fn declare_exchange(&self, name: &str) -> BrokerFuture<'_, ()>;

    /// Declare a queue, returning its name (broker-assigned for anonymous
    /// queues).
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Topology`] if the declaration is refused.
    fn declare_queue(&self, spec: &QueueSpec) -> BrokerFuture<'_, String>;

    /// Bind `queue` to `exchange` with a routing key pattern.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Topology`] if either side does not exist.
    fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerFuture<'_, ()>;

    /// Publish a persistent JSON message.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::PublishFailed`] if the broker does not confirm
    /// the message.
    fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> BrokerFuture<'_, ()>;

    /// Start a manual-ack consumer on `queue`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConsumeFailed`] if the queue does not exist or
    /// is exclusive to another connection.
    fn consume(&self, queue: &str) -> BrokerFuture<'_, DeliveryStream>;

    /// Close the channel, cancelling its consumers. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ChannelClosed`] if the close handshake fails.
    fn close(&self) -> BrokerFuture<'_, ()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU8, Ordering};

    struct Recorder(Arc<AtomicU8>);

    impl Acknowledger for Recorder {
        fn ack(&self) -> BrokerFuture<'_, ()> {
            self.0.store(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }

        fn reject(&self, requeue: bool) -> BrokerFuture<'_, ()> {
            self.0.store(if requeue { 2 } else { 3 }, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }
    }

    #[test]
    fn queue_shapes() {
        let durable = QueueSpec::durable("user-service_queue");
        assert_eq!(durable.name.as_deref(), Some("user-service_queue"));
        assert!(durable.durable && !durable.exclusive && !durable.auto_delete);

        let ephemeral = QueueSpec::ephemeral();
        assert!(ephemeral.name.is_none());
        assert!(!ephemeral.durable && ephemeral.exclusive && ephemeral.auto_delete);
    }

    #[tokio::test]
    async fn delivery_settles_through_acknowledger() {
        let state = Arc::new(AtomicU8::new(0));
        let delivery = Delivery::new("X", vec![], false, Box::new(Recorder(Arc::clone(&state))));
        assert!(delivery.reject(false).await.is_ok());
        assert_eq!(state.load(Ordering::SeqCst), 3);

        let delivery = Delivery::new("X", vec![], true, Box::new(Recorder(Arc::clone(&state))));
        assert!(format!("{delivery:?}").contains("redelivered: true"));
        assert!(delivery.ack().await.is_ok());
        assert_eq!(state.load(Ordering::SeqCst), 1);
    }
}
