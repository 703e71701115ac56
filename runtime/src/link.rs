//! Resilient, shared connection to the broker.
//!
//! A [`BrokerLink`] owns one connection plus one shared channel. Every public
//! operation goes through an internal async mutex, and the mutex is held for
//! the whole duration of a reconnect, so when many callers notice a dead
//! connection at once only the first one repairs it and the rest observe the
//! repaired state.
//!
//! [`publish`](BrokerLink::publish) holds the mutex only while fetching the
//! channel; the publish and its confirm run outside it. Channels are
//! `Send + Sync` and accept concurrent publishes (lapin serializes frames per
//! channel internally), so connection state changes stay serialized while
//! concurrent publishers do not queue behind each other's confirms.
//!
//! # States
//!
//! ```text
//!               connect() ok
//! Disconnected ─────────────► Connected
//!      ▲                          │
//!      └──── closure detected ────┘   (repaired lazily on next use)
//!
//! any state ──close()──► Closed       (terminal)
//! ```
//!
//! Connecting is retried under the connect [`RetryPolicy`]; publishing is
//! retried under the publish policy, reconnecting between attempts when the
//! failure took the channel down with it.

use crate::error::RelayError;
use crate::metrics::{LinkMetrics, PublishMetrics};
use crate::retry::{RetryPolicy, retry_with_backoff, retry_with_predicate};
use courier_core::broker::{Channel, Connection, Connector};
use std::sync::Arc;
use tokio::sync::Mutex;

enum LinkState {
    Disconnected,
    Connected {
        connection: Arc<dyn Connection>,
        channel: Arc<dyn Channel>,
    },
    Closed,
}

/// Owned handle to the broker, shared by reference between publishers,
/// waiters and consumers.
///
/// # Example
///
/// ```rust,ignore
/// let link = Arc::new(
///     BrokerLink::new(Arc::new(AmqpConnector::new(uri)))
///         .with_connect_policy(RetryPolicy::connect_default())
///         .with_publish_policy(RetryPolicy::publish_default()),
/// );
/// link.connect().await?;
/// ```
pub struct BrokerLink {
    connector: Arc<dyn Connector>,
    connect_policy: RetryPolicy,
    publish_policy: RetryPolicy,
    state: Mutex<LinkState>,
}

impl BrokerLink {
    /// Create a disconnected link with the default retry policies.
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            connect_policy: RetryPolicy::connect_default(),
            publish_policy: RetryPolicy::publish_default(),
            state: Mutex::new(LinkState::Disconnected),
        }
    }

    /// Set the retry policy for establishing connections.
    #[must_use]
    pub fn with_connect_policy(mut self, policy: RetryPolicy) -> Self {
        self.connect_policy = policy;
        self
    }

    /// Set the retry policy for publishing.
    #[must_use]
    pub fn with_publish_policy(mut self, policy: RetryPolicy) -> Self {
        self.publish_policy = policy;
        self
    }

    /// Endpoint description for logs.
    #[must_use]
    pub fn endpoint(&self) -> String {
        self.connector.describe()
    }

    /// Establish the connection and shared channel if they are not live.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::ConnectExhausted`] once every attempt failed, or
    /// [`RelayError::LinkClosed`] after [`close`](Self::close).
    pub async fn connect(&self) -> Result<(), RelayError> {
        let mut state = self.state.lock().await;
        self.ensure_connected(&mut state).await.map(|_| ())
    }

    /// The live shared channel, reconnecting first if needed.
    ///
    /// # Errors
    ///
    /// Same as [`connect`](Self::connect).
    pub async fn channel(&self) -> Result<Arc<dyn Channel>, RelayError> {
        let mut state = self.state.lock().await;
        let (_, channel) = self.ensure_connected(&mut state).await?;
        Ok(channel)
    }

    /// The live connection, reconnecting first if needed.
    ///
    /// # Errors
    ///
    /// Same as [`connect`](Self::connect).
    pub async fn connection(&self) -> Result<Arc<dyn Connection>, RelayError> {
        let mut state = self.state.lock().await;
        let (connection, _) = self.ensure_connected(&mut state).await?;
        Ok(connection)
    }

    /// Open a dedicated channel on the live connection.
    ///
    /// Waiters and consumers use their own channel so that closing it
    /// cancels exactly their consumer.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Broker`] if the channel cannot be opened, or any
    /// error of [`connect`](Self::connect).
    pub async fn open_channel(&self) -> Result<Arc<dyn Channel>, RelayError> {
        let connection = self.connection().await?;
        Ok(connection.create_channel().await?)
    }

    /// Returns `true` if the link currently holds a live connection.
    pub async fn is_connected(&self) -> bool {
        matches!(
            &*self.state.lock().await,
            LinkState::Connected { connection, .. } if connection.is_open()
        )
    }

    /// Publish a message on the shared channel, retrying under the publish
    /// policy.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::PublishExhausted`] once every attempt failed,
    /// or a connect error if the broker cannot be reached at all.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), RelayError> {
        let mut attempt: u32 = 0;

        let result = retry_with_predicate(
            &self.publish_policy,
            || {
                attempt += 1;
                if attempt > 1 {
                    PublishMetrics::record_retry();
                }
                async move {
                    let channel = self.channel().await?;
                    channel.publish(exchange, routing_key, body).await?;
                    Ok::<(), RelayError>(())
                }
            },
            RelayError::is_retryable,
        )
        .await;

        result.map_err(|err| match err {
            RelayError::Broker(source) => {
                tracing::error!(
                    exchange,
                    routing_key,
                    attempts = self.publish_policy.attempts(),
                    error = %source,
                    "Publish failed after all attempts"
                );
                RelayError::PublishExhausted {
                    routing_key: routing_key.to_string(),
                    attempts: self.publish_policy.attempts(),
                    reason: source.to_string(),
                }
            }
            other => other,
        })
    }

    /// Close the channel and connection. The link is terminal afterwards.
    ///
    /// Idempotent, and safe to call on a link that never connected.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        let previous = std::mem::replace(&mut *state, LinkState::Closed);

        if let LinkState::Connected {
            connection,
            channel,
        } = previous
        {
            if let Err(error) = channel.close().await {
                tracing::debug!(error = %error, "Channel close failed during shutdown");
            }
            if let Err(error) = connection.close().await {
                tracing::warn!(error = %error, "Connection close failed during shutdown");
            }
            tracing::info!(endpoint = %self.connector.describe(), "Broker link closed");
        }
    }

    async fn ensure_connected(
        &self,
        state: &mut LinkState,
    ) -> Result<(Arc<dyn Connection>, Arc<dyn Channel>), RelayError> {
        let existing = match &*state {
            LinkState::Closed => return Err(RelayError::LinkClosed),
            LinkState::Connected {
                connection,
                channel,
            } => Some((Arc::clone(connection), Arc::clone(channel))),
            LinkState::Disconnected => None,
        };

        if let Some((connection, channel)) = existing {
            if connection.is_open() && channel.is_open() {
                return Ok((connection, channel));
            }

            if connection.is_open() {
                match connection.create_channel().await {
                    Ok(channel) => {
                        tracing::info!("Reopened broker channel");
                        *state = LinkState::Connected {
                            connection: Arc::clone(&connection),
                            channel: Arc::clone(&channel),
                        };
                        return Ok((connection, channel));
                    }
                    Err(error) => {
                        tracing::warn!(error = %error, "Failed to reopen channel, reconnecting");
                    }
                }
            } else {
                tracing::warn!(endpoint = %self.connector.describe(), "Broker connection lost, reconnecting");
            }

            if let Err(error) = connection.close().await {
                tracing::debug!(error = %error, "Closing stale connection failed");
            }
            *state = LinkState::Disconnected;
        }

        let (connection, channel) = self.dial().await?;
        *state = LinkState::Connected {
            connection: Arc::clone(&connection),
            channel: Arc::clone(&channel),
        };
        Ok((connection, channel))
    }

    async fn dial(&self) -> Result<(Arc<dyn Connection>, Arc<dyn Channel>), RelayError> {
        let endpoint = self.connector.describe();
        tracing::info!(endpoint = %endpoint, "Connecting to broker");

        let result = retry_with_backoff(&self.connect_policy, || async move {
            let attempt = async {
                let connection = self.connector.connect().await?;
                let channel = connection.create_channel().await?;
                Ok::<_, courier_core::BrokerError>((connection, channel))
            }
            .await;
            LinkMetrics::record_connect_attempt(attempt.is_ok());
            attempt
        })
        .await;

        match result {
            Ok(pair) => {
                tracing::info!(endpoint = %endpoint, "Connected to broker");
                Ok(pair)
            }
            Err(error) => {
                tracing::error!(
                    endpoint = %endpoint,
                    attempts = self.connect_policy.attempts(),
                    error = %error,
                    "Giving up connecting to broker"
                );
                Err(RelayError::ConnectExhausted {
                    attempts: self.connect_policy.attempts(),
                    reason: error.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use courier_testing::InMemoryBroker;
    use std::time::Duration;
    use tokio::time::Instant;

    fn link(broker: &InMemoryBroker) -> BrokerLink {
        BrokerLink::new(Arc::new(broker.clone()))
    }

    #[tokio::test(start_paused = true)]
    async fn connect_succeeds_on_third_attempt_after_two_backoffs() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(2);
        let link = link(&broker);
        let started = Instant::now();

        link.connect().await.expect("third attempt should succeed");

        assert_eq!(broker.connect_attempts(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(4));
        assert!(link.is_connected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_gives_up_after_three_failures() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(3);
        let link = link(&broker);

        let err = link.connect().await.expect_err("all attempts fail");

        assert!(matches!(err, RelayError::ConnectExhausted { attempts: 3, .. }));
        assert!(!err.is_retryable());
        assert_eq!(broker.connect_attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_succeeds_after_two_retries() {
        let broker = InMemoryBroker::new();
        let link = link(&broker);
        link.connect().await.expect("connect");
        link.channel()
            .await
            .expect("channel")
            .declare_exchange("events_exchange")
            .await
            .expect("declare");

        broker.fail_next_publishes(2);
        let started = Instant::now();

        link.publish("events_exchange", "UserLogin", b"{}")
            .await
            .expect("third attempt should succeed");

        assert_eq!(broker.publish_attempts(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn publish_gives_up_after_three_failures() {
        let broker = InMemoryBroker::new();
        let link = link(&broker);
        link.connect().await.expect("connect");

        broker.fail_next_publishes(3);
        let err = link
            .publish("events_exchange", "UserLogin", b"{}")
            .await
            .expect_err("all attempts fail");

        assert!(matches!(
            err,
            RelayError::PublishExhausted { ref routing_key, attempts: 3, .. } if routing_key == "UserLogin"
        ));
    }

    #[tokio::test]
    async fn severed_connection_is_repaired_lazily() {
        let broker = InMemoryBroker::new();
        let link = link(&broker);
        link.connect().await.expect("connect");
        assert_eq!(broker.connect_attempts(), 1);

        broker.sever_connections();
        assert!(!link.is_connected().await);

        let channel = link.channel().await.expect("reconnects");
        assert!(channel.is_open());
        assert_eq!(broker.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_reconnect() {
        let broker = InMemoryBroker::new();
        let link = Arc::new(link(&broker));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let link = Arc::clone(&link);
                tokio::spawn(async move { link.channel().await.map(|_| ()) })
            })
            .collect();
        for task in tasks {
            task.await.expect("join").expect("channel");
        }

        assert_eq!(broker.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn concurrent_publishes_share_the_channel() {
        let broker = InMemoryBroker::new();
        let link = Arc::new(link(&broker));
        link.channel()
            .await
            .expect("channel")
            .declare_exchange("events_exchange")
            .await
            .expect("exchange");
        let queue = courier_core::QueueSpec::durable("audit");
        let channel = link.open_channel().await.expect("channel");
        channel.declare_queue(&queue).await.expect("queue");
        channel
            .bind_queue("audit", "events_exchange", "#")
            .await
            .expect("bind");

        let tasks: Vec<_> = (0..16)
            .map(|n| {
                let link = Arc::clone(&link);
                tokio::spawn(async move {
                    link.publish("events_exchange", &format!("Event{n}"), b"{}").await
                })
            })
            .collect();
        for task in tasks {
            task.await.expect("join").expect("publish");
        }

        assert_eq!(broker.message_count("audit"), 16);
        assert_eq!(broker.publish_attempts(), 16);
        assert_eq!(broker.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn close_is_terminal_and_idempotent() {
        let never_connected = link(&InMemoryBroker::new());
        never_connected.close().await;
        never_connected.close().await;

        let broker = InMemoryBroker::new();
        let link = link(&broker);
        link.connect().await.expect("connect");
        link.close().await;

        assert!(matches!(link.channel().await, Err(RelayError::LinkClosed)));
        assert!(matches!(
            link.publish("events_exchange", "X", b"{}").await,
            Err(RelayError::LinkClosed)
        ));
        assert_eq!(broker.connect_attempts(), 1);
    }
}
