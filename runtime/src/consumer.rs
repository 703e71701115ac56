//! Long-lived command consumer with automatic resubscription.
//!
//! A [`BackgroundConsumer`] owns the durable queue of one worker role. It
//! binds the queue to every command type of the role's [`CommandSet`],
//! consumes with manual acknowledgement, and dispatches each decoded command
//! to a [`CommandHandler`].
//!
//! # Pattern: Subscribe-Process-Resubscribe Loop
//!
//! ```text
//! loop {
//!     subscribe (own channel, durable queue, bindings, consumer)
//!     process deliveries until the stream ends or shutdown fires
//!     close the channel
//!     wait retry_delay (or exit on shutdown)
//! }
//! ```
//!
//! # Delivery Policy
//!
//! | Delivery | Action |
//! |---|---|
//! | decodable command | handler, then ack |
//! | known type, bad payload | `on_undecodable`, then ack |
//! | type outside the set | warn, ack (dropped) |
//! | not an envelope | warn, reject without requeue |
//!
//! Acknowledging after the handler returns gives at-least-once delivery: a
//! crash between dispatch and ack redelivers the command, so handlers must
//! tolerate duplicates.

use crate::error::RelayError;
use crate::handler::CommandHandler;
use crate::link::BrokerLink;
use crate::metrics::ConsumerMetrics;
use crate::reply::ReplyTo;
use courier_core::broker::{Channel, Delivery, DeliveryStream, QueueSpec};
use courier_core::events::CommandSet;
use courier_core::{DEFAULT_EXCHANGE, EventEnvelope};
use futures::StreamExt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default pause before resubscribing after a failure.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Background consumer for the commands of one worker role.
///
/// # Lifecycle
///
/// 1. Created via [`builder()`](Self::builder)
/// 2. Spawned as background task via [`spawn()`](Self::spawn)
/// 3. Runs until the shutdown token is cancelled
pub struct BackgroundConsumer<C: CommandSet> {
    name: String,
    queue: String,
    exchange: String,
    link: Arc<BrokerLink>,
    handler: Arc<dyn CommandHandler<C>>,
    shutdown: CancellationToken,
    retry_delay: Duration,
    _commands: PhantomData<fn() -> C>,
}

impl<C: CommandSet> BackgroundConsumer<C> {
    /// Create a builder for configuring a consumer.
    #[must_use]
    pub fn builder() -> BackgroundConsumerBuilder<C> {
        BackgroundConsumerBuilder::default()
    }

    /// Spawn the consumer as a background task.
    ///
    /// The returned handle completes once the shutdown token is cancelled and
    /// the current delivery, if any, has been settled.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        info!(consumer = %self.name, queue = %self.queue, "Background consumer started");

        loop {
            let subscribed = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                result = self.subscribe() => result,
            };

            match subscribed {
                Ok((channel, mut deliveries)) => {
                    info!(
                        consumer = %self.name,
                        queue = %self.queue,
                        event_types = ?C::event_types(),
                        "Subscribed to command queue"
                    );

                    self.process(&mut deliveries).await;
                    drop(deliveries);
                    if let Err(error) = channel.close().await {
                        debug!(consumer = %self.name, error = %error, "Closing consumer channel failed");
                    }

                    if self.shutdown.is_cancelled() {
                        break;
                    }
                    warn!(
                        consumer = %self.name,
                        "Command stream ended, resubscribing in {:?}",
                        self.retry_delay
                    );
                }
                Err(error) => {
                    error!(
                        consumer = %self.name,
                        queue = %self.queue,
                        error = %error,
                        "Failed to subscribe, retrying in {:?}",
                        self.retry_delay
                    );
                }
            }

            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                () = tokio::time::sleep(self.retry_delay) => {}
            }
        }

        info!(consumer = %self.name, "Background consumer stopped");
    }

    async fn subscribe(&self) -> Result<(Arc<dyn Channel>, DeliveryStream), RelayError> {
        let channel = self.link.open_channel().await?;

        let prepared = async {
            channel.declare_exchange(&self.exchange).await?;
            let queue = channel
                .declare_queue(&QueueSpec::durable(self.queue.clone()))
                .await?;
            for event_type in C::event_types() {
                channel.bind_queue(&queue, &self.exchange, event_type).await?;
            }
            channel.consume(&queue).await
        }
        .await;

        match prepared {
            Ok(deliveries) => Ok((channel, deliveries)),
            Err(error) => {
                if let Err(close_error) = channel.close().await {
                    debug!(error = %close_error, "Closing consumer channel failed");
                }
                Err(error.into())
            }
        }
    }

    async fn process(&self, deliveries: &mut DeliveryStream) {
        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => {
                    info!(consumer = %self.name, "Shutdown requested during processing");
                    return;
                }
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => self.dispatch(delivery).await,
                    Some(Err(error)) => {
                        error!(consumer = %self.name, error = %error, "Error receiving delivery");
                        return;
                    }
                    None => return,
                },
            }
        }
    }

    async fn dispatch(&self, delivery: Delivery) {
        let envelope = match EventEnvelope::from_bytes(&delivery.body) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(
                    consumer = %self.name,
                    routing_key = %delivery.routing_key,
                    error = %error,
                    "Rejecting malformed delivery"
                );
                ConsumerMetrics::record("malformed");
                if let Err(error) = delivery.reject(false).await {
                    warn!(consumer = %self.name, error = %error, "Failed to reject delivery");
                }
                return;
            }
        };

        let Some(replies) = C::reply_types_for(&envelope.event_type) else {
            warn!(
                consumer = %self.name,
                event_type = %envelope.event_type,
                correlation_id = %envelope.correlation_id,
                "Dropping event of unexpected type"
            );
            ConsumerMetrics::record("unexpected");
            acknowledge(&self.name, delivery).await;
            return;
        };

        let reply_to = ReplyTo::for_command(&envelope, replies);
        let (result, outcome) = match C::decode(&envelope) {
            Ok(command) => {
                debug!(
                    consumer = %self.name,
                    event_type = %envelope.event_type,
                    correlation_id = %envelope.correlation_id,
                    redelivered = delivery.redelivered,
                    "Handling command"
                );
                (self.handler.handle(command, reply_to).await, "handled")
            }
            Err(error) => (
                self.handler.on_undecodable(&envelope, &error, reply_to).await,
                "undecodable",
            ),
        };

        if let Err(error) = result {
            error!(
                consumer = %self.name,
                event_type = %envelope.event_type,
                correlation_id = %envelope.correlation_id,
                error = %error,
                "Command handler failed"
            );
        }
        ConsumerMetrics::record(outcome);
        acknowledge(&self.name, delivery).await;
    }
}

async fn acknowledge(consumer: &str, delivery: Delivery) {
    if let Err(error) = delivery.ack().await {
        warn!(consumer, error = %error, "Failed to acknowledge delivery");
    }
}

/// Builder for configuring a [`BackgroundConsumer`].
pub struct BackgroundConsumerBuilder<C: CommandSet> {
    name: Option<String>,
    queue: Option<String>,
    exchange: Option<String>,
    link: Option<Arc<BrokerLink>>,
    handler: Option<Arc<dyn CommandHandler<C>>>,
    shutdown: Option<CancellationToken>,
    retry_delay: Option<Duration>,
}

impl<C: CommandSet> Default for BackgroundConsumerBuilder<C> {
    fn default() -> Self {
        Self {
            name: None,
            queue: None,
            exchange: None,
            link: None,
            handler: None,
            shutdown: None,
            retry_delay: None,
        }
    }
}

impl<C: CommandSet> BackgroundConsumerBuilder<C> {
    /// Set consumer name (defaults to the queue name).
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the durable queue to consume.
    #[must_use]
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Set the exchange to bind to (default: `events_exchange`).
    #[must_use]
    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    /// Set the broker link.
    #[must_use]
    pub fn link(mut self, link: Arc<BrokerLink>) -> Self {
        self.link = Some(link);
        self
    }

    /// Set the command handler.
    #[must_use]
    pub fn handler(mut self, handler: Arc<dyn CommandHandler<C>>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Set the shutdown token.
    #[must_use]
    pub fn shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Set the pause before resubscribing (default: 5 seconds).
    #[must_use]
    pub const fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    /// Build the consumer.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Configuration`] if the queue, link, handler or
    /// shutdown token is missing.
    pub fn build(self) -> Result<BackgroundConsumer<C>, RelayError> {
        let queue = self
            .queue
            .ok_or_else(|| RelayError::Configuration("consumer queue is required".to_string()))?;
        let link = self
            .link
            .ok_or_else(|| RelayError::Configuration("consumer link is required".to_string()))?;
        let handler = self
            .handler
            .ok_or_else(|| RelayError::Configuration("consumer handler is required".to_string()))?;
        let shutdown = self.shutdown.ok_or_else(|| {
            RelayError::Configuration("consumer shutdown token is required".to_string())
        })?;

        Ok(BackgroundConsumer {
            name: self.name.unwrap_or_else(|| queue.clone()),
            queue,
            exchange: self.exchange.unwrap_or_else(|| DEFAULT_EXCHANGE.to_string()),
            link,
            handler,
            shutdown,
            retry_delay: self.retry_delay.unwrap_or(DEFAULT_RETRY_DELAY),
            _commands: PhantomData,
        })
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::handler::HandlerError;
    use async_trait::async_trait;
    use courier_core::user::{UserCommand, USER_SERVICE_QUEUE};
    use courier_core::CorrelationId;
    use courier_testing::InMemoryBroker;
    use serde_json::json;
    use tokio::sync::mpsc;

    const EXCHANGE: &str = "events_exchange";

    enum Seen {
        Command(UserCommand, CorrelationId),
        Undecodable(String),
    }

    struct Recorder(mpsc::UnboundedSender<Seen>);

    #[async_trait]
    impl CommandHandler<UserCommand> for Recorder {
        async fn handle(&self, command: UserCommand, reply_to: ReplyTo) -> Result<(), HandlerError> {
            let _ = self.0.send(Seen::Command(command, reply_to.correlation_id().clone()));
            Ok(())
        }

        async fn on_undecodable(
            &self,
            envelope: &EventEnvelope,
            _error: &courier_core::EnvelopeError,
            _reply_to: ReplyTo,
        ) -> Result<(), HandlerError> {
            let _ = self.0.send(Seen::Undecodable(envelope.event_type.clone()));
            Err("handler errors are logged, not fatal".into())
        }
    }

    struct Harness {
        broker: InMemoryBroker,
        shutdown: CancellationToken,
        task: JoinHandle<()>,
        seen: mpsc::UnboundedReceiver<Seen>,
    }

    async fn start() -> Harness {
        let broker = InMemoryBroker::new();
        let link = Arc::new(BrokerLink::new(Arc::new(broker.clone())));
        let shutdown = CancellationToken::new();
        let (tx, seen) = mpsc::unbounded_channel();

        let task = BackgroundConsumer::<UserCommand>::builder()
            .name("user-service")
            .queue(USER_SERVICE_QUEUE)
            .exchange(EXCHANGE)
            .link(link)
            .handler(Arc::new(Recorder(tx)))
            .shutdown(shutdown.clone())
            .retry_delay(Duration::from_millis(100))
            .build()
            .expect("complete builder")
            .spawn();

        broker.wait_for_consumers(USER_SERVICE_QUEUE, 1).await;
        Harness {
            broker,
            shutdown,
            task,
            seen,
        }
    }

    fn command(event_type: &str, id: &str, payload: serde_json::Value) -> Vec<u8> {
        EventEnvelope::new(event_type, CorrelationId::from(id), courier_core::Utc::now(), payload)
            .to_bytes()
            .expect("serializes")
    }

    #[tokio::test]
    async fn dispatches_commands_and_acks_after_handler() {
        let mut h = start().await;

        h.broker
            .inject(EXCHANGE, "GetProfile", command("GetProfile", "abc-1", json!({ "id": "u-1" })))
            .expect("inject");

        let Some(Seen::Command(UserCommand::GetProfile(query), correlation_id)) = h.seen.recv().await
        else {
            unreachable!("expected a decoded GetProfile");
        };
        assert_eq!(query.id, "u-1");
        assert_eq!(correlation_id.as_str(), "abc-1");

        h.shutdown.cancel();
        h.task.await.expect("consumer stops");
        assert_eq!(h.broker.message_count(USER_SERVICE_QUEUE), 0);
        assert_eq!(h.broker.unacked_count(USER_SERVICE_QUEUE), 0);
    }

    #[tokio::test]
    async fn bad_payload_goes_to_on_undecodable_and_is_acked() {
        let mut h = start().await;

        h.broker
            .inject(EXCHANGE, "UserLogin", command("UserLogin", "abc-2", json!({ "nope": 1 })))
            .expect("inject");

        assert!(matches!(h.seen.recv().await, Some(Seen::Undecodable(t)) if t == "UserLogin"));

        h.shutdown.cancel();
        h.task.await.expect("consumer stops");
        assert_eq!(h.broker.unacked_count(USER_SERVICE_QUEUE), 0);
        assert_eq!(h.broker.message_count(USER_SERVICE_QUEUE), 0);
    }

    #[tokio::test]
    async fn malformed_delivery_is_rejected_without_requeue() {
        let mut h = start().await;

        h.broker
            .inject(EXCHANGE, "UserLogin", b"not an envelope".to_vec())
            .expect("inject");
        h.broker
            .inject(EXCHANGE, "GetProfile", command("GetProfile", "abc-3", json!({ "id": "u-3" })))
            .expect("inject");

        // The valid command behind the malformed one still gets through.
        assert!(matches!(h.seen.recv().await, Some(Seen::Command(UserCommand::GetProfile(_), _))));

        h.shutdown.cancel();
        h.task.await.expect("consumer stops");
        assert_eq!(h.broker.message_count(USER_SERVICE_QUEUE), 0);
        assert_eq!(h.broker.unacked_count(USER_SERVICE_QUEUE), 0);
    }

    #[tokio::test]
    async fn unexpected_type_is_acked_and_dropped() {
        let mut h = start().await;

        // Route a stray type into the worker queue by hand.
        h.broker
            .bind(USER_SERVICE_QUEUE, EXCHANGE, "UserDeleted")
            .expect("bind");
        h.broker
            .inject(EXCHANGE, "UserDeleted", command("UserDeleted", "abc-4", json!({})))
            .expect("inject");
        h.broker
            .inject(EXCHANGE, "GetProfile", command("GetProfile", "abc-5", json!({ "id": "u-5" })))
            .expect("inject");

        let Some(Seen::Command(_, correlation_id)) = h.seen.recv().await else {
            unreachable!("expected the GetProfile command");
        };
        assert_eq!(correlation_id.as_str(), "abc-5");

        h.shutdown.cancel();
        h.task.await.expect("consumer stops");
        assert_eq!(h.broker.message_count(USER_SERVICE_QUEUE), 0);
    }

    #[tokio::test]
    async fn resubscribes_after_connection_loss() {
        let mut h = start().await;

        h.broker.sever_connections();
        h.broker.wait_for_consumers(USER_SERVICE_QUEUE, 1).await;

        h.broker
            .inject(EXCHANGE, "GetProfile", command("GetProfile", "abc-6", json!({ "id": "u-6" })))
            .expect("inject");
        assert!(matches!(h.seen.recv().await, Some(Seen::Command(..))));
        assert!(h.broker.connect_attempts() >= 2);

        h.shutdown.cancel();
        h.task.await.expect("consumer stops");
    }

    #[tokio::test]
    async fn shutdown_stops_the_consumer_and_releases_the_queue() {
        let h = start().await;

        h.shutdown.cancel();
        h.task.await.expect("consumer stops");

        assert_eq!(h.broker.consumer_count(USER_SERVICE_QUEUE), 0);
        // Durable queues outlive their consumers.
        assert!(h.broker.queue_exists(USER_SERVICE_QUEUE));
    }

    #[test]
    fn builder_requires_a_queue() {
        let result = BackgroundConsumer::<UserCommand>::builder()
            .shutdown(CancellationToken::new())
            .build();
        assert!(matches!(result, Err(RelayError::Configuration(_))));
    }
}
