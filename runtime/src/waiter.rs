//! Correlated reply waiting.
//!
//! Each wait gets its own subscription: a dedicated channel, an anonymous
//! exclusive auto-delete queue bound once per expected reply type, and a
//! consumer on that queue. Nothing is shared between concurrent waits, so two
//! in-flight requests can never receive each other's replies.
//!
//! ```text
//! subscribe(correlation_id, expected)
//!   open_channel ─► declare_queue(ephemeral) ─► bind × expected ─► consume
//!                                                                   │
//! wait(timeout)                                                     ▼
//!   ┌── matching type + correlation id ──► ack, return envelope
//!   ├── other correlation id ────────────► ack, drop, keep waiting
//!   ├── malformed body ──────────────────► ack, drop, keep waiting
//!   ├── deadline ────────────────────────► Timeout
//!   └── cancellation ────────────────────► Cancelled
//!   then: close the channel (cancels the consumer, deletes the queue)
//! ```
//!
//! The broker routes by event type only, so correlation filtering happens
//! here. Subscribing is split from waiting so a caller can bind its reply
//! queue *before* publishing the command; otherwise a fast worker could reply
//! before the queue exists and the reply would be lost.

use crate::error::RelayError;
use crate::link::BrokerLink;
use crate::metrics::{WaitMetrics, WaitOutcome};
use crate::publisher::Publisher;
use courier_core::broker::{Channel, Delivery, DeliveryStream, QueueSpec};
use courier_core::{CorrelationId, EnvelopeError, EventEnvelope};
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Opens per-request reply subscriptions on the shared exchange.
#[derive(Clone)]
pub struct ReplyWaiter {
    link: Arc<BrokerLink>,
    exchange: String,
}

impl ReplyWaiter {
    /// Create a waiter bound to `exchange`.
    #[must_use]
    pub fn new(link: Arc<BrokerLink>, exchange: impl Into<String>) -> Self {
        Self {
            link,
            exchange: exchange.into(),
        }
    }

    /// Bind a private queue to every expected reply type and start
    /// consuming it.
    ///
    /// Fails immediately, without waiting for any timeout, if the broker is
    /// unreachable or refuses the topology.
    ///
    /// # Errors
    ///
    /// Returns the link's connect errors or [`RelayError::Broker`].
    pub async fn subscribe<S>(
        &self,
        correlation_id: CorrelationId,
        expected: &[S],
    ) -> Result<ReplySubscription, RelayError>
    where
        S: AsRef<str>,
    {
        let expected: Vec<String> = expected.iter().map(|s| s.as_ref().to_string()).collect();
        let channel = self.link.open_channel().await?;

        match Self::prepare(&channel, &self.exchange, &expected).await {
            Ok((queue, deliveries)) => {
                tracing::debug!(
                    correlation_id = %correlation_id,
                    queue = %queue,
                    expected = ?expected,
                    "Reply subscription ready"
                );
                Ok(ReplySubscription {
                    correlation_id,
                    expected,
                    queue,
                    started: Instant::now(),
                    channel: Some(channel),
                    deliveries: Some(deliveries),
                    last_malformed: None,
                    saw_well_formed: false,
                })
            }
            Err(error) => {
                if let Err(close_error) = channel.close().await {
                    tracing::debug!(error = %close_error, "Closing failed subscription channel");
                }
                WaitMetrics::record(WaitOutcome::Error, Duration::ZERO);
                Err(error)
            }
        }
    }

    /// Subscribe and wait in one step.
    ///
    /// Only safe when the reply cannot be produced before this call binds its
    /// queue; request/reply callers should use [`Correlator`] instead.
    ///
    /// # Errors
    ///
    /// See [`subscribe`](Self::subscribe) and [`ReplySubscription::wait`].
    pub async fn wait_for_event<S>(
        &self,
        correlation_id: CorrelationId,
        timeout: Duration,
        expected: &[S],
    ) -> Result<EventEnvelope, RelayError>
    where
        S: AsRef<str>,
    {
        self.subscribe(correlation_id, expected)
            .await?
            .wait(timeout)
            .await
    }

    async fn prepare(
        channel: &Arc<dyn Channel>,
        exchange: &str,
        expected: &[String],
    ) -> Result<(String, DeliveryStream), RelayError> {
        channel.declare_exchange(exchange).await?;
        let queue = channel.declare_queue(&QueueSpec::ephemeral()).await?;
        for event_type in expected {
            channel.bind_queue(&queue, exchange, event_type).await?;
        }
        let deliveries = channel.consume(&queue).await?;
        Ok((queue, deliveries))
    }
}

/// A live, single-use reply subscription.
///
/// Consumed by [`wait`](Self::wait) or [`wait_or_cancel`](Self::wait_or_cancel),
/// which always tear the subscription down before returning. If it is dropped
/// without waiting (the owning request was abandoned), its channel is closed
/// on a background task.
pub struct ReplySubscription {
    correlation_id: CorrelationId,
    expected: Vec<String>,
    queue: String,
    started: Instant,
    channel: Option<Arc<dyn Channel>>,
    deliveries: Option<DeliveryStream>,
    last_malformed: Option<EnvelopeError>,
    saw_well_formed: bool,
}

impl ReplySubscription {
    /// The correlation id this subscription accepts.
    #[must_use]
    pub const fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// The broker-assigned name of the private queue.
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// The reply types this subscription is bound to.
    #[must_use]
    pub fn expected(&self) -> &[String] {
        &self.expected
    }

    /// Wait up to `timeout` for the matching reply.
    ///
    /// # Errors
    ///
    /// - [`RelayError::Timeout`] if no matching reply arrived in time
    /// - [`RelayError::Envelope`] if the deadline passed and only malformed
    ///   deliveries were received
    /// - [`RelayError::SubscriptionClosed`] if the broker ended the consumer
    /// - [`RelayError::Broker`] if the consumer failed
    pub async fn wait(self, timeout: Duration) -> Result<EventEnvelope, RelayError> {
        self.wait_or_cancel(timeout, &CancellationToken::new()).await
    }

    /// Like [`wait`](Self::wait), but also returns early with
    /// [`RelayError::Cancelled`] when `cancel` fires.
    ///
    /// # Errors
    ///
    /// See [`wait`](Self::wait).
    pub async fn wait_or_cancel(
        mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<EventEnvelope, RelayError> {
        let deadline = Instant::now() + timeout;

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            result = tokio::time::timeout_at(deadline, self.next_match()) => Some(result),
        };

        self.teardown().await;

        let (result, metric) = match outcome {
            None => (Err(RelayError::Cancelled), WaitOutcome::Cancelled),
            Some(Ok(Ok(envelope))) => (Ok(envelope), WaitOutcome::Matched),
            Some(Ok(Err(error))) => (Err(error), WaitOutcome::Error),
            Some(Err(_elapsed)) => match self.last_malformed.take() {
                Some(error) if !self.saw_well_formed => {
                    (Err(RelayError::Envelope(error)), WaitOutcome::Error)
                }
                _ => (
                    Err(RelayError::Timeout {
                        correlation_id: self.correlation_id.clone(),
                        expected: self.expected.clone(),
                        timeout,
                    }),
                    WaitOutcome::Timeout,
                ),
            },
        };

        WaitMetrics::record(metric, self.started.elapsed());
        match &result {
            Ok(envelope) => tracing::debug!(
                correlation_id = %self.correlation_id,
                event_type = %envelope.event_type,
                "Reply received"
            ),
            Err(error) => tracing::warn!(
                correlation_id = %self.correlation_id,
                expected = ?self.expected,
                error = %error,
                "Reply wait failed"
            ),
        }
        result
    }

    async fn next_match(&mut self) -> Result<EventEnvelope, RelayError> {
        let Some(deliveries) = self.deliveries.as_mut() else {
            return Err(RelayError::SubscriptionClosed);
        };

        while let Some(item) = deliveries.next().await {
            let delivery = item?;

            let envelope = match EventEnvelope::from_bytes(&delivery.body) {
                Ok(envelope) => envelope,
                Err(error) => {
                    tracing::warn!(
                        correlation_id = %self.correlation_id,
                        routing_key = %delivery.routing_key,
                        error = %error,
                        "Dropping malformed reply"
                    );
                    self.last_malformed = Some(error);
                    settle(delivery).await;
                    continue;
                }
            };
            self.saw_well_formed = true;

            if !self.expected.iter().any(|t| *t == envelope.event_type) {
                tracing::warn!(
                    correlation_id = %self.correlation_id,
                    event_type = %envelope.event_type,
                    "Dropping reply of unexpected type"
                );
                settle(delivery).await;
                continue;
            }

            if !envelope.is_correlated_with(&self.correlation_id) {
                tracing::debug!(
                    correlation_id = %self.correlation_id,
                    received = %envelope.correlation_id,
                    event_type = %envelope.event_type,
                    "Dropping reply for another request"
                );
                WaitMetrics::record_mismatch();
                settle(delivery).await;
                continue;
            }

            settle(delivery).await;
            return Ok(envelope);
        }

        Err(RelayError::SubscriptionClosed)
    }

    async fn teardown(&mut self) {
        self.deliveries = None;
        if let Some(channel) = self.channel.take() {
            if let Err(error) = channel.close().await {
                tracing::debug!(queue = %self.queue, error = %error, "Closing reply channel failed");
            }
        }
    }
}

impl Drop for ReplySubscription {
    fn drop(&mut self) {
        self.deliveries = None;
        let Some(channel) = self.channel.take() else {
            return;
        };

        tracing::debug!(
            correlation_id = %self.correlation_id,
            queue = %self.queue,
            "Reply subscription abandoned, closing its channel"
        );
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(error) = channel.close().await {
                    tracing::debug!(error = %error, "Closing abandoned reply channel failed");
                }
            });
        }
    }
}

/// Acknowledge a delivery this waiter has dealt with.
async fn settle(delivery: Delivery) {
    if let Err(error) = delivery.ack().await {
        tracing::warn!(error = %error, "Failed to acknowledge reply");
    }
}

/// Request/reply on top of a [`Publisher`] and a [`ReplyWaiter`].
///
/// # Example
///
/// ```rust,ignore
/// let reply = correlator
///     .request("UserLogin", &["UserLoginSuccess", "UserLoginFailed"], &login, timeout, &cancel)
///     .await?;
/// ```
#[derive(Clone)]
pub struct Correlator {
    publisher: Publisher,
    waiter: ReplyWaiter,
}

impl Correlator {
    /// Create a correlator from its two halves.
    #[must_use]
    pub const fn new(publisher: Publisher, waiter: ReplyWaiter) -> Self {
        Self { publisher, waiter }
    }

    /// Create a correlator publishing and waiting on the same exchange.
    #[must_use]
    pub fn on_exchange(link: Arc<BrokerLink>, exchange: impl Into<String>) -> Self {
        let exchange = exchange.into();
        Self {
            publisher: Publisher::new(Arc::clone(&link), exchange.clone()),
            waiter: ReplyWaiter::new(link, exchange),
        }
    }

    /// The publishing half.
    #[must_use]
    pub const fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    /// The waiting half.
    #[must_use]
    pub const fn waiter(&self) -> &ReplyWaiter {
        &self.waiter
    }

    /// Issue `command_type` under a fresh correlation id and wait for one of
    /// the `expected` replies.
    ///
    /// # Errors
    ///
    /// See [`request_correlated`](Self::request_correlated).
    pub async fn request<S, T>(
        &self,
        command_type: &str,
        expected: &[S],
        payload: &T,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<EventEnvelope, RelayError>
    where
        S: AsRef<str> + Sync,
        T: Serialize + ?Sized + Sync,
    {
        let correlation_id = self.publisher.next_correlation_id();
        self.request_correlated(correlation_id, command_type, expected, payload, timeout, cancel)
            .await
    }

    /// Issue `command_type` under `correlation_id` and wait for one of the
    /// `expected` replies.
    ///
    /// The reply queue is bound before the command is published.
    ///
    /// # Errors
    ///
    /// Returns publish errors without waiting, or any error of
    /// [`ReplySubscription::wait_or_cancel`].
    pub async fn request_correlated<S, T>(
        &self,
        correlation_id: CorrelationId,
        command_type: &str,
        expected: &[S],
        payload: &T,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<EventEnvelope, RelayError>
    where
        S: AsRef<str> + Sync,
        T: Serialize + ?Sized + Sync,
    {
        let subscription = self.waiter.subscribe(correlation_id.clone(), expected).await?;
        self.publisher
            .publish_correlated(command_type, &correlation_id, payload)
            .await?;
        subscription.wait_or_cancel(timeout, cancel).await
    }
}
