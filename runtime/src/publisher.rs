//! Publishing typed events to the shared topic exchange.

use crate::error::RelayError;
use crate::link::BrokerLink;
use crate::metrics::PublishMetrics;
use courier_core::environment::{Clock, CorrelationIdGenerator, SystemClock, UuidGenerator};
use courier_core::{CorrelationId, EventEnvelope};
use serde::Serialize;
use std::sync::Arc;

/// Serializes payloads into envelopes and publishes them through a
/// [`BrokerLink`], with the event type as routing key.
///
/// The exchange is declared (idempotently) before every publish, so no
/// component has to win a race to create it at startup.
#[derive(Clone)]
pub struct Publisher {
    link: Arc<BrokerLink>,
    exchange: String,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn CorrelationIdGenerator>,
}

impl Publisher {
    /// Create a publisher using the system clock and random UUID ids.
    #[must_use]
    pub fn new(link: Arc<BrokerLink>, exchange: impl Into<String>) -> Self {
        Self {
            link,
            exchange: exchange.into(),
            clock: Arc::new(SystemClock),
            ids: Arc::new(UuidGenerator),
        }
    }

    /// Replace the clock used for envelope timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the correlation id generator.
    #[must_use]
    pub fn with_id_generator(mut self, ids: Arc<dyn CorrelationIdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    /// The exchange this publisher targets.
    #[must_use]
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// The underlying link.
    #[must_use]
    pub const fn link(&self) -> &Arc<BrokerLink> {
        &self.link
    }

    /// Mint a fresh correlation id.
    #[must_use]
    pub fn next_correlation_id(&self) -> CorrelationId {
        self.ids.next_id()
    }

    /// Publish `payload` as `event_type` under a fresh correlation id.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Envelope`] if the payload cannot be serialized,
    /// or the link's connect/publish errors once retries are exhausted.
    pub async fn publish<T>(&self, event_type: &str, payload: &T) -> Result<EventEnvelope, RelayError>
    where
        T: Serialize + ?Sized + Sync,
    {
        let correlation_id = self.next_correlation_id();
        self.publish_correlated(event_type, &correlation_id, payload).await
    }

    /// Publish `payload` as `event_type` under an existing correlation id.
    ///
    /// # Errors
    ///
    /// Same as [`publish`](Self::publish).
    pub async fn publish_correlated<T>(
        &self,
        event_type: &str,
        correlation_id: &CorrelationId,
        payload: &T,
    ) -> Result<EventEnvelope, RelayError>
    where
        T: Serialize + ?Sized + Sync,
    {
        let envelope =
            EventEnvelope::with_payload(event_type, correlation_id.clone(), self.clock.now(), payload)?;
        self.publish_envelope(&envelope).await?;
        Ok(envelope)
    }

    /// Publish a prepared envelope.
    ///
    /// # Errors
    ///
    /// Same as [`publish`](Self::publish).
    pub async fn publish_envelope(&self, envelope: &EventEnvelope) -> Result<(), RelayError> {
        let body = envelope.to_bytes()?;

        self.link
            .channel()
            .await?
            .declare_exchange(&self.exchange)
            .await?;

        self.link
            .publish(&self.exchange, &envelope.event_type, &body)
            .await?;

        PublishMetrics::record_published(&envelope.event_type);
        tracing::debug!(
            exchange = %self.exchange,
            event_type = %envelope.event_type,
            correlation_id = %envelope.correlation_id,
            "Published event"
        );
        Ok(())
    }
}
