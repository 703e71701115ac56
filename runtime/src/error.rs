//! Errors surfaced by the request/reply bridge.

use courier_core::CorrelationId;
use courier_core::broker::BrokerError;
use courier_core::envelope::EnvelopeError;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by the broker link, publisher, waiter and consumer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Every connection attempt failed.
    #[error("Broker unreachable after {attempts} attempts: {reason}")]
    ConnectExhausted {
        /// Number of attempts made
        attempts: u32,
        /// Error of the final attempt
        reason: String,
    },

    /// Every publish attempt failed.
    #[error("Publish of '{routing_key}' failed after {attempts} attempts: {reason}")]
    PublishExhausted {
        /// Routing key (event type) of the message
        routing_key: String,
        /// Number of attempts made
        attempts: u32,
        /// Error of the final attempt
        reason: String,
    },

    /// A single broker operation failed.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// An envelope could not be encoded or decoded.
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    /// No matching reply arrived before the deadline.
    #[error("No reply of {expected:?} for correlation id {correlation_id} within {timeout:?}")]
    Timeout {
        /// The request being waited on
        correlation_id: CorrelationId,
        /// Reply types the waiter accepted
        expected: Vec<String>,
        /// The deadline that elapsed
        timeout: Duration,
    },

    /// The wait was cancelled before a reply arrived.
    #[error("Wait cancelled")]
    Cancelled,

    /// The reply subscription ended before a matching reply arrived.
    #[error("Reply subscription closed by the broker")]
    SubscriptionClosed,

    /// The broker link has been closed and will not reconnect.
    #[error("Broker link is closed")]
    LinkClosed,

    /// A component was built without a required setting.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl RelayError {
    /// Returns `true` if this error is a reply timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns `true` if repeating the failed operation may succeed.
    ///
    /// Only single broker failures qualify. Exhausted retries, a closed link
    /// and protocol errors are final.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Broker(_) | Self::SubscriptionClosed)
    }
}
