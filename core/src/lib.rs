//! # Courier Core
//!
//! Core types and traits for the Courier request/reply bridge.
//!
//! Courier lets a synchronous edge service obtain results from asynchronous
//! worker services, with a message broker as the only channel between them.
//! This crate holds everything that does not perform I/O:
//!
//! - [`envelope`]: the JSON wire format correlating an event type, a
//!   correlation identifier, a timestamp and a payload
//! - [`correlation`]: the opaque, coordination-free correlation identifier
//! - [`events`]: closed command sets and reply outcomes per worker role
//! - [`user`]: the user-service protocol (commands, replies, payloads)
//! - [`broker`]: the object-safe transport seam implemented by
//!   `courier-amqp` (production) and `courier-testing` (in-memory)
//! - [`environment`]: injected clock and identifier generator
//!
//! ## Flow
//!
//! ```text
//! edge: CorrelationId::new()
//!        │
//!        ▼
//! Command{type, correlation_id, payload} ──► topic exchange ──► worker queue
//!                                                                   │
//! edge waiter (private queue) ◄── topic exchange ◄── Success/Failure{correlation_id}
//! ```

pub mod broker;
pub mod correlation;
pub mod envelope;
pub mod events;
pub mod user;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use broker::{BrokerError, Channel, Connection, Connector, Delivery, DeliveryStream, QueueSpec};
pub use correlation::CorrelationId;
pub use envelope::{EnvelopeError, EventEnvelope};
pub use events::{CommandSet, ReplyOutcome, ReplyTypes};

/// Name of the shared topic exchange every Courier service publishes to.
pub const DEFAULT_EXCHANGE: &str = "events_exchange";

/// Environment module - Dependency injection traits
///
/// All sources of non-determinism used by the bridge (wall-clock time and
/// identifier generation) are abstracted here so that tests can pin them.
pub mod environment {
    use crate::correlation::CorrelationId;
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use courier_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let before = clock.now();
    /// assert!(clock.now() >= before);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }

    /// Source of fresh correlation identifiers.
    ///
    /// Implementations must never hand out the same identifier twice within
    /// the lifetime of the process and its peers.
    pub trait CorrelationIdGenerator: Send + Sync {
        /// Mint a new identifier.
        fn next_id(&self) -> CorrelationId;
    }

    /// Generator backed by random UUID v4 values.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct UuidGenerator;

    impl CorrelationIdGenerator for UuidGenerator {
        fn next_id(&self) -> CorrelationId {
            CorrelationId::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::environment::{CorrelationIdGenerator, UuidGenerator};

    #[test]
    fn uuid_generator_never_repeats() {
        let generator = UuidGenerator;
        let first = generator.next_id();
        let second = generator.next_id();
        assert_ne!(first, second);
    }
}
