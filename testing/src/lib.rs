//! # Courier Testing
//!
//! Testing utilities for Courier services.
//!
//! This crate provides:
//! - [`InMemoryBroker`]: an in-process topic broker implementing the
//!   `courier-core` transport traits, with fault injection
//! - Mock implementations of the environment traits ([`FixedClock`],
//!   [`SequentialIdGenerator`])
//!
//! ## Example
//!
//! ```ignore
//! use courier_testing::InMemoryBroker;
//! use courier_runtime::{BrokerLink, Correlator};
//!
//! #[tokio::test]
//! async fn login_round_trip() {
//!     let broker = InMemoryBroker::new();
//!     let link = Arc::new(BrokerLink::new(Arc::new(broker.clone())));
//!     let correlator = Correlator::on_exchange(link, "events_exchange");
//!     // spawn a worker on the same broker, then correlator.request(...)
//! }
//! ```

use chrono::{DateTime, Utc};
use courier_core::environment::{Clock, CorrelationIdGenerator};
use courier_core::CorrelationId;

/// In-process broker
pub mod broker;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, CorrelationId, CorrelationIdGenerator, DateTime, Utc};
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making envelope timestamps reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use courier_testing::mocks::FixedClock;
    /// use courier_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::days(20_089))
    }

    /// Predictable correlation ids: `prefix-1`, `prefix-2`, ...
    #[derive(Debug)]
    pub struct SequentialIdGenerator {
        prefix: String,
        next: AtomicU64,
    }

    impl SequentialIdGenerator {
        /// Start a new sequence.
        #[must_use]
        pub fn new(prefix: impl Into<String>) -> Self {
            Self {
                prefix: prefix.into(),
                next: AtomicU64::new(1),
            }
        }
    }

    impl CorrelationIdGenerator for SequentialIdGenerator {
        fn next_id(&self) -> CorrelationId {
            let n = self.next.fetch_add(1, Ordering::SeqCst);
            CorrelationId::from(format!("{}-{n}", self.prefix))
        }
    }
}

// Re-export commonly used items
pub use broker::InMemoryBroker;
pub use mocks::{FixedClock, SequentialIdGenerator, test_clock};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_is_new_year_2025() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
        assert_eq!(clock.now().to_rfc3339(), "2025-01-01T00:00:00+00:00");
    }

    #[test]
    fn sequential_ids() {
        let ids = SequentialIdGenerator::new("req");
        assert_eq!(ids.next_id().as_str(), "req-1");
        assert_eq!(ids.next_id().as_str(), "req-2");
    }
}
