//! # Courier Runtime
//!
//! The I/O half of Courier: everything that talks to the broker through the
//! transport traits of `courier-core`.
//!
//! ## Core Components
//!
//! - **[`BrokerLink`]**: lazily connected, self-repairing connection and
//!   shared channel with bounded connect and publish retries
//! - **[`Publisher`]**: wraps payloads in envelopes and publishes them routed
//!   by event type
//! - **[`ReplyWaiter`]** / **[`ReplySubscription`]**: per-request private
//!   reply queues with correlation filtering, deadline and cancellation
//! - **[`Correlator`]**: subscribe, publish, wait
//! - **[`BackgroundConsumer`]**: worker-side subscribe/process/resubscribe
//!   loop dispatching to a [`CommandHandler`]
//! - **[`ReplyHandler`]** / **[`ReplyTo`]**: exactly one reply per command
//!
//! ## Example
//!
//! ```ignore
//! use courier_runtime::{BrokerLink, Correlator};
//!
//! let link = Arc::new(BrokerLink::new(connector));
//! let correlator = Correlator::on_exchange(link, "events_exchange");
//!
//! let reply = correlator
//!     .request("GetProfile", &expected, &query, Duration::from_secs(10), &cancel)
//!     .await?;
//! ```

/// Environment configuration
pub mod config;

/// Background command consumer
pub mod consumer;

/// Error types for broker operations
pub mod error;

/// Command handler trait
pub mod handler;

/// Broker connection management
pub mod link;

/// Prometheus metrics for observability
pub mod metrics;

/// Envelope publishing
pub mod publisher;

/// Worker-side replies
pub mod reply;

/// Retry logic with fixed or exponential backoff
pub mod retry;

/// Process signal handling
pub mod shutdown;

/// Tracing subscriber setup
pub mod telemetry;

/// Correlated reply waiting
pub mod waiter;

pub use config::{ConfigError, RelayConfig, load_dotenv};
pub use consumer::{BackgroundConsumer, BackgroundConsumerBuilder};
pub use error::RelayError;
pub use handler::{CommandHandler, HandlerError};
pub use link::BrokerLink;
pub use metrics::MetricsExporter;
pub use publisher::Publisher;
pub use reply::{ReplyHandler, ReplyTo};
pub use retry::RetryPolicy;
pub use shutdown::shutdown_signal;
pub use telemetry::init_tracing;
pub use waiter::{Correlator, ReplySubscription, ReplyWaiter};
