//! User worker.
//!
//! Consumes `UserRegistered`, `UserLogin`, `GetProfile` and `UserOauth`
//! commands from `user-service_queue`, applies them to an in-memory
//! [`UserDirectory`], and answers each with exactly one success or failure
//! reply carrying the command's correlation id.

pub mod directory;
pub mod handler;

pub use directory::{DirectoryError, UserDirectory};
pub use handler::{INVALID_REQUEST_FORMAT, UserCommandHandler, UserReply};

use courier_core::user::{USER_SERVICE_QUEUE, UserCommand};
use courier_runtime::{BackgroundConsumer, BrokerLink, Publisher, RelayError, ReplyHandler};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default `RUST_LOG` filter for the worker binary.
pub const DEFAULT_LOG_FILTER: &str = "user_service=info,courier_runtime=info";

/// Start the user command consumer on `link`.
///
/// Replies are published on the same exchange the commands arrive on. The
/// returned task finishes after `shutdown` is cancelled.
///
/// # Errors
///
/// Returns [`RelayError::Configuration`] if the consumer cannot be built.
pub fn spawn_worker(
    link: Arc<BrokerLink>,
    exchange: &str,
    directory: Arc<UserDirectory>,
    retry_delay: Duration,
    shutdown: CancellationToken,
) -> Result<JoinHandle<()>, RelayError> {
    let replies = ReplyHandler::new(Publisher::new(Arc::clone(&link), exchange));
    let handler = Arc::new(UserCommandHandler::new(directory, replies));

    let consumer = BackgroundConsumer::<UserCommand>::builder()
        .name("user-service")
        .queue(USER_SERVICE_QUEUE)
        .exchange(exchange)
        .link(link)
        .handler(handler)
        .shutdown(shutdown)
        .retry_delay(retry_delay)
        .build()?;

    Ok(consumer.spawn())
}
