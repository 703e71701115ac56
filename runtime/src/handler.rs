//! Command handler trait for background consumers.
//!
//! A [`CommandHandler`] receives commands already decoded into the worker's
//! closed [`CommandSet`], together with the single [`ReplyTo`] token for that
//! command. The consumer acknowledges the delivery once the handler returns,
//! whether it succeeded or not: replying (including failure replies) is the
//! handler's job.
//!
//! # Example
//!
//! ```rust,ignore
//! use async_trait::async_trait;
//!
//! struct UserHandler { replies: ReplyHandler }
//!
//! #[async_trait]
//! impl CommandHandler<UserCommand> for UserHandler {
//!     async fn handle(&self, command: UserCommand, reply_to: ReplyTo) -> Result<(), HandlerError> {
//!         let outcome = self.apply(command).await;
//!         self.replies.send(reply_to, outcome).await?;
//!         Ok(())
//!     }
//! }
//! ```

use crate::reply::ReplyTo;
use async_trait::async_trait;
use courier_core::events::CommandSet;
use courier_core::{EnvelopeError, EventEnvelope};

/// Error type returned by handlers; logged by the consumer, never propagated.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Processes the commands of one worker role.
///
/// # Thread Safety
///
/// Handlers are shared with the consumer task, so they must be
/// `Send + Sync + 'static`.
#[async_trait]
pub trait CommandHandler<C: CommandSet>: Send + Sync + 'static {
    /// Handle a decoded command and publish its reply through `reply_to`.
    ///
    /// # Errors
    ///
    /// Any error is logged by the consumer; the delivery is still
    /// acknowledged.
    async fn handle(&self, command: C, reply_to: ReplyTo) -> Result<(), HandlerError>;

    /// Called when a command of a known type carries a payload that does not
    /// match its schema.
    ///
    /// The default implementation only logs; workers that want the requester
    /// to get a failure reply instead of a timeout override it.
    ///
    /// # Errors
    ///
    /// Any error is logged by the consumer.
    async fn on_undecodable(
        &self,
        envelope: &EventEnvelope,
        error: &EnvelopeError,
        reply_to: ReplyTo,
    ) -> Result<(), HandlerError> {
        tracing::warn!(
            event_type = %envelope.event_type,
            correlation_id = %reply_to.correlation_id(),
            error = %error,
            "Dropping undecodable command"
        );
        Ok(())
    }
}
