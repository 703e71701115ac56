//! Worker-side replies.
//!
//! Every inbound command yields exactly one [`ReplyTo`] token. Sending a
//! reply consumes the token, so a handler cannot publish both a success and a
//! failure (or two successes) for the same command.

use crate::error::RelayError;
use crate::publisher::Publisher;
use courier_core::events::{ReplyOutcome, ReplyTypes};
use courier_core::{CorrelationId, EventEnvelope};
use serde::Serialize;

/// Where and how to answer one command.
///
/// Deliberately neither `Clone` nor `Copy`.
#[derive(Debug, PartialEq, Eq)]
pub struct ReplyTo {
    correlation_id: CorrelationId,
    replies: ReplyTypes,
}

impl ReplyTo {
    /// Create the reply token for a command.
    #[must_use]
    pub const fn new(correlation_id: CorrelationId, replies: ReplyTypes) -> Self {
        Self {
            correlation_id,
            replies,
        }
    }

    /// Create the reply token for a received command envelope.
    #[must_use]
    pub fn for_command(command: &EventEnvelope, replies: ReplyTypes) -> Self {
        Self::new(command.correlation_id.clone(), replies)
    }

    /// Correlation id carried over from the command.
    #[must_use]
    pub const fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Event type of a successful reply.
    #[must_use]
    pub const fn success_type(&self) -> &'static str {
        self.replies.success
    }

    /// Event type of a failed reply.
    #[must_use]
    pub const fn failure_type(&self) -> &'static str {
        self.replies.failure
    }
}

/// Publishes the single reply to a command.
#[derive(Clone)]
pub struct ReplyHandler {
    publisher: Publisher,
}

impl ReplyHandler {
    /// Create a reply handler publishing through `publisher`.
    #[must_use]
    pub const fn new(publisher: Publisher) -> Self {
        Self { publisher }
    }

    /// Publish the success or failure reply for `reply_to`.
    ///
    /// On error the reply is lost and the requester will time out; callers
    /// should log the error.
    ///
    /// # Errors
    ///
    /// Returns the publisher's errors.
    pub async fn send<S, F>(
        &self,
        reply_to: ReplyTo,
        outcome: Result<S, F>,
    ) -> Result<ReplyOutcome, RelayError>
    where
        S: Serialize + Sync,
        F: Serialize + Sync,
    {
        match outcome {
            Ok(success) => self.succeed(reply_to, &success).await,
            Err(failure) => self.fail(reply_to, &failure).await,
        }
    }

    /// Publish the success reply.
    ///
    /// # Errors
    ///
    /// Returns the publisher's errors.
    pub async fn succeed<S>(&self, reply_to: ReplyTo, payload: &S) -> Result<ReplyOutcome, RelayError>
    where
        S: Serialize + ?Sized + Sync,
    {
        self.publish(reply_to, ReplyOutcome::Success, payload).await
    }

    /// Publish the failure reply.
    ///
    /// # Errors
    ///
    /// Returns the publisher's errors.
    pub async fn fail<F>(&self, reply_to: ReplyTo, payload: &F) -> Result<ReplyOutcome, RelayError>
    where
        F: Serialize + ?Sized + Sync,
    {
        self.publish(reply_to, ReplyOutcome::Failure, payload).await
    }

    async fn publish<T>(
        &self,
        reply_to: ReplyTo,
        outcome: ReplyOutcome,
        payload: &T,
    ) -> Result<ReplyOutcome, RelayError>
    where
        T: Serialize + ?Sized + Sync,
    {
        let event_type = match outcome {
            ReplyOutcome::Success => reply_to.success_type(),
            ReplyOutcome::Failure => reply_to.failure_type(),
        };

        match self
            .publisher
            .publish_correlated(event_type, &reply_to.correlation_id, payload)
            .await
        {
            Ok(_) => {
                tracing::debug!(
                    correlation_id = %reply_to.correlation_id,
                    event_type,
                    outcome = outcome.as_str(),
                    "Reply published"
                );
                Ok(outcome)
            }
            Err(error) => {
                tracing::error!(
                    correlation_id = %reply_to.correlation_id,
                    event_type,
                    error = %error,
                    "Failed to publish reply, requester will time out"
                );
                Err(error)
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::link::BrokerLink;
    use crate::waiter::ReplyWaiter;
    use courier_core::user::{ReplyFailure, UserCommandType};
    use courier_testing::InMemoryBroker;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn failure_reply_reuses_the_command_correlation_id() {
        let broker = InMemoryBroker::new();
        let link = Arc::new(BrokerLink::new(Arc::new(broker)));
        let waiter = ReplyWaiter::new(Arc::clone(&link), "events_exchange");
        let replies = ReplyHandler::new(Publisher::new(link, "events_exchange"));

        let kind = UserCommandType::GetProfile;
        let sub = waiter
            .subscribe(CorrelationId::from("abc-1"), &kind.reply_types().expected())
            .await
            .expect("subscribe");

        let reply_to = ReplyTo::new(CorrelationId::from("abc-1"), kind.reply_types());
        let outcome = replies
            .send::<(), _>(reply_to, Err(ReplyFailure::new("User not found")))
            .await
            .expect("publish");
        assert_eq!(outcome, ReplyOutcome::Failure);

        let reply = sub.wait(Duration::from_secs(5)).await.expect("reply");
        assert_eq!(reply.event_type, "GetProfileFailed");
        assert_eq!(reply.correlation_id.as_str(), "abc-1");
        assert_eq!(reply.payload["message"], "User not found");
    }

    #[test]
    fn token_exposes_reply_pair() {
        let reply_to = ReplyTo::new(
            CorrelationId::from("abc-1"),
            UserCommandType::UserLogin.reply_types(),
        );
        assert_eq!(reply_to.success_type(), "UserLoginSuccess");
        assert_eq!(reply_to.failure_type(), "UserLoginFailed");
    }
}
