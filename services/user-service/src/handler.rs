//! User command handling.

use crate::directory::{DirectoryError, UserDirectory};
use async_trait::async_trait;
use courier_core::user::{LoginGranted, ReplyFailure, UserCommand, UserProfile};
use courier_core::{EnvelopeError, EventEnvelope};
use courier_runtime::{CommandHandler, HandlerError, ReplyHandler, ReplyTo};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Failure message for command payloads that do not match their schema.
pub const INVALID_REQUEST_FORMAT: &str = "Invalid request format";

/// Success payload of any user reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum UserReply {
    /// `UserRegisteredSuccess`, `GetProfileSuccess`, `UserOauthSuccess`
    Profile(UserProfile),
    /// `UserLoginSuccess`
    Login(LoginGranted),
}

/// Answers user commands from a [`UserDirectory`].
pub struct UserCommandHandler {
    directory: Arc<UserDirectory>,
    replies: ReplyHandler,
}

impl UserCommandHandler {
    /// Create a handler replying through `replies`.
    #[must_use]
    pub const fn new(directory: Arc<UserDirectory>, replies: ReplyHandler) -> Self {
        Self { directory, replies }
    }

    /// Apply a command to the directory.
    ///
    /// Registration and login hash or verify passwords, so they run on the
    /// blocking thread pool.
    ///
    /// # Errors
    ///
    /// The directory's refusal, as the failure reply payload.
    pub async fn apply(&self, command: UserCommand) -> Result<UserReply, ReplyFailure> {
        let result = match command {
            UserCommand::Register(request) => {
                let directory = Arc::clone(&self.directory);
                blocking(move || directory.register(request).map(UserReply::Profile)).await
            }
            UserCommand::Login(request) => {
                let directory = Arc::clone(&self.directory);
                blocking(move || {
                    directory
                        .login(&request.email, &request.password)
                        .map(UserReply::Login)
                })
                .await
            }
            UserCommand::GetProfile(query) => self.directory.profile(&query.id).map(UserReply::Profile),
            UserCommand::Oauth(identity) => {
                Ok(UserReply::Profile(self.directory.find_or_create_oauth(identity)))
            }
        };

        result.map_err(|error| {
            if let DirectoryError::Hashing(reason) | DirectoryError::Interrupted(reason) = &error {
                warn!(reason = %reason, "Password work failed");
            }
            ReplyFailure::new(error.to_string())
        })
    }
}

async fn blocking<F>(work: F) -> Result<UserReply, DirectoryError>
where
    F: FnOnce() -> Result<UserReply, DirectoryError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| DirectoryError::Interrupted(e.to_string()))?
}

#[async_trait]
impl CommandHandler<UserCommand> for UserCommandHandler {
    async fn handle(&self, command: UserCommand, reply_to: ReplyTo) -> Result<(), HandlerError> {
        let kind = command.kind();
        let outcome = self.apply(command).await;
        let correlation_id = reply_to.correlation_id().clone();

        let sent = self.replies.send(reply_to, outcome).await?;
        debug!(
            command = %kind,
            correlation_id = %correlation_id,
            outcome = ?sent,
            "Replied to command"
        );
        Ok(())
    }

    async fn on_undecodable(
        &self,
        envelope: &EventEnvelope,
        error: &EnvelopeError,
        reply_to: ReplyTo,
    ) -> Result<(), HandlerError> {
        warn!(
            event_type = %envelope.event_type,
            correlation_id = %envelope.correlation_id,
            error = %error,
            "Answering undecodable command with failure"
        );
        self.replies
            .fail(reply_to, &ReplyFailure::new(INVALID_REQUEST_FORMAT))
            .await?;
        Ok(())
    }
}
