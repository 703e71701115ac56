//! Closed event-type sets per worker role.
//!
//! Event types on the wire are plain strings, but each worker role only ever
//! understands a fixed set of commands, and each command has exactly one
//! success and one failure reply type. [`CommandSet`] captures that contract
//! as a closed enum decoded in a single step, so producers and consumers
//! cannot drift apart on stringly-typed names.

use crate::envelope::{EnvelopeError, EventEnvelope};

/// Which of the two reply types a reply envelope carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyOutcome {
    /// The command was processed successfully.
    Success,
    /// The command was rejected by the worker's business rules.
    Failure,
}

impl ReplyOutcome {
    /// Short label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

/// The pair of reply event types belonging to one command type.
///
/// Reply types never double as command types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReplyTypes {
    /// Event type published when the command succeeds.
    pub success: &'static str,
    /// Event type published when the command fails.
    pub failure: &'static str,
}

impl ReplyTypes {
    /// Create a reply pair.
    #[must_use]
    pub const fn new(success: &'static str, failure: &'static str) -> Self {
        Self { success, failure }
    }

    /// Both reply types, in `[success, failure]` order, as owned strings
    /// ready to be handed to a waiter.
    #[must_use]
    pub fn expected(&self) -> Vec<String> {
        vec![self.success.to_string(), self.failure.to_string()]
    }

    /// Classify a received event type against this pair.
    ///
    /// Returns `None` if the event type is neither reply.
    #[must_use]
    pub fn classify(&self, event_type: &str) -> Option<ReplyOutcome> {
        if event_type == self.success {
            Some(ReplyOutcome::Success)
        } else if event_type == self.failure {
            Some(ReplyOutcome::Failure)
        } else {
            None
        }
    }
}

/// A closed set of commands consumed by one worker role.
///
/// Implementors are enums with one variant per command type, each carrying
/// the typed payload for that command.
///
/// # Example
///
/// ```
/// use courier_core::events::CommandSet;
/// use courier_core::user::UserCommand;
///
/// assert!(UserCommand::event_types().contains(&"UserLogin"));
/// let replies = UserCommand::reply_types_for("UserLogin").map(|r| r.failure);
/// assert_eq!(replies, Some("UserLoginFailed"));
/// ```
pub trait CommandSet: Sized + Send + Sync + 'static {
    /// Every command event type routed to this role (queue binding keys).
    fn event_types() -> &'static [&'static str];

    /// Decode an envelope into a typed command.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::UnknownEventType`] if the event type is not
    /// a member of this set, or [`EnvelopeError::Payload`] if the payload does
    /// not match the command's schema.
    fn decode(envelope: &EventEnvelope) -> Result<Self, EnvelopeError>;

    /// Reply types for a command event type, or `None` if the type is not a
    /// member of this set.
    fn reply_types_for(event_type: &str) -> Option<ReplyTypes>;

    /// Wire name of this command.
    fn event_type(&self) -> &'static str;

    /// Reply types for this command.
    fn reply_types(&self) -> ReplyTypes;

    /// Returns `true` if `event_type` is one of this role's commands.
    fn accepts(event_type: &str) -> bool {
        Self::event_types().contains(&event_type)
    }
}
