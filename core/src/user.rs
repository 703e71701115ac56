//! User-service protocol: command and reply types and their payloads.
//!
//! | Command          | Success                 | Failure                |
//! |------------------|-------------------------|------------------------|
//! | `UserRegistered` | `UserRegisteredSuccess` | `UserRegisteredFailed` |
//! | `UserLogin`      | `UserLoginSuccess`      | `UserLoginFailed`      |
//! | `GetProfile`     | `GetProfileSuccess`     | `GetProfileFailed`     |
//! | `UserOauth`      | `UserOauthSuccess`      | `UserOauthFailed`      |
//!
//! Passwords travel only inside command payloads. They are redacted from
//! `Debug` output and no reply payload has a field for them.

use crate::envelope::{EnvelopeError, EventEnvelope};
use crate::events::{CommandSet, ReplyOutcome, ReplyTypes};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Role assigned to every self-registered user.
pub const ROLE_USER: &str = "USER";

/// Durable queue name of the user-service worker role.
pub const USER_SERVICE_QUEUE: &str = "user-service_queue";

/// Command event types understood by the user service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UserCommandType {
    /// Create an account with email and password.
    UserRegistered,
    /// Verify credentials.
    UserLogin,
    /// Look up a profile by id.
    GetProfile,
    /// Find or create an account from an OAuth identity.
    UserOauth,
}

impl UserCommandType {
    /// All user command types.
    pub const ALL: [Self; 4] = [
        Self::UserRegistered,
        Self::UserLogin,
        Self::GetProfile,
        Self::UserOauth,
    ];

    /// Wire name (also the routing key).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UserRegistered => "UserRegistered",
            Self::UserLogin => "UserLogin",
            Self::GetProfile => "GetProfile",
            Self::UserOauth => "UserOauth",
        }
    }

    /// The success reply for this command.
    #[must_use]
    pub const fn success(self) -> UserReplyType {
        match self {
            Self::UserRegistered => UserReplyType::UserRegisteredSuccess,
            Self::UserLogin => UserReplyType::UserLoginSuccess,
            Self::GetProfile => UserReplyType::GetProfileSuccess,
            Self::UserOauth => UserReplyType::UserOauthSuccess,
        }
    }

    /// The failure reply for this command.
    #[must_use]
    pub const fn failure(self) -> UserReplyType {
        match self {
            Self::UserRegistered => UserReplyType::UserRegisteredFailed,
            Self::UserLogin => UserReplyType::UserLoginFailed,
            Self::GetProfile => UserReplyType::GetProfileFailed,
            Self::UserOauth => UserReplyType::UserOauthFailed,
        }
    }

    /// Both reply types as a pair.
    #[must_use]
    pub const fn reply_types(self) -> ReplyTypes {
        ReplyTypes::new(self.success().as_str(), self.failure().as_str())
    }
}

impl fmt::Display for UserCommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserCommandType {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| EnvelopeError::UnknownEventType(s.to_string()))
    }
}

/// Reply event types published by the user service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UserReplyType {
    /// Registration succeeded.
    UserRegisteredSuccess,
    /// Registration was rejected.
    UserRegisteredFailed,
    /// Credentials accepted.
    UserLoginSuccess,
    /// Credentials rejected.
    UserLoginFailed,
    /// Profile found.
    GetProfileSuccess,
    /// Profile lookup failed.
    GetProfileFailed,
    /// OAuth identity resolved to an account.
    UserOauthSuccess,
    /// OAuth identity could not be resolved.
    UserOauthFailed,
}

impl UserReplyType {
    /// All user reply types.
    pub const ALL: [Self; 8] = [
        Self::UserRegisteredSuccess,
        Self::UserRegisteredFailed,
        Self::UserLoginSuccess,
        Self::UserLoginFailed,
        Self::GetProfileSuccess,
        Self::GetProfileFailed,
        Self::UserOauthSuccess,
        Self::UserOauthFailed,
    ];

    /// Wire name (also the routing key).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UserRegisteredSuccess => "UserRegisteredSuccess",
            Self::UserRegisteredFailed => "UserRegisteredFailed",
            Self::UserLoginSuccess => "UserLoginSuccess",
            Self::UserLoginFailed => "UserLoginFailed",
            Self::GetProfileSuccess => "GetProfileSuccess",
            Self::GetProfileFailed => "GetProfileFailed",
            Self::UserOauthSuccess => "UserOauthSuccess",
            Self::UserOauthFailed => "UserOauthFailed",
        }
    }

    /// The command this reply answers.
    #[must_use]
    pub const fn command(self) -> UserCommandType {
        match self {
            Self::UserRegisteredSuccess | Self::UserRegisteredFailed => {
                UserCommandType::UserRegistered
            }
            Self::UserLoginSuccess | Self::UserLoginFailed => UserCommandType::UserLogin,
            Self::GetProfileSuccess | Self::GetProfileFailed => UserCommandType::GetProfile,
            Self::UserOauthSuccess | Self::UserOauthFailed => UserCommandType::UserOauth,
        }
    }

    /// Whether this is a success or failure reply.
    #[must_use]
    pub const fn outcome(self) -> ReplyOutcome {
        match self {
            Self::UserRegisteredSuccess
            | Self::UserLoginSuccess
            | Self::GetProfileSuccess
            | Self::UserOauthSuccess => ReplyOutcome::Success,
            Self::UserRegisteredFailed
            | Self::UserLoginFailed
            | Self::GetProfileFailed
            | Self::UserOauthFailed => ReplyOutcome::Failure,
        }
    }
}

impl fmt::Display for UserReplyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserReplyType {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| EnvelopeError::UnknownEventType(s.to_string()))
    }
}

// ============================================================================
// Command payloads
// ============================================================================

/// Payload of `UserRegistered`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterUser {
    /// Login email, unique per account.
    pub email: String,
    /// Display name.
    pub username: String,
    /// Plain-text password, hashed by the worker.
    pub password: String,
    /// Postal address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Phone number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    /// Age in years.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<u32>,
}

impl fmt::Debug for RegisterUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterUser")
            .field("email", &self.email)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("address", &self.address)
            .field("phone", &self.phone)
            .field("age", &self.age)
            .finish()
    }
}

/// Payload of `UserLogin`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginUser {
    /// Login email.
    pub email: String,
    /// Plain-text password.
    pub password: String,
}

impl fmt::Debug for LoginUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginUser")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Payload of `GetProfile`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetProfile {
    /// Account id.
    pub id: String,
}

/// Payload of `UserOauth`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OauthUser {
    /// Identity-provider subject.
    pub google_id: String,
    /// Verified email.
    pub email: String,
    /// Display name.
    pub username: String,
    /// Avatar URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

// ============================================================================
// Reply payloads
// ============================================================================

/// Success payload of `UserRegisteredSuccess`, `GetProfileSuccess` and
/// `UserOauthSuccess`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    /// Account id.
    pub id: String,
    /// Login email.
    pub email: String,
    /// Display name.
    pub username: String,
    /// Account role.
    pub role: String,
    /// Postal address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Phone number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    /// Age in years.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<u32>,
    /// Identity-provider subject, for OAuth accounts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub google_id: Option<String>,
    /// Avatar URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

/// Success payload of `UserLoginSuccess`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginGranted {
    /// Account id.
    pub id: String,
    /// Login email.
    pub email: String,
    /// Account role.
    pub role: String,
}

/// Payload of every `*Failed` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyFailure {
    /// Human-readable reason.
    pub message: String,
}

impl ReplyFailure {
    /// Create a failure payload.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ReplyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

// ============================================================================
// Decoded command set
// ============================================================================

/// A decoded user-service command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserCommand {
    /// `UserRegistered`
    Register(RegisterUser),
    /// `UserLogin`
    Login(LoginUser),
    /// `GetProfile`
    GetProfile(GetProfile),
    /// `UserOauth`
    Oauth(OauthUser),
}

impl UserCommand {
    /// The command type of this command.
    #[must_use]
    pub const fn kind(&self) -> UserCommandType {
        match self {
            Self::Register(_) => UserCommandType::UserRegistered,
            Self::Login(_) => UserCommandType::UserLogin,
            Self::GetProfile(_) => UserCommandType::GetProfile,
            Self::Oauth(_) => UserCommandType::UserOauth,
        }
    }
}

static USER_COMMAND_TYPES: [&str; 4] = [
    UserCommandType::UserRegistered.as_str(),
    UserCommandType::UserLogin.as_str(),
    UserCommandType::GetProfile.as_str(),
    UserCommandType::UserOauth.as_str(),
];

impl CommandSet for UserCommand {
    fn event_types() -> &'static [&'static str] {
        &USER_COMMAND_TYPES
    }

    fn decode(envelope: &EventEnvelope) -> Result<Self, EnvelopeError> {
        let kind: UserCommandType = envelope.event_type.parse()?;
        let command = match kind {
            UserCommandType::UserRegistered => Self::Register(envelope.payload_as()?),
            UserCommandType::UserLogin => Self::Login(envelope.payload_as()?),
            UserCommandType::GetProfile => Self::GetProfile(envelope.payload_as()?),
            UserCommandType::UserOauth => Self::Oauth(envelope.payload_as()?),
        };
        Ok(command)
    }

    fn reply_types_for(event_type: &str) -> Option<ReplyTypes> {
        event_type
            .parse::<UserCommandType>()
            .ok()
            .map(UserCommandType::reply_types)
    }

    fn event_type(&self) -> &'static str {
        self.kind().as_str()
    }

    fn reply_types(&self) -> ReplyTypes {
        self.kind().reply_types()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::correlation::CorrelationId;
    use chrono::Utc;
    use serde_json::json;
    use std::collections::HashSet;

    fn envelope(event_type: &str, payload: serde_json::Value) -> EventEnvelope {
        EventEnvelope::new(event_type, CorrelationId::from("abc-1"), Utc::now(), payload)
    }

    #[test]
    fn command_and_reply_names_are_disjoint() {
        let commands: HashSet<&str> = UserCommandType::ALL.iter().map(|c| c.as_str()).collect();
        let replies: HashSet<&str> = UserReplyType::ALL.iter().map(|r| r.as_str()).collect();
        assert_eq!(replies.len(), 8);
        assert!(commands.is_disjoint(&replies));
    }

    #[test]
    fn reply_types_round_trip_to_their_command() {
        for command in UserCommandType::ALL {
            assert_eq!(command.success().command(), command);
            assert_eq!(command.failure().command(), command);
            assert_eq!(command.success().outcome(), ReplyOutcome::Success);
            assert_eq!(command.failure().outcome(), ReplyOutcome::Failure);
        }
    }

    #[test]
    fn wire_names_match_known_pairs() {
        let pair = UserCommandType::UserRegistered.reply_types();
        assert_eq!(pair.success, "UserRegisteredSuccess");
        assert_eq!(pair.failure, "UserRegisteredFailed");
        assert_eq!(
            "GetProfileFailed".parse::<UserReplyType>().expect("known reply"),
            UserReplyType::GetProfileFailed
        );
    }

    #[test]
    fn decode_register_command() {
        let env = envelope(
            "UserRegistered",
            json!({ "email": "ada@example.com", "username": "ada", "password": "s3cret" }),
        );

        let command = UserCommand::decode(&env).expect("valid command");
        let UserCommand::Register(register) = &command else {
            unreachable!("decoded into the wrong variant: {command:?}");
        };
        assert_eq!(register.email, "ada@example.com");
        assert_eq!(register.age, None);
        assert_eq!(command.reply_types().failure, "UserRegisteredFailed");
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let env = envelope("UserDeleted", json!({}));
        assert!(matches!(
            UserCommand::decode(&env),
            Err(EnvelopeError::UnknownEventType(t)) if t == "UserDeleted"
        ));
    }

    #[test]
    fn decode_rejects_wrong_schema() {
        let env = envelope("GetProfile", json!({ "email": "ada@example.com" }));
        assert!(matches!(
            UserCommand::decode(&env),
            Err(EnvelopeError::Payload { .. })
        ));
        assert_eq!(
            UserCommand::reply_types_for("GetProfile").map(|r| r.failure),
            Some("GetProfileFailed")
        );
    }

    #[test]
    fn passwords_are_redacted_from_debug() {
        let login = LoginUser {
            email: "ada@example.com".into(),
            password: "hunter2".into(),
        };
        let rendered = format!("{:?}", UserCommand::Login(login));
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn profile_omits_absent_optional_fields() {
        let profile = UserProfile {
            id: "u-1".into(),
            email: "ada@example.com".into(),
            username: "ada".into(),
            role: ROLE_USER.into(),
            address: None,
            phone: None,
            age: Some(36),
            google_id: None,
            avatar: None,
        };
        let value = serde_json::to_value(&profile).expect("serializes");
        assert_eq!(value["age"], 36);
        assert!(value.get("address").is_none());
        assert!(value.get("password").is_none());
    }
}
