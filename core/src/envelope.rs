//! Event envelope - the unit of broker traffic.
//!
//! Every message on the shared exchange is an [`EventEnvelope`] serialized as
//! JSON:
//!
//! ```json
//! {
//!   "event_type": "UserRegistered",
//!   "correlation_id": "5f0c6c1e-8d38-4c43-9f55-0b1d1c1f4a10",
//!   "timestamp": "2025-01-01T00:00:00Z",
//!   "payload": { "email": "ada@example.com" }
//! }
//! ```
//!
//! # Payload Encoding
//!
//! The canonical payload is a JSON object. Older producers sometimes sent the
//! payload as a JSON-encoded string, or as a bare human-readable string for
//! failures. Decoding normalizes both:
//!
//! - a string holding valid JSON is replaced by the parsed value
//! - any other string `s` becomes `{"message": s}`
//! - a missing payload becomes `null`
//!
//! Encoding always emits the canonical form.

use crate::correlation::CorrelationId;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// MIME type of a serialized envelope.
pub const CONTENT_TYPE: &str = "application/json";

/// Error types for envelope operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// Failed to serialize an envelope or payload.
    #[error("Failed to serialize envelope: {0}")]
    Serialization(String),

    /// Bytes on the wire are not a valid envelope.
    #[error("Malformed envelope: {0}")]
    Malformed(String),

    /// The envelope is valid but its payload does not match the schema of its
    /// event type.
    #[error("Invalid payload for '{event_type}': {reason}")]
    Payload {
        /// The event type whose payload failed to decode
        event_type: String,
        /// The reason for failure
        reason: String,
    },

    /// The event type is not part of the set the receiver understands.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),
}

/// The typed, correlation-tagged unit of broker traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Logical command or reply name, also used as the routing key.
    pub event_type: String,

    /// Identifier shared by every envelope of one request lifecycle.
    pub correlation_id: CorrelationId,

    /// Instant the envelope was created (RFC 3339 on the wire).
    pub timestamp: DateTime<Utc>,

    /// Event-specific payload (canonically a JSON object).
    #[serde(default)]
    pub payload: Value,
}

impl EventEnvelope {
    /// Create a new envelope from an already-built payload value.
    ///
    /// # Examples
    ///
    /// ```
    /// use courier_core::{CorrelationId, EventEnvelope, Utc};
    ///
    /// let envelope = EventEnvelope::new(
    ///     "UserRegistered",
    ///     CorrelationId::from("abc-1"),
    ///     Utc::now(),
    ///     serde_json::json!({ "email": "ada@example.com" }),
    /// );
    /// assert_eq!(envelope.event_type, "UserRegistered");
    /// ```
    #[must_use]
    pub fn new(
        event_type: impl Into<String>,
        correlation_id: CorrelationId,
        timestamp: DateTime<Utc>,
        payload: Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            correlation_id,
            timestamp,
            payload,
        }
    }

    /// Create an envelope from any serializable payload.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Serialization`] if the payload cannot be
    /// represented as JSON.
    pub fn with_payload<T: Serialize + ?Sized>(
        event_type: impl Into<String>,
        correlation_id: CorrelationId,
        timestamp: DateTime<Utc>,
        payload: &T,
    ) -> Result<Self, EnvelopeError> {
        let payload =
            serde_json::to_value(payload).map_err(|e| EnvelopeError::Serialization(e.to_string()))?;
        Ok(Self::new(event_type, correlation_id, timestamp, payload))
    }

    /// Serialize this envelope to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Serialization`] if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(|e| EnvelopeError::Serialization(e.to_string()))
    }

    /// Parse an envelope from JSON bytes, normalizing legacy payload encodings.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Malformed`] if the bytes are not JSON or lack
    /// the required fields.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let mut envelope: Self =
            serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        if envelope.event_type.is_empty() {
            return Err(EnvelopeError::Malformed("empty event_type".to_string()));
        }
        envelope.payload = normalize_payload(envelope.payload);
        Ok(envelope)
    }

    /// Decode the payload into the schema expected for this event type.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Payload`] if the payload does not match `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        T::deserialize(&self.payload).map_err(|e| EnvelopeError::Payload {
            event_type: self.event_type.clone(),
            reason: e.to_string(),
        })
    }

    /// Returns `true` if this envelope belongs to the given request.
    #[must_use]
    pub fn is_correlated_with(&self, correlation_id: &CorrelationId) -> bool {
        &self.correlation_id == correlation_id
    }
}

impl fmt::Display for EventEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EventEnvelope {{ type: {}, correlation_id: {} }}",
            self.event_type, self.correlation_id
        )
    }
}

fn normalize_payload(payload: Value) -> Value {
    match payload {
        Value::String(text) => match serde_json::from_str::<Value>(&text) {
            Ok(parsed) if parsed.is_object() || parsed.is_array() => parsed,
            _ => serde_json::json!({ "message": text }),
        },
        other => other,
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fixed_time() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .expect("hardcoded timestamp should always parse")
            .with_timezone(&Utc)
    }

    #[test]
    fn wire_format_uses_snake_case_fields() {
        let envelope = EventEnvelope::new(
            "UserRegistered",
            CorrelationId::from("abc-1"),
            fixed_time(),
            json!({ "email": "ada@example.com" }),
        );

        let value: Value =
            serde_json::from_slice(&envelope.to_bytes().expect("should serialize")).expect("json");

        assert_eq!(value["event_type"], "UserRegistered");
        assert_eq!(value["correlation_id"], "abc-1");
        assert_eq!(value["timestamp"], "2025-01-01T00:00:00Z");
        assert_eq!(value["payload"]["email"], "ada@example.com");
    }

    #[test]
    fn string_encoded_json_payload_is_unwrapped() {
        let raw = br#"{
            "event_type": "UserLoginSuccess",
            "correlation_id": "abc-1",
            "timestamp": "2025-01-01T00:00:00Z",
            "payload": "{\"email\":\"ada@example.com\",\"role\":\"USER\"}"
        }"#;

        let envelope = EventEnvelope::from_bytes(raw).expect("should parse");
        assert_eq!(envelope.payload, json!({ "email": "ada@example.com", "role": "USER" }));
    }

    #[test]
    fn bare_string_payload_becomes_message_object() {
        let raw = br#"{
            "event_type": "UserRegisteredFailed",
            "correlation_id": "abc-1",
            "timestamp": "2025-01-01T00:00:00Z",
            "payload": "Email already registered"
        }"#;

        let envelope = EventEnvelope::from_bytes(raw).expect("should parse");
        assert_eq!(envelope.payload, json!({ "message": "Email already registered" }));
    }

    #[test]
    fn missing_payload_defaults_to_null() {
        let raw = br#"{"event_type":"GetProfile","correlation_id":"c","timestamp":"2025-01-01T00:00:00Z"}"#;
        let envelope = EventEnvelope::from_bytes(raw).expect("should parse");
        assert!(envelope.payload.is_null());
    }

    #[test]
    fn garbage_is_malformed() {
        let err = EventEnvelope::from_bytes(b"not json").expect_err("should fail");
        assert!(matches!(err, EnvelopeError::Malformed(_)));

        let err = EventEnvelope::from_bytes(br#"{"event_type":"X"}"#).expect_err("should fail");
        assert!(matches!(err, EnvelopeError::Malformed(_)));
    }

    #[test]
    fn empty_event_type_is_malformed() {
        let raw = br#"{"event_type":"","correlation_id":"c","timestamp":"2025-01-01T00:00:00Z"}"#;
        assert!(matches!(
            EventEnvelope::from_bytes(raw),
            Err(EnvelopeError::Malformed(_))
        ));
    }

    #[test]
    fn payload_schema_mismatch_names_event_type() {
        #[derive(Debug, Deserialize)]
        #[allow(dead_code)]
        struct Login {
            email: String,
            password: String,
        }

        let envelope = EventEnvelope::new(
            "UserLogin",
            CorrelationId::from("abc-1"),
            fixed_time(),
            json!({ "email": "ada@example.com" }),
        );

        let err = envelope.payload_as::<Login>().expect_err("password is missing");
        assert!(matches!(err, EnvelopeError::Payload { ref event_type, .. } if event_type == "UserLogin"));
    }

    #[test]
    fn correlation_check_is_exact() {
        let envelope =
            EventEnvelope::new("X", CorrelationId::from("abc-1"), fixed_time(), Value::Null);
        assert!(envelope.is_correlated_with(&CorrelationId::from("abc-1")));
        assert!(!envelope.is_correlated_with(&CorrelationId::from("abc-10")));
    }
}
