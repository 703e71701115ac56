//! Correlation identifiers linking a command to its eventual reply.
//!
//! A [`CorrelationId`] is minted once per logical request by whichever node
//! issues the command, and travels unchanged on every envelope belonging to
//! that request (command, success, failure). Identifiers are random UUID v4
//! strings, so any node can mint one without a central sequencer and two
//! concurrent requests collide only with negligible probability.
//!
//! Identifiers received from the wire are opaque: any string produced by a
//! peer is accepted verbatim and compared byte for byte.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for tracking a request through its entire lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Create a new random correlation ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wrap an identifier received from a peer.
    #[must_use]
    pub fn from_string(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume the identifier, returning the inner string.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl AsRef<str> for CorrelationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn serializes_as_plain_string() {
        let id = CorrelationId::from("abc-1");
        let json = serde_json::to_string(&id).expect("correlation id should serialize");
        assert_eq!(json, "\"abc-1\"");
    }

    #[test]
    fn peer_identifiers_are_kept_verbatim() {
        let id: CorrelationId = "1712345678-deadbeefcafebabe".into();
        assert_eq!(id.as_str(), "1712345678-deadbeefcafebabe");
        assert_eq!(id.to_string(), "1712345678-deadbeefcafebabe");
    }

    #[test]
    fn minted_identifiers_are_uuids() {
        let id = CorrelationId::new();
        assert!(Uuid::parse_str(id.as_str()).is_ok());
    }

    proptest! {
        #[test]
        fn minted_identifiers_are_unique(count in 1usize..2_000) {
            let ids: HashSet<CorrelationId> = (0..count).map(|_| CorrelationId::new()).collect();
            prop_assert_eq!(ids.len(), count);
        }
    }
}
