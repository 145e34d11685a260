//! Participant identity
//!
//! Participants are addressed by an opaque [`PeerId`] assigned by the
//! coordination server. A [`ParticipantRef`] pairs that id with display
//! metadata; it never owns media resources.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::str::FromStr;

/// Opaque identifier of a call participant
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    /// Create a new peer id
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PeerId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Reference to a participant: identifier plus display metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantRef {
    /// Participant identifier
    pub id: PeerId,
    /// Human readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Avatar location
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl ParticipantRef {
    /// Participant with no display metadata
    pub fn new(id: impl Into<PeerId>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            avatar_url: None,
        }
    }

    /// Attach a display name
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Name to show for this participant, falling back to the id
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(self.id.as_str())
    }
}

impl From<PeerId> for ParticipantRef {
    fn from(id: PeerId) -> Self {
        Self::new(id)
    }
}

impl From<&str> for ParticipantRef {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_display() {
        let id = PeerId::new("alice");
        assert_eq!(id.to_string(), "alice");
        assert_eq!(id.as_str(), "alice");
        assert_eq!("alice".parse::<PeerId>().unwrap(), id);
    }

    #[test]
    fn test_peer_id_serializes_as_plain_string() {
        let id = PeerId::new("bob");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"bob\"");
    }

    #[test]
    fn test_participant_label_falls_back_to_id() {
        let plain = ParticipantRef::new("carol");
        assert_eq!(plain.label(), "carol");

        let named = ParticipantRef::new("carol").with_display_name("Carol C.");
        assert_eq!(named.label(), "Carol C.");
    }

    #[test]
    fn test_participant_json_omits_missing_metadata() {
        let json = serde_json::to_string(&ParticipantRef::new("dave")).unwrap();
        assert_eq!(json, r#"{"id":"dave"}"#);

        let parsed: ParticipantRef =
            serde_json::from_str(r#"{"id":"erin","displayName":"Erin"}"#).unwrap();
        assert_eq!(parsed.display_name.as_deref(), Some("Erin"));
    }
}
