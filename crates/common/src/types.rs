//! Identifier types for call participants and rooms.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Length of a locally generated room identifier.
pub const GENERATED_ROOM_ID_LEN: usize = 8;

/// Upper bound on room identifiers accepted from invitation links.
pub const MAX_ROOM_ID_LEN: usize = 64;

/// Path segment that precedes the room identifier in an invitation link.
const INVITE_PATH_SEGMENT: &str = "video-call";

/// Opaque identifier of a call participant.
///
/// Supplied by the identity provider; never interpreted beyond equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    /// Wrap an identity-provider supplied id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Create a random participant ID (used by headless agents without an account).
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Errors produced when parsing a room identifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidRoomId {
    #[error("room id is empty")]
    Empty,

    #[error("room id is {0} characters, maximum is {MAX_ROOM_ID_LEN}")]
    TooLong(usize),

    #[error("room id contains non URL-safe character {0:?}")]
    InvalidCharacter(char),

    #[error("not an invitation link: {0}")]
    NotAnInvite(String),
}

/// URL-safe identifier of a two-party call room.
///
/// Either generated locally (first 8 characters of a v4 UUID) or taken
/// from an invitation link. Collisions between generated ids are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomId(String);

impl RoomId {
    /// Generate a short random room id.
    #[must_use]
    pub fn generate() -> Self {
        let uuid = Uuid::new_v4().simple().to_string();
        let short = uuid.get(..GENERATED_ROOM_ID_LEN).unwrap_or("00000000");
        Self(short.to_string())
    }

    /// Validate a room id supplied by a user or a link.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidRoomId`] if the id is empty, too long, or contains
    /// characters outside `[A-Za-z0-9_-]`.
    pub fn parse(value: &str) -> Result<Self, InvalidRoomId> {
        if value.is_empty() {
            return Err(InvalidRoomId::Empty);
        }
        if value.len() > MAX_ROOM_ID_LEN {
            return Err(InvalidRoomId::TooLong(value.len()));
        }
        if let Some(c) = value
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(InvalidRoomId::InvalidCharacter(c));
        }
        Ok(Self(value.to_string()))
    }

    /// Extract the room id from an invitation link of the form
    /// `{base}/video-call/{room}`. Query strings and fragments are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidRoomId::NotAnInvite`] if the link has no
    /// `video-call` segment, or the parse error of the trailing segment.
    pub fn from_invite_url(link: &str) -> Result<Self, InvalidRoomId> {
        let path = link.split(['?', '#']).next().unwrap_or_default();
        let mut segments = path.trim_end_matches('/').rsplit('/');
        let room = segments.next().unwrap_or_default();
        match segments.next() {
            Some(INVITE_PATH_SEGMENT) => Self::parse(room),
            _ => Err(InvalidRoomId::NotAnInvite(link.to_string())),
        }
    }

    /// Build the invitation link for this room under `base_url`.
    #[must_use]
    pub fn invite_url(&self, base_url: &str) -> String {
        format!(
            "{}/{INVITE_PATH_SEGMENT}/{}",
            base_url.trim_end_matches('/'),
            self.0
        )
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RoomId {
    type Error = InvalidRoomId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RoomId> for String {
    fn from(value: RoomId) -> Self {
        value.0
    }
}

/// Side of a two-party call.
///
/// The initiator (interviewer) originates the negotiation offer and is the
/// only side allowed to trigger verification. Fixed for a session's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "interviewer")]
    Initiator,
    #[serde(rename = "interviewee")]
    Responder,
}

impl Role {
    /// The role the other participant of the call must hold.
    #[must_use]
    pub fn counterpart(self) -> Self {
        match self {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        }
    }

    #[must_use]
    pub fn is_initiator(self) -> bool {
        self == Role::Initiator
    }

    /// Parse the user-facing role name (`interviewer` / `interviewee`).
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "interviewer" | "initiator" => Some(Role::Initiator),
            "interviewee" | "responder" => Some(Role::Responder),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => f.write_str("interviewer"),
            Role::Responder => f.write_str("interviewee"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_room_id_is_short_and_url_safe() {
        for _ in 0..32 {
            let id = RoomId::generate();
            assert_eq!(id.as_str().len(), GENERATED_ROOM_ID_LEN);
            assert!(RoomId::parse(id.as_str()).is_ok());
        }
    }

    #[test]
    fn test_parse_rejects_unsafe_ids() {
        assert_eq!(RoomId::parse(""), Err(InvalidRoomId::Empty));
        assert_eq!(
            RoomId::parse("abc/def"),
            Err(InvalidRoomId::InvalidCharacter('/'))
        );
        assert_eq!(
            RoomId::parse(&"a".repeat(65)),
            Err(InvalidRoomId::TooLong(65))
        );
        assert!(RoomId::parse("abc12345").is_ok());
        assert!(RoomId::parse("team_call-2").is_ok());
    }

    #[test]
    fn test_invite_url_round_trips_through_link() {
        let room = RoomId::parse("abc12345").unwrap();
        let link = room.invite_url("https://calls.example.com/");
        assert_eq!(link, "https://calls.example.com/video-call/abc12345");

        assert_eq!(RoomId::from_invite_url(&link).unwrap(), room);
        assert_eq!(
            RoomId::from_invite_url("https://calls.example.com/video-call/abc12345/?ref=mail")
                .unwrap(),
            room
        );
    }

    #[test]
    fn test_from_invite_url_requires_video_call_segment() {
        let result = RoomId::from_invite_url("https://calls.example.com/dashboard/abc12345");
        assert!(matches!(result, Err(InvalidRoomId::NotAnInvite(_))));
    }

    #[test]
    fn test_room_id_deserialization_validates() {
        let ok: RoomId = serde_json::from_str("\"abc12345\"").unwrap();
        assert_eq!(ok.as_str(), "abc12345");

        let bad: Result<RoomId, _> = serde_json::from_str("\"a b\"");
        assert!(bad.is_err());
    }

    #[test]
    fn test_exactly_one_side_is_initiator() {
        for role in [Role::Initiator, Role::Responder] {
            let other = role.counterpart();
            assert_ne!(role, other);
            assert!(role.is_initiator() ^ other.is_initiator());
            assert_eq!(other.counterpart(), role);
        }
    }

    #[test]
    fn test_role_names() {
        assert_eq!(Role::from_name("Interviewer"), Some(Role::Initiator));
        assert_eq!(Role::from_name("interviewee"), Some(Role::Responder));
        assert_eq!(Role::from_name("observer"), None);
        assert_eq!(
            serde_json::to_string(&Role::Initiator).unwrap(),
            "\"interviewer\""
        );
    }
}
