//! Chat over the peer data channel.
//!
//! Messages travel as JSON `{sender, text, timestamp}` and live only in the
//! session's in-memory log.

use crate::errors::SessionError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use common::types::ParticipantId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Username of the author.
    pub sender: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    /// Create a message stamped now. Whitespace-only text is rejected.
    pub fn new(sender: impl Into<String>, text: impl Into<String>) -> Result<Self, SessionError> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(SessionError::InvalidRequest(
                "Chat message cannot be empty".to_string(),
            ));
        }
        Ok(Self {
            sender: sender.into(),
            text,
            timestamp: Utc::now(),
        })
    }

    pub fn to_bytes(&self) -> Result<Bytes, SessionError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| SessionError::Internal(format!("chat encode failed: {e}")))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, SessionError> {
        let message: Self = serde_json::from_slice(data)
            .map_err(|e| SessionError::InvalidRequest(format!("malformed chat message: {e}")))?;
        if message.text.trim().is_empty() {
            return Err(SessionError::InvalidRequest(
                "Chat message cannot be empty".to_string(),
            ));
        }
        Ok(message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatDirection {
    Sent,
    Received,
}

impl ChatDirection {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatDirection::Sent => "sent",
            ChatDirection::Received => "received",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEntry {
    pub message: ChatMessage,
    pub direction: ChatDirection,
    /// Remote participant the message came from, for received entries.
    pub from: Option<ParticipantId>,
}

/// Append-only log for the lifetime of one call.
#[derive(Debug, Clone, Default)]
pub struct ChatLog {
    entries: Vec<ChatEntry>,
}

impl ChatLog {
    pub fn push_sent(&mut self, message: ChatMessage) {
        self.entries.push(ChatEntry {
            message,
            direction: ChatDirection::Sent,
            from: None,
        });
    }

    pub fn push_received(&mut self, from: ParticipantId, message: ChatMessage) {
        self.entries.push(ChatEntry {
            message,
            direction: ChatDirection::Received,
            from: Some(from),
        });
    }

    #[must_use]
    pub fn entries(&self) -> &[ChatEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_text_is_rejected() {
        for text in ["", "   ", "\n\t"] {
            let err = ChatMessage::new("Alice", text).unwrap_err();
            assert!(matches!(err, SessionError::InvalidRequest(_)));
        }
        assert_eq!(ChatMessage::new("Alice", " hi ").unwrap().text, " hi ");
    }

    #[test]
    fn test_wire_format() {
        let message = ChatMessage::new("Alice", "hello").unwrap();
        let value: serde_json::Value = serde_json::from_slice(&message.to_bytes().unwrap()).unwrap();

        assert_eq!(value["sender"], "Alice");
        assert_eq!(value["text"], "hello");
        assert!(value["timestamp"].is_string());

        let parsed = ChatMessage::from_bytes(&message.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn test_inbound_garbage_is_rejected() {
        assert!(ChatMessage::from_bytes(b"not json").is_err());
        assert!(ChatMessage::from_bytes(
            br#"{"sender":"Bob","text":"  ","timestamp":"2024-01-01T00:00:00Z"}"#
        )
        .is_err());
    }

    #[test]
    fn test_log_keeps_order_and_direction() {
        let mut log = ChatLog::default();
        log.push_sent(ChatMessage::new("Alice", "one").unwrap());
        log.push_received(
            ParticipantId::new("bob"),
            ChatMessage::new("Bob", "two").unwrap(),
        );

        let texts: Vec<&str> = log.entries().iter().map(|e| e.message.text.as_str()).collect();
        assert_eq!(texts, vec!["one", "two"]);
        assert_eq!(log.entries().get(1).unwrap().direction, ChatDirection::Received);

        log.clear();
        assert!(log.is_empty());
    }
}
