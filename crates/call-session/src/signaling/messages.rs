//! Rendezvous protocol frames.
//!
//! Frames travel as JSON text: `{"event": "<kebab-case>", "data": {...}}`.
//! Negotiation payloads inside `signal` are opaque to this layer.

use crate::errors::SignalingError;
use common::types::{ParticipantId, RoomId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frames sent by a participant to the rendezvous server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientFrame {
    /// Announce presence in a room.
    #[serde(rename_all = "camelCase")]
    JoinRoom { room_id: RoomId },

    /// Relay a negotiation payload to one participant.
    #[serde(rename_all = "camelCase")]
    Signal { peer_id: ParticipantId, signal: Value },

    /// Leave the current room without closing the connection.
    LeaveRoom,
}

/// Frames sent by the rendezvous server to a participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerFrame {
    /// Participants already present when the local participant joined.
    #[serde(rename_all = "camelCase")]
    RoomMembers { peer_ids: Vec<ParticipantId> },

    #[serde(rename_all = "camelCase")]
    PeerJoined { peer_id: ParticipantId },

    #[serde(rename_all = "camelCase")]
    PeerLeft { peer_id: ParticipantId },

    /// Negotiation payload relayed from `peer_id`.
    #[serde(rename_all = "camelCase")]
    Signal { peer_id: ParticipantId, signal: Value },

    /// Server is closing the connection.
    Close { reason: String },
}

impl ClientFrame {
    /// Encode as a JSON text frame.
    pub fn to_text(&self) -> Result<String, SignalingError> {
        serde_json::to_string(self).map_err(|e| SignalingError::Protocol(e.to_string()))
    }

    /// Decode a JSON text frame (server side).
    pub fn from_text(text: &str) -> Result<Self, SignalingError> {
        serde_json::from_str(text).map_err(|e| SignalingError::Protocol(e.to_string()))
    }
}

impl ServerFrame {
    /// Encode as a JSON text frame (server side).
    pub fn to_text(&self) -> Result<String, SignalingError> {
        serde_json::to_string(self).map_err(|e| SignalingError::Protocol(e.to_string()))
    }

    /// Decode a JSON text frame.
    pub fn from_text(text: &str) -> Result<Self, SignalingError> {
        serde_json::from_str(text).map_err(|e| SignalingError::Protocol(e.to_string()))
    }
}

/// Negotiation payload delivered to `on_signal` subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalEvent {
    pub from: ParticipantId,
    pub payload: Value,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_join_room_wire_format() {
        let frame = ClientFrame::JoinRoom {
            room_id: RoomId::parse("abc12345").unwrap(),
        };

        let value: Value = serde_json::from_str(&frame.to_text().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"event": "join-room", "data": {"roomId": "abc12345"}})
        );
    }

    #[test]
    fn test_signal_wire_format_keeps_payload_opaque() {
        let payload = json!({"type": "offer", "sdp": "v=0\r\n", "extra": [1, 2, 3]});
        let frame = ClientFrame::Signal {
            peer_id: ParticipantId::new("bob"),
            signal: payload.clone(),
        };

        let value: Value = serde_json::from_str(&frame.to_text().unwrap()).unwrap();
        assert_eq!(value["event"], "signal");
        assert_eq!(value["data"]["peerId"], "bob");
        assert_eq!(value["data"]["signal"], payload);
    }

    #[test]
    fn test_leave_room_has_no_data() {
        let text = ClientFrame::LeaveRoom.to_text().unwrap();
        assert_eq!(text, r#"{"event":"leave-room"}"#);
        assert_eq!(ClientFrame::from_text(&text).unwrap(), ClientFrame::LeaveRoom);
    }

    #[test]
    fn test_server_frames_decode() {
        let frame = ServerFrame::from_text(
            r#"{"event":"room-members","data":{"peerIds":["alice","bob"]}}"#,
        )
        .unwrap();
        assert_eq!(
            frame,
            ServerFrame::RoomMembers {
                peer_ids: vec![ParticipantId::new("alice"), ParticipantId::new("bob")]
            }
        );

        let frame =
            ServerFrame::from_text(r#"{"event":"peer-left","data":{"peerId":"bob"}}"#).unwrap();
        assert_eq!(
            frame,
            ServerFrame::PeerLeft {
                peer_id: ParticipantId::new("bob")
            }
        );

        let frame =
            ServerFrame::from_text(r#"{"event":"close","data":{"reason":"server restart"}}"#)
                .unwrap();
        assert_eq!(
            frame,
            ServerFrame::Close {
                reason: "server restart".to_string()
            }
        );
    }

    #[test]
    fn test_unknown_event_is_protocol_error() {
        let result = ServerFrame::from_text(r#"{"event":"kick","data":{}}"#);
        assert!(matches!(result, Err(SignalingError::Protocol(_))));

        let result = ServerFrame::from_text(
            r#"{"event":"peer-joined","data":{"peerId":"x"}} trailing"#,
        );
        assert!(result.is_err());
    }
}
