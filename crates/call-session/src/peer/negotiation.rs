//! Negotiation payloads carried inside `signal` frames.
//!
//! Every payload names the sender's current peer-connection instance
//! (`connectionId`). The receiver uses it to discard payloads meant for an
//! instance it has since replaced, and to notice that the other side was
//! rebuilt:
//!
//! - an offer from an unknown instance makes the responder rebuild its peer
//! - a `restart` from a rebuilt responder makes the initiator rebuild and re-offer
//!
//! Offers only come from an initiator; answers and restarts only from a
//! responder. A payload implying the local role on the far side is a role
//! conflict.

use super::engine::IceCandidate;
use crate::errors::PeerError;
use common::types::Role;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiationEnvelope {
    pub connection_id: String,
    #[serde(flatten)]
    pub body: NegotiationBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum NegotiationBody {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: IceCandidate },
    /// Sent by a responder whose peer instance is new.
    Restart,
}

impl NegotiationBody {
    /// Role the sender must hold to send this payload. Candidates flow both
    /// ways.
    #[must_use]
    pub fn sender_role(&self) -> Option<Role> {
        match self {
            NegotiationBody::Offer { .. } => Some(Role::Initiator),
            NegotiationBody::Answer { .. } | NegotiationBody::Restart => Some(Role::Responder),
            NegotiationBody::Candidate { .. } => None,
        }
    }
}

impl NegotiationEnvelope {
    #[must_use]
    pub fn new(connection_id: &str, body: NegotiationBody) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            body,
        }
    }

    /// Encode as an opaque signal payload.
    pub fn to_payload(&self) -> Result<Value, PeerError> {
        serde_json::to_value(self).map_err(|e| PeerError::MalformedSignal(e.to_string()))
    }

    /// Decode an opaque signal payload.
    pub fn from_payload(payload: Value) -> Result<Self, PeerError> {
        serde_json::from_value(payload).map_err(|e| PeerError::MalformedSignal(e.to_string()))
    }

    /// Short label for logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self.body {
            NegotiationBody::Offer { .. } => "offer",
            NegotiationBody::Answer { .. } => "answer",
            NegotiationBody::Candidate { .. } => "candidate",
            NegotiationBody::Restart => "restart",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_offer_payload_shape() {
        let envelope = NegotiationEnvelope::new(
            "conn-a",
            NegotiationBody::Offer {
                sdp: "v=0".to_string(),
            },
        );

        assert_eq!(
            envelope.to_payload().unwrap(),
            json!({"connectionId": "conn-a", "type": "offer", "sdp": "v=0"})
        );
    }

    #[test]
    fn test_candidate_payload_decodes() {
        let payload = json!({
            "connectionId": "conn-b",
            "type": "candidate",
            "candidate": {"candidate": "candidate:1", "sdpMid": "0", "sdpMLineIndex": 0}
        });

        let envelope = NegotiationEnvelope::from_payload(payload).unwrap();
        assert_eq!(envelope.connection_id, "conn-b");
        assert_eq!(envelope.kind(), "candidate");
        assert!(matches!(
            envelope.body,
            NegotiationBody::Candidate { candidate } if candidate.sdp_mline_index == Some(0)
        ));
    }

    #[test]
    fn test_restart_has_no_fields() {
        let envelope = NegotiationEnvelope::new("conn-c", NegotiationBody::Restart);
        assert_eq!(
            envelope.to_payload().unwrap(),
            json!({"connectionId": "conn-c", "type": "restart"})
        );
    }

    #[test]
    fn test_sender_role_follows_payload_kind() {
        let sdp = || "v=0".to_string();
        assert_eq!(
            NegotiationBody::Offer { sdp: sdp() }.sender_role(),
            Some(Role::Initiator)
        );
        assert_eq!(
            NegotiationBody::Answer { sdp: sdp() }.sender_role(),
            Some(Role::Responder)
        );
        assert_eq!(NegotiationBody::Restart.sender_role(), Some(Role::Responder));

        let candidate = NegotiationBody::Candidate {
            candidate: IceCandidate {
                candidate: "candidate:1".to_string(),
                sdp_mid: None,
                sdp_mline_index: None,
            },
        };
        assert_eq!(candidate.sender_role(), None);
    }

    #[test]
    fn test_foreign_payload_is_malformed() {
        let result = NegotiationEnvelope::from_payload(json!({"type": "offer", "sdp": "v=0"}));
        assert!(matches!(result, Err(PeerError::MalformedSignal(_))));

        let result = NegotiationEnvelope::from_payload(json!({"connectionId": "x", "type": "pranswer"}));
        assert!(result.is_err());
    }
}
