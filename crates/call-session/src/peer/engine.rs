//! Media-engine seam.
//!
//! A [`MediaEngine`] builds one [`PeerTransport`] per peer-connection
//! instance. Transports report asynchronous happenings (local candidates,
//! remote media, data, failure) through a [`PeerEventSink`] stamped with the
//! instance's connection id, so events from a torn-down instance can be
//! recognised and dropped.

use crate::errors::PeerError;
use crate::media::{LocalStream, RemoteStream};
use async_trait::async_trait;
use bytes::Bytes;
use common::secret::SecretString;
use common::types::{ParticipantId, Role};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// A STUN/TURN server entry.
#[derive(Debug, Clone)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<SecretString>,
}

/// Trickled network candidate, in the browser `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

/// Everything an engine needs to build a transport.
#[derive(Debug, Clone)]
pub struct TransportSpec {
    pub peer_id: ParticipantId,
    pub connection_id: String,
    pub role: Role,
    pub local_stream: Arc<LocalStream>,
    pub ice_servers: Vec<IceServer>,
}

/// Asynchronous happenings on a transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    RemoteStream(RemoteStream),
    DataChannelOpen,
    DataMessage(Bytes),
    /// Transport-level error; the peer will be destroyed and recreated.
    Failed(String),
    /// Transport closed without a local request.
    Closed,
}

/// A transport event attributed to one peer-connection instance.
#[derive(Debug, Clone)]
pub struct PeerEvent {
    pub peer_id: ParticipantId,
    pub connection_id: String,
    pub event: TransportEvent,
}

/// Stamps and forwards events of one transport instance.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    peer_id: ParticipantId,
    connection_id: String,
    sender: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerEventSink {
    #[must_use]
    pub fn new(
        peer_id: ParticipantId,
        connection_id: String,
        sender: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        Self {
            peer_id,
            connection_id,
            sender,
        }
    }

    /// Forward an event. Dropped silently once the session has stopped.
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.sender.send(PeerEvent {
            peer_id: self.peer_id.clone(),
            connection_id: self.connection_id.clone(),
            event,
        });
    }

    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    #[must_use]
    pub fn peer_id(&self) -> &ParticipantId {
        &self.peer_id
    }
}

/// Builds peer transports.
#[async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    /// Create a transport bound to `spec.local_stream`. The initiator side
    /// creates the data channel; the responder accepts it.
    async fn create_transport(
        &self,
        spec: TransportSpec,
        events: PeerEventSink,
    ) -> Result<Box<dyn PeerTransport>, PeerError>;
}

/// One negotiated (or negotiating) media connection.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Produce and apply a local offer. Returns its SDP.
    async fn create_offer(&self) -> Result<String, PeerError>;

    /// Apply a remote offer and produce the local answer SDP.
    async fn accept_offer(&self, sdp: String) -> Result<String, PeerError>;

    /// Apply the remote answer.
    async fn accept_answer(&self, sdp: String) -> Result<(), PeerError>;

    /// Apply a trickled remote candidate. Only valid once the remote
    /// description is set.
    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    /// Send bytes over the data channel.
    async fn send_data(&self, payload: Bytes) -> Result<(), PeerError>;

    /// Release the transport. Idempotent.
    async fn close(&self);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_candidate_uses_browser_field_names() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 192.0.2.1 54400 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };

        let value = serde_json::to_value(&candidate).unwrap();
        assert_eq!(value["sdpMid"], "0");
        assert_eq!(value["sdpMLineIndex"], 0);

        let parsed: IceCandidate =
            serde_json::from_value(json!({"candidate": "candidate:2"})).unwrap();
        assert_eq!(parsed.sdp_mid, None);
        assert_eq!(parsed.sdp_mline_index, None);
    }

    #[tokio::test]
    async fn test_sink_stamps_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = PeerEventSink::new(ParticipantId::new("bob"), "conn-1".to_string(), tx);

        sink.emit(TransportEvent::DataChannelOpen);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.peer_id, ParticipantId::new("bob"));
        assert_eq!(event.connection_id, "conn-1");
        assert!(matches!(event.event, TransportEvent::DataChannelOpen));
    }
}
