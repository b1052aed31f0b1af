//! In-memory media engine.
//!
//! Every `MockMediaEngine` built from the same `MockNetwork` can reach the
//! others. SDP is a token naming the connection that produced it
//! (`mock-offer:<connection id>`, `mock-answer:<connection id>`), which is
//! how the two ends of a call find each other. Once the initiator applies
//! the answer, both ends report a remote stream (with one decodable frame)
//! and an open data channel.
//!
//! Faults can be injected per link or per engine.

use async_trait::async_trait;
use bytes::Bytes;
use call_session::errors::PeerError;
use call_session::media::{ImageCapture, RemoteStream, RemoteStreamFeed, TrackKind};
use call_session::peer::{
    IceCandidate, MediaEngine, PeerEventSink, PeerTransport, TransportEvent, TransportSpec,
};
use common::types::ParticipantId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const OFFER_PREFIX: &str = "mock-offer:";
const ANSWER_PREFIX: &str = "mock-answer:";

/// VP8 keyframe header for a 640x480 frame.
pub const MOCK_KEYFRAME: &[u8] = &[0x10, 0x02, 0x00, 0x9d, 0x01, 0x2a, 0x80, 0x02, 0xe0, 0x01];

/// Shared medium connecting mock transports.
#[derive(Debug, Clone, Default)]
pub struct MockNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

#[derive(Debug, Default)]
struct NetworkInner {
    endpoints: HashMap<String, Endpoint>,
    transports_created: usize,
    /// Remaining forced `create_transport` failures per local participant.
    failing_creates: HashMap<ParticipantId, usize>,
    candidates_applied: usize,
}

#[derive(Debug)]
struct Endpoint {
    local_id: ParticipantId,
    peer_id: ParticipantId,
    sink: PeerEventSink,
    remote: Option<String>,
    closed: bool,
    /// Keeps the remote stream fed for the lifetime of the endpoint.
    feed: Option<RemoteStreamFeed>,
}

impl NetworkInner {
    fn open_endpoint(&self, connection_id: &str) -> Result<&Endpoint, PeerError> {
        self.endpoints
            .get(connection_id)
            .filter(|e| !e.closed)
            .ok_or_else(|| PeerError::Engine(format!("transport {connection_id} is closed")))
    }

    /// Give `connection_id` a remote stream and an open data channel.
    fn establish(&mut self, connection_id: &str) {
        let Some(endpoint) = self.endpoints.get_mut(connection_id) else {
            return;
        };
        if endpoint.closed {
            return;
        }
        let (feed, stream) = RemoteStream::new(format!("stream-{connection_id}"), TrackKind::Audio);
        feed.add_track(TrackKind::Video);
        feed.push_frame(ImageCapture::from_vp8(Bytes::from_static(MOCK_KEYFRAME)));
        endpoint.feed = Some(feed);
        endpoint.sink.emit(TransportEvent::RemoteStream(stream));
        endpoint.sink.emit(TransportEvent::DataChannelOpen);
    }
}

impl MockNetwork {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine for the participant `local_id`.
    #[must_use]
    pub fn engine(&self, local_id: impl Into<ParticipantId>) -> MockMediaEngine {
        MockMediaEngine {
            network: self.clone(),
            local_id: local_id.into(),
        }
    }

    /// Total transports built by all engines.
    #[must_use]
    pub fn transports_created(&self) -> usize {
        self.inner.lock().unwrap().transports_created
    }

    /// Open transports owned by `local_id` towards `peer_id`.
    #[must_use]
    pub fn open_transports(&self, local_id: &ParticipantId, peer_id: &ParticipantId) -> usize {
        self.inner
            .lock()
            .unwrap()
            .endpoints
            .values()
            .filter(|e| !e.closed && &e.local_id == local_id && &e.peer_id == peer_id)
            .count()
    }

    /// Remote candidates applied by all transports.
    #[must_use]
    pub fn candidates_applied(&self) -> usize {
        self.inner.lock().unwrap().candidates_applied
    }

    /// Make the next `count` transport creations of `local_id` fail.
    pub fn fail_next_creates(&self, local_id: impl Into<ParticipantId>, count: usize) {
        self.inner
            .lock()
            .unwrap()
            .failing_creates
            .insert(local_id.into(), count);
    }

    /// Report a transport failure on every open transport of `local_id`
    /// towards `peer_id`. Returns how many were failed.
    pub fn fail_link(&self, local_id: &ParticipantId, peer_id: &ParticipantId) -> usize {
        let inner = self.inner.lock().unwrap();
        let mut failed = 0;
        for endpoint in inner
            .endpoints
            .values()
            .filter(|e| !e.closed && &e.local_id == local_id && &e.peer_id == peer_id)
        {
            endpoint
                .sink
                .emit(TransportEvent::Failed("injected failure".to_string()));
            failed += 1;
        }
        failed
    }
}

/// `MediaEngine` over a `MockNetwork`.
#[derive(Debug, Clone)]
pub struct MockMediaEngine {
    network: MockNetwork,
    local_id: ParticipantId,
}

#[async_trait]
impl MediaEngine for MockMediaEngine {
    async fn create_transport(
        &self,
        spec: TransportSpec,
        events: PeerEventSink,
    ) -> Result<Box<dyn PeerTransport>, PeerError> {
        let mut inner = self.network.inner.lock().unwrap();
        if let Some(remaining) = inner.failing_creates.get_mut(&self.local_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(PeerError::Engine("injected create failure".to_string()));
            }
        }

        inner.transports_created += 1;
        inner.endpoints.insert(
            spec.connection_id.clone(),
            Endpoint {
                local_id: self.local_id.clone(),
                peer_id: spec.peer_id.clone(),
                sink: events,
                remote: None,
                closed: false,
                feed: None,
            },
        );

        Ok(Box::new(MockTransport {
            network: self.network.clone(),
            connection_id: spec.connection_id,
        }))
    }
}

/// One end of a mock link.
#[derive(Debug)]
pub struct MockTransport {
    network: MockNetwork,
    connection_id: String,
}

impl MockTransport {
    fn trickle(&self, inner: &NetworkInner) {
        if let Some(endpoint) = inner.endpoints.get(&self.connection_id) {
            endpoint.sink.emit(TransportEvent::LocalCandidate(IceCandidate {
                candidate: format!("candidate:{} 1 udp 1 127.0.0.1 9 typ host", self.connection_id),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            }));
        }
    }
}

fn token<'a>(sdp: &'a str, prefix: &str) -> Result<&'a str, PeerError> {
    sdp.strip_prefix(prefix)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| PeerError::Negotiation(format!("unexpected SDP: {sdp}")))
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn create_offer(&self) -> Result<String, PeerError> {
        let inner = self.network.inner.lock().unwrap();
        inner.open_endpoint(&self.connection_id)?;
        self.trickle(&inner);
        Ok(format!("{OFFER_PREFIX}{}", self.connection_id))
    }

    async fn accept_offer(&self, sdp: String) -> Result<String, PeerError> {
        let remote = token(&sdp, OFFER_PREFIX)?.to_string();
        let mut inner = self.network.inner.lock().unwrap();
        inner.open_endpoint(&self.connection_id)?;
        if let Some(endpoint) = inner.endpoints.get_mut(&self.connection_id) {
            endpoint.remote = Some(remote);
        }
        self.trickle(&inner);
        Ok(format!("{ANSWER_PREFIX}{}", self.connection_id))
    }

    async fn accept_answer(&self, sdp: String) -> Result<(), PeerError> {
        let remote = token(&sdp, ANSWER_PREFIX)?.to_string();
        let mut inner = self.network.inner.lock().unwrap();
        inner.open_endpoint(&self.connection_id)?;
        if let Some(endpoint) = inner.endpoints.get_mut(&self.connection_id) {
            endpoint.remote = Some(remote.clone());
        }
        inner.establish(&self.connection_id);
        inner.establish(&remote);
        Ok(())
    }

    async fn add_remote_candidate(&self, _candidate: IceCandidate) -> Result<(), PeerError> {
        let mut inner = self.network.inner.lock().unwrap();
        inner.open_endpoint(&self.connection_id)?;
        inner.candidates_applied += 1;
        Ok(())
    }

    async fn send_data(&self, payload: Bytes) -> Result<(), PeerError> {
        let inner = self.network.inner.lock().unwrap();
        let endpoint = inner.open_endpoint(&self.connection_id)?;
        let remote = endpoint
            .remote
            .as_deref()
            .ok_or(PeerError::DataChannelUnavailable)?;
        let remote = inner
            .open_endpoint(remote)
            .map_err(|_| PeerError::DataChannelUnavailable)?;
        remote.sink.emit(TransportEvent::DataMessage(payload));
        Ok(())
    }

    async fn close(&self) {
        let mut inner = self.network.inner.lock().unwrap();
        let remote = match inner.endpoints.get_mut(&self.connection_id) {
            Some(endpoint) if !endpoint.closed => {
                endpoint.closed = true;
                endpoint.feed = None;
                endpoint.remote.clone()
            }
            _ => return,
        };
        // The far end notices the link going away.
        if let Some(remote) = remote.and_then(|id| inner.endpoints.get(&id)) {
            if !remote.closed {
                remote.sink.emit(TransportEvent::Closed);
            }
        }
    }
}
