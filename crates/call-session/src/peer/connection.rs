//! Per-remote-participant connection state machine.
//!
//! ```text
//! created -> negotiating -> connected -> closed
//!                 |             |
//!                 +--> failed <-+   (destroyed, then recreated by the manager)
//! ```
//!
//! A peer reaches `connected` only from `negotiating`, and only by binding a
//! remote stream. Leaving through `failed` or `closed` releases the remote
//! stream.
//!
//! Remote candidates that arrive before the remote description are queued
//! and applied, in arrival order, once it is set.
//!
//! The negotiation deadline runs from creation, so a responder that never
//! receives an offer expires like a stalled negotiation does.

use super::engine::{IceCandidate, PeerTransport};
use super::negotiation::{NegotiationBody, NegotiationEnvelope};
use crate::errors::PeerError;
use crate::media::RemoteStream;

use bytes::Bytes;
use common::types::{ParticipantId, Role};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerState {
    Created,
    Negotiating,
    Connected,
    Failed,
    Closed,
}

impl PeerState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerState::Created => "created",
            PeerState::Negotiating => "negotiating",
            PeerState::Connected => "connected",
            PeerState::Failed => "failed",
            PeerState::Closed => "closed",
        }
    }

    /// Whether the peer has left the lifecycle.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, PeerState::Failed | PeerState::Closed)
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One peer-connection instance for a remote participant.
pub struct PeerConnection {
    peer_id: ParticipantId,
    connection_id: String,
    role: Role,
    state: PeerState,
    transport: Box<dyn PeerTransport>,
    /// Instance id of the remote side we are negotiating with.
    remote_connection_id: Option<String>,
    remote_description_set: bool,
    pending_candidates: Vec<(String, IceCandidate)>,
    remote_stream: Option<RemoteStream>,
    data_channel_open: bool,
    /// Start of the current wait for a connection; `None` once settled.
    awaiting_since: Option<Instant>,
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("peer_id", &self.peer_id)
            .field("connection_id", &self.connection_id)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("remote_connection_id", &self.remote_connection_id)
            .field("has_remote_stream", &self.remote_stream.is_some())
            .field("data_channel_open", &self.data_channel_open)
            .finish_non_exhaustive()
    }
}

impl PeerConnection {
    #[must_use]
    pub fn new(
        peer_id: ParticipantId,
        connection_id: String,
        role: Role,
        transport: Box<dyn PeerTransport>,
    ) -> Self {
        Self {
            peer_id,
            connection_id,
            role,
            state: PeerState::Created,
            transport,
            remote_connection_id: None,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            remote_stream: None,
            data_channel_open: false,
            awaiting_since: Some(Instant::now()),
        }
    }

    /// Begin negotiation. The initiator issues the first offer; the
    /// responder waits for one.
    pub async fn start(&mut self) -> Result<Option<NegotiationEnvelope>, PeerError> {
        if !self.role.is_initiator() {
            return Ok(None);
        }
        let sdp = self.transport.create_offer().await?;
        self.transition(PeerState::Negotiating);
        Ok(Some(self.envelope(NegotiationBody::Offer { sdp })))
    }

    /// Apply an inbound negotiation payload. Returns payloads to send back.
    ///
    /// # Errors
    ///
    /// `PeerError::RoleConflict` if the payload could only come from a
    /// participant holding the local role.
    pub async fn apply_remote(
        &mut self,
        envelope: NegotiationEnvelope,
    ) -> Result<Vec<NegotiationEnvelope>, PeerError> {
        if self.state.is_terminal() {
            return Ok(Vec::new());
        }
        let NegotiationEnvelope {
            connection_id: remote_id,
            body,
        } = envelope;

        if body
            .sender_role()
            .is_some_and(|sender| sender != self.role.counterpart())
        {
            return Err(PeerError::RoleConflict(self.role));
        }

        match body {
            NegotiationBody::Offer { sdp } => self.apply_offer(remote_id, sdp).await,
            NegotiationBody::Answer { sdp } => {
                self.apply_answer(remote_id, sdp).await?;
                Ok(Vec::new())
            }
            NegotiationBody::Candidate { candidate } => {
                self.apply_candidate(remote_id, candidate).await;
                Ok(Vec::new())
            }
            NegotiationBody::Restart => Ok(Vec::new()),
        }
    }

    async fn apply_offer(
        &mut self,
        remote_id: String,
        sdp: String,
    ) -> Result<Vec<NegotiationEnvelope>, PeerError> {
        if let Some(current) = &self.remote_connection_id {
            if *current == remote_id {
                debug!(target: "cs.peer", peer_id = %self.peer_id, "Duplicate offer ignored");
                return Ok(Vec::new());
            }
            return Err(PeerError::Negotiation(format!(
                "offer from instance {remote_id} while negotiating with {current}"
            )));
        }

        self.remote_connection_id = Some(remote_id);
        self.transition(PeerState::Negotiating);

        let answer = self.transport.accept_offer(sdp).await?;
        self.remote_description_set = true;
        self.flush_candidates().await;

        Ok(vec![self.envelope(NegotiationBody::Answer { sdp: answer })])
    }

    async fn apply_answer(&mut self, remote_id: String, sdp: String) -> Result<(), PeerError> {
        if self.state != PeerState::Negotiating {
            debug!(target: "cs.peer", peer_id = %self.peer_id, state = %self.state, "Unexpected answer ignored");
            return Ok(());
        }
        if self.remote_description_set {
            debug!(target: "cs.peer", peer_id = %self.peer_id, "Duplicate answer ignored");
            return Ok(());
        }

        self.remote_connection_id = Some(remote_id);
        self.transport.accept_answer(sdp).await?;
        self.remote_description_set = true;
        self.flush_candidates().await;
        Ok(())
    }

    async fn apply_candidate(&mut self, remote_id: String, candidate: IceCandidate) {
        if let Some(current) = &self.remote_connection_id {
            if *current != remote_id {
                debug!(target: "cs.peer", peer_id = %self.peer_id, "Stale candidate dropped");
                return;
            }
        }
        if !self.remote_description_set {
            self.pending_candidates.push((remote_id, candidate));
            return;
        }
        if let Err(e) = self.transport.add_remote_candidate(candidate).await {
            warn!(target: "cs.peer", peer_id = %self.peer_id, error = %e, "Remote candidate rejected");
        }
    }

    async fn flush_candidates(&mut self) {
        let pending = std::mem::take(&mut self.pending_candidates);
        for (remote_id, candidate) in pending {
            if self.remote_connection_id.as_deref() != Some(remote_id.as_str()) {
                continue;
            }
            if let Err(e) = self.transport.add_remote_candidate(candidate).await {
                warn!(target: "cs.peer", peer_id = %self.peer_id, error = %e, "Queued candidate rejected");
            }
        }
    }

    /// Bind the negotiated remote stream. Returns `true` if the peer became
    /// connected.
    pub fn bind_remote_stream(&mut self, stream: RemoteStream) -> bool {
        if self.state != PeerState::Negotiating || stream.is_empty() {
            debug!(
                target: "cs.peer",
                peer_id = %self.peer_id,
                state = %self.state,
                "Remote stream outside negotiation ignored"
            );
            return false;
        }
        self.remote_stream = Some(stream);
        self.transition(PeerState::Connected);
        true
    }

    pub fn mark_data_channel_open(&mut self) {
        if !self.state.is_terminal() {
            self.data_channel_open = true;
        }
    }

    /// Enter `failed`, releasing the remote stream and the transport.
    /// Returns the state the peer was in.
    pub async fn fail(&mut self, reason: &str) -> PeerState {
        let previous = self.state;
        if previous.is_terminal() {
            return previous;
        }
        warn!(
            target: "cs.peer",
            peer_id = %self.peer_id,
            connection_id = %self.connection_id,
            state = %previous,
            reason = reason,
            "Peer connection failed"
        );
        self.transition(PeerState::Failed);
        self.release();
        self.transport.close().await;
        previous
    }

    /// Enter `closed`, releasing the remote stream and the transport.
    /// Returns the state the peer was in.
    pub async fn close(&mut self) -> PeerState {
        let previous = self.state;
        if previous == PeerState::Closed {
            return previous;
        }
        self.transition(PeerState::Closed);
        self.release();
        self.transport.close().await;
        previous
    }

    fn release(&mut self) {
        self.remote_stream = None;
        self.data_channel_open = false;
        self.pending_candidates.clear();
        self.awaiting_since = None;
    }

    /// Send bytes over the data channel.
    pub async fn send_data(&self, payload: Bytes) -> Result<(), PeerError> {
        if !self.data_channel_open {
            return Err(PeerError::DataChannelUnavailable);
        }
        self.transport.send_data(payload).await
    }

    /// Whether the peer has waited at least `timeout` for a connection,
    /// counted from creation or from the start of negotiation.
    #[must_use]
    pub fn negotiation_expired(&self, now: Instant, timeout: Duration) -> bool {
        matches!(self.state, PeerState::Created | PeerState::Negotiating)
            && self
                .awaiting_since
                .is_some_and(|since| now.duration_since(since) >= timeout)
    }

    fn transition(&mut self, next: PeerState) {
        if self.state == next {
            return;
        }
        debug!(
            target: "cs.peer",
            peer_id = %self.peer_id,
            connection_id = %self.connection_id,
            from = %self.state,
            to = %next,
            "Peer state transition"
        );
        match next {
            PeerState::Negotiating => self.awaiting_since = Some(Instant::now()),
            PeerState::Connected => self.awaiting_since = None,
            _ => {}
        }
        self.state = next;
    }

    fn envelope(&self, body: NegotiationBody) -> NegotiationEnvelope {
        NegotiationEnvelope::new(&self.connection_id, body)
    }

    /// Wrap a locally discovered candidate for sending.
    #[must_use]
    pub fn candidate_envelope(&self, candidate: IceCandidate) -> NegotiationEnvelope {
        self.envelope(NegotiationBody::Candidate { candidate })
    }

    #[must_use]
    pub fn peer_id(&self) -> &ParticipantId {
        &self.peer_id
    }

    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    #[must_use]
    pub fn remote_connection_id(&self) -> Option<&str> {
        self.remote_connection_id.as_deref()
    }

    #[must_use]
    pub fn state(&self) -> PeerState {
        self.state
    }

    #[must_use]
    pub fn remote_stream(&self) -> Option<&RemoteStream> {
        self.remote_stream.as_ref()
    }

    #[must_use]
    pub fn is_data_channel_open(&self) -> bool {
        self.data_channel_open
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::media::TrackKind;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct FakeTransport {
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl FakeTransport {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl PeerTransport for FakeTransport {
        async fn create_offer(&self) -> Result<String, PeerError> {
            self.record("create_offer".to_string());
            Ok("offer-sdp".to_string())
        }

        async fn accept_offer(&self, sdp: String) -> Result<String, PeerError> {
            self.record(format!("accept_offer:{sdp}"));
            Ok("answer-sdp".to_string())
        }

        async fn accept_answer(&self, sdp: String) -> Result<(), PeerError> {
            self.record(format!("accept_answer:{sdp}"));
            Ok(())
        }

        async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
            self.record(format!("candidate:{}", candidate.candidate));
            Ok(())
        }

        async fn send_data(&self, payload: Bytes) -> Result<(), PeerError> {
            self.record(format!("send:{}", payload.len()));
            Ok(())
        }

        async fn close(&self) {
            self.record("close".to_string());
        }
    }

    fn peer(role: Role) -> (PeerConnection, FakeTransport) {
        let transport = FakeTransport::default();
        let pc = PeerConnection::new(
            ParticipantId::new("bob"),
            "local-1".to_string(),
            role,
            Box::new(transport.clone()),
        );
        (pc, transport)
    }

    fn candidate(remote: &str, name: &str) -> NegotiationEnvelope {
        NegotiationEnvelope::new(
            remote,
            NegotiationBody::Candidate {
                candidate: IceCandidate {
                    candidate: name.to_string(),
                    sdp_mid: None,
                    sdp_mline_index: None,
                },
            },
        )
    }

    fn stream() -> RemoteStream {
        RemoteStream::new("remote", TrackKind::Video).1
    }

    #[tokio::test]
    async fn test_initiator_offers_and_enters_negotiating() {
        let (mut pc, transport) = peer(Role::Initiator);

        let offer = pc.start().await.unwrap().unwrap();

        assert_eq!(pc.state(), PeerState::Negotiating);
        assert_eq!(offer.connection_id, "local-1");
        assert_eq!(
            offer.body,
            NegotiationBody::Offer {
                sdp: "offer-sdp".to_string()
            }
        );
        assert_eq!(transport.calls(), vec!["create_offer"]);
    }

    #[tokio::test]
    async fn test_responder_waits_for_offer() {
        let (mut pc, transport) = peer(Role::Responder);

        assert!(pc.start().await.unwrap().is_none());
        assert_eq!(pc.state(), PeerState::Created);
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_created_never_jumps_to_connected() {
        let (mut pc, _) = peer(Role::Responder);

        assert!(!pc.bind_remote_stream(stream()));
        assert_eq!(pc.state(), PeerState::Created);
        assert!(pc.remote_stream().is_none());
    }

    #[tokio::test]
    async fn test_early_candidates_are_queued_until_offer() {
        let (mut pc, transport) = peer(Role::Responder);

        pc.apply_remote(candidate("remote-1", "c1")).await.unwrap();
        pc.apply_remote(candidate("remote-1", "c2")).await.unwrap();
        pc.apply_remote(candidate("remote-0", "stale")).await.unwrap();
        assert!(transport.calls().is_empty());

        let replies = pc
            .apply_remote(NegotiationEnvelope::new(
                "remote-1",
                NegotiationBody::Offer {
                    sdp: "their-offer".to_string(),
                },
            ))
            .await
            .unwrap();

        assert_eq!(pc.state(), PeerState::Negotiating);
        assert_eq!(pc.remote_connection_id(), Some("remote-1"));
        assert_eq!(
            replies,
            vec![NegotiationEnvelope::new(
                "local-1",
                NegotiationBody::Answer {
                    sdp: "answer-sdp".to_string()
                }
            )]
        );
        assert_eq!(
            transport.calls(),
            vec!["accept_offer:their-offer", "candidate:c1", "candidate:c2"]
        );

        pc.apply_remote(candidate("remote-1", "c3")).await.unwrap();
        pc.apply_remote(candidate("remote-0", "late-stale")).await.unwrap();
        assert_eq!(transport.calls().last().unwrap(), "candidate:c3");
        assert_eq!(transport.calls().len(), 4);
    }

    #[tokio::test]
    async fn test_offer_from_other_instance_is_rejected() {
        let (mut pc, _) = peer(Role::Responder);
        let offer = |remote: &str| {
            NegotiationEnvelope::new(
                remote,
                NegotiationBody::Offer {
                    sdp: "o".to_string(),
                },
            )
        };

        pc.apply_remote(offer("remote-1")).await.unwrap();
        assert!(pc.apply_remote(offer("remote-1")).await.unwrap().is_empty());
        assert!(matches!(
            pc.apply_remote(offer("remote-2")).await,
            Err(PeerError::Negotiation(_))
        ));
    }

    #[tokio::test]
    async fn test_answer_applied_once() {
        let (mut pc, transport) = peer(Role::Initiator);
        pc.start().await.unwrap();
        let answer = |remote: &str| {
            NegotiationEnvelope::new(
                remote,
                NegotiationBody::Answer {
                    sdp: format!("answer-from-{remote}"),
                },
            )
        };

        pc.apply_remote(answer("remote-1")).await.unwrap();
        pc.apply_remote(answer("remote-2")).await.unwrap();

        assert_eq!(pc.remote_connection_id(), Some("remote-1"));
        assert_eq!(
            transport.calls(),
            vec!["create_offer", "accept_answer:answer-from-remote-1"]
        );
    }

    #[tokio::test]
    async fn test_connected_peer_holds_stream_until_failure() {
        let (mut pc, transport) = peer(Role::Initiator);
        pc.start().await.unwrap();

        assert!(pc.bind_remote_stream(stream()));
        assert_eq!(pc.state(), PeerState::Connected);
        assert!(pc.remote_stream().is_some_and(|s| !s.is_empty()));

        let previous = pc.fail("ice failed").await;
        assert_eq!(previous, PeerState::Connected);
        assert_eq!(pc.state(), PeerState::Failed);
        assert!(pc.remote_stream().is_none());
        assert_eq!(transport.calls().last().unwrap(), "close");

        // Terminal peers ignore further negotiation.
        assert!(pc
            .apply_remote(candidate("remote-1", "c"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_close_releases_stream() {
        let (mut pc, _) = peer(Role::Initiator);
        pc.start().await.unwrap();
        pc.bind_remote_stream(stream());
        pc.mark_data_channel_open();

        assert_eq!(pc.close().await, PeerState::Connected);
        assert_eq!(pc.state(), PeerState::Closed);
        assert!(pc.remote_stream().is_none());
        assert!(!pc.is_data_channel_open());
        assert_eq!(pc.close().await, PeerState::Closed);
    }

    #[tokio::test]
    async fn test_send_requires_open_data_channel() {
        let (mut pc, transport) = peer(Role::Initiator);

        assert_eq!(
            pc.send_data(Bytes::from_static(b"hi")).await,
            Err(PeerError::DataChannelUnavailable)
        );

        pc.mark_data_channel_open();
        pc.send_data(Bytes::from_static(b"hi")).await.unwrap();
        assert_eq!(transport.calls(), vec!["send:2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_negotiation_expiry() {
        let (mut pc, _) = peer(Role::Initiator);
        tokio::time::advance(Duration::from_secs(10)).await;

        // The clock restarts when negotiation begins.
        pc.start().await.unwrap();
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!pc.negotiation_expired(Instant::now(), Duration::from_secs(30)));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(pc.negotiation_expired(Instant::now(), Duration::from_secs(30)));

        pc.bind_remote_stream(stream());
        assert!(!pc.negotiation_expired(Instant::now(), Duration::from_secs(30)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_responder_without_offer_expires() {
        let (mut pc, _) = peer(Role::Responder);
        pc.start().await.unwrap();

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!pc.negotiation_expired(Instant::now(), Duration::from_secs(30)));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(pc.state(), PeerState::Created);
        assert!(pc.negotiation_expired(Instant::now(), Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn test_offer_to_initiator_is_role_conflict() {
        let (mut pc, transport) = peer(Role::Initiator);
        pc.start().await.unwrap();

        let result = pc
            .apply_remote(NegotiationEnvelope::new(
                "remote-1",
                NegotiationBody::Offer {
                    sdp: "their-offer".to_string(),
                },
            ))
            .await;

        assert_eq!(result, Err(PeerError::RoleConflict(Role::Initiator)));
        assert_eq!(transport.calls(), vec!["create_offer"]);
    }

    #[tokio::test]
    async fn test_restart_to_responder_is_role_conflict() {
        let (mut pc, _) = peer(Role::Responder);

        let result = pc
            .apply_remote(NegotiationEnvelope::new("remote-1", NegotiationBody::Restart))
            .await;

        assert_eq!(result, Err(PeerError::RoleConflict(Role::Responder)));
        assert_eq!(pc.state(), PeerState::Created);
    }
}
