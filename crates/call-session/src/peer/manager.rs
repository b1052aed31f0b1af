//! Peer registry: one [`PeerConnection`] per remote participant.
//!
//! The manager owns every peer instance and is the only place instances are
//! created or destroyed. It is driven by the session actor, one reaction at
//! a time, and reports what the session must do next as [`PeerEffects`].
//!
//! Failure handling is destroy-and-recreate: a failed instance is dropped
//! and a fresh one is built after the recreate delay. Negotiation is never
//! resumed on a failed instance. Once [`PeerManager::begin_teardown`] is
//! called no instance is ever built again.
//!
//! A role conflict (the remote participant holds the local role) is not
//! recoverable: the peer is dropped without a rebuild and the session is
//! told through [`PeerNotice::RoleConflict`].

use super::connection::{PeerConnection, PeerState};
use super::engine::{
    IceServer, MediaEngine, PeerEvent, PeerEventSink, TransportEvent, TransportSpec,
};
use super::negotiation::{NegotiationBody, NegotiationEnvelope};
use crate::config::Config;
use crate::errors::PeerError;
use crate::media::{LocalStream, RemoteStream};
use crate::observability::metrics;

use bytes::Bytes;
use common::types::{ParticipantId, Role};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Signals buffered per unknown peer before the oldest is dropped.
pub const MAX_PENDING_SIGNALS: usize = 64;

/// Why a peer instance is being rebuilt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecreateReason {
    /// The engine could not build a transport.
    Engine,
    /// The transport reported an error.
    TransportFailed,
    /// The transport closed without a local request.
    TransportClosed,
    /// Applying a remote payload failed.
    Negotiation,
    /// Negotiation did not complete in time.
    Timeout,
    /// The responder announced a new instance.
    RemoteRestart,
    /// The initiator offered from a new instance.
    RemoteOffer,
}

impl RecreateReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RecreateReason::Engine => "engine",
            RecreateReason::TransportFailed => "transport_failed",
            RecreateReason::TransportClosed => "transport_closed",
            RecreateReason::Negotiation => "negotiation",
            RecreateReason::Timeout => "timeout",
            RecreateReason::RemoteRestart => "remote_restart",
            RecreateReason::RemoteOffer => "remote_offer",
        }
    }
}

/// A negotiation payload to relay through signaling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundSignal {
    pub to: ParticipantId,
    pub envelope: NegotiationEnvelope,
}

/// Something the session must surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerNotice {
    Connected { peer_id: ParticipantId },
    Disconnected { peer_id: ParticipantId },
    Data { from: ParticipantId, payload: Bytes },
    /// Both participants hold `role`.
    RoleConflict { peer_id: ParticipantId, role: Role },
}

/// Result of one manager reaction.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PeerEffects {
    pub outbound: Vec<OutboundSignal>,
    pub notices: Vec<PeerNotice>,
}

impl PeerEffects {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.notices.is_empty()
    }

    fn send(&mut self, to: &ParticipantId, envelope: NegotiationEnvelope) {
        self.outbound.push(OutboundSignal {
            to: to.clone(),
            envelope,
        });
    }
}

/// Point-in-time view of one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub peer_id: ParticipantId,
    pub connection_id: String,
    pub state: PeerState,
    pub has_remote_stream: bool,
    pub data_channel_open: bool,
}

#[derive(Debug, Clone)]
pub struct PeerManagerSettings {
    pub ice_servers: Vec<IceServer>,
    pub recreate_delay: Duration,
    /// `None` disables the negotiation timeout.
    pub negotiation_timeout: Option<Duration>,
}

impl From<&Config> for PeerManagerSettings {
    fn from(config: &Config) -> Self {
        let ice_servers = if config.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![IceServer {
                urls: config.ice_servers.clone(),
                username: config.turn_username.clone(),
                credential: config.turn_credential.clone(),
            }]
        };
        Self {
            ice_servers,
            recreate_delay: config.peer_recreate_delay,
            negotiation_timeout: config.negotiation_timeout,
        }
    }
}

enum Route {
    Done,
    Rebuild {
        reason: RecreateReason,
        announce: bool,
        replay: Option<NegotiationEnvelope>,
    },
}

pub struct PeerManager {
    engine: Arc<dyn MediaEngine>,
    local_stream: Arc<LocalStream>,
    role: Role,
    settings: PeerManagerSettings,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    peers: HashMap<ParticipantId, PeerConnection>,
    pending_signals: HashMap<ParticipantId, VecDeque<NegotiationEnvelope>>,
    recreate_at: HashMap<ParticipantId, Instant>,
    closing: bool,
}

impl PeerManager {
    /// Create a manager. Transport events for every instance arrive on the
    /// returned receiver and must be fed back through [`Self::handle_event`].
    #[must_use]
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        local_stream: Arc<LocalStream>,
        role: Role,
        settings: PeerManagerSettings,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let manager = Self {
            engine,
            local_stream,
            role,
            settings,
            events_tx,
            peers: HashMap::new(),
            pending_signals: HashMap::new(),
            recreate_at: HashMap::new(),
            closing: false,
        };
        (manager, events_rx)
    }

    /// Create a peer for a newly admitted participant. No-op if one exists.
    pub async fn create_peer(&mut self, peer_id: &ParticipantId) -> PeerEffects {
        let mut effects = PeerEffects::default();
        if self.closing || self.peers.contains_key(peer_id) {
            return effects;
        }
        self.recreate_at.remove(peer_id);
        if self.build_peer(peer_id, true, &mut effects).await {
            self.replay_pending(peer_id, &mut effects).await;
        }
        effects
    }

    /// Tear down the peer of a participant that left. Cancels any pending
    /// rebuild.
    pub async fn remove_peer(&mut self, peer_id: &ParticipantId) -> PeerEffects {
        let mut effects = PeerEffects::default();
        self.pending_signals.remove(peer_id);
        self.recreate_at.remove(peer_id);
        if let Some(mut peer) = self.peers.remove(peer_id) {
            info!(target: "cs.peer", peer_id = %peer_id, "Removing peer");
            if peer.close().await == PeerState::Connected {
                effects.notices.push(PeerNotice::Disconnected {
                    peer_id: peer_id.clone(),
                });
            }
            metrics::set_active_peers(self.peers.len());
        }
        effects
    }

    /// Route an inbound negotiation payload from `from`.
    pub async fn handle_signal(
        &mut self,
        from: &ParticipantId,
        envelope: NegotiationEnvelope,
    ) -> PeerEffects {
        let mut effects = PeerEffects::default();
        if !self.closing {
            self.deliver(from, envelope, &mut effects).await;
        }
        effects
    }

    /// React to a transport event. Events from replaced instances are
    /// dropped.
    pub async fn handle_event(&mut self, event: PeerEvent) -> PeerEffects {
        let mut effects = PeerEffects::default();
        if self.closing {
            return effects;
        }
        let PeerEvent {
            peer_id,
            connection_id,
            event,
        } = event;

        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return effects;
        };
        if peer.connection_id() != connection_id {
            debug!(target: "cs.peer", peer_id = %peer_id, "Event from replaced instance dropped");
            return effects;
        }

        match event {
            TransportEvent::LocalCandidate(candidate) => {
                let envelope = peer.candidate_envelope(candidate);
                effects.send(&peer_id, envelope);
            }
            TransportEvent::RemoteStream(stream) => {
                if peer.bind_remote_stream(stream) {
                    info!(target: "cs.peer", peer_id = %peer_id, "Peer connected");
                    effects.notices.push(PeerNotice::Connected { peer_id });
                }
            }
            TransportEvent::DataChannelOpen => peer.mark_data_channel_open(),
            TransportEvent::DataMessage(payload) => {
                effects.notices.push(PeerNotice::Data {
                    from: peer_id,
                    payload,
                });
            }
            TransportEvent::Failed(reason) => {
                self.fail_peer(&peer_id, &reason, RecreateReason::TransportFailed, &mut effects)
                    .await;
            }
            TransportEvent::Closed => {
                self.fail_peer(
                    &peer_id,
                    "transport closed",
                    RecreateReason::TransportClosed,
                    &mut effects,
                )
                .await;
            }
        }
        effects
    }

    /// Fail peers whose negotiation has hung and rebuild peers whose
    /// recreate delay has elapsed.
    pub async fn check_deadlines(&mut self, now: Instant) -> PeerEffects {
        let mut effects = PeerEffects::default();
        if self.closing {
            return effects;
        }

        if let Some(timeout) = self.settings.negotiation_timeout {
            let expired: Vec<ParticipantId> = self
                .peers
                .values()
                .filter(|peer| peer.negotiation_expired(now, timeout))
                .map(|peer| peer.peer_id().clone())
                .collect();
            for peer_id in expired {
                metrics::record_negotiation_timeout();
                self.fail_peer(
                    &peer_id,
                    "negotiation timed out",
                    RecreateReason::Timeout,
                    &mut effects,
                )
                .await;
            }
        }

        let due: Vec<ParticipantId> = self
            .recreate_at
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(peer_id, _)| peer_id.clone())
            .collect();
        for peer_id in due {
            self.recreate_at.remove(&peer_id);
            if self.peers.contains_key(&peer_id) {
                continue;
            }
            debug!(target: "cs.peer", peer_id = %peer_id, "Recreating peer");
            if self.build_peer(&peer_id, true, &mut effects).await {
                self.replay_pending(&peer_id, &mut effects).await;
            }
        }

        effects
    }

    /// Stop all rebuilding. Called first thing on session teardown.
    pub fn begin_teardown(&mut self) {
        self.closing = true;
        self.recreate_at.clear();
        self.pending_signals.clear();
    }

    /// Close every peer. Implies [`Self::begin_teardown`].
    pub async fn close_all(&mut self) -> PeerEffects {
        self.begin_teardown();
        let mut effects = PeerEffects::default();
        for (peer_id, mut peer) in self.peers.drain() {
            if peer.close().await == PeerState::Connected {
                effects.notices.push(PeerNotice::Disconnected { peer_id });
            }
        }
        metrics::set_active_peers(0);
        effects
    }

    /// Send bytes to every peer with an open data channel. Returns how many
    /// peers accepted it.
    pub async fn broadcast_data(&self, payload: &Bytes) -> Result<usize, PeerError> {
        let mut delivered = 0;
        let mut last_error = None;
        for peer in self.peers.values().filter(|p| p.is_data_channel_open()) {
            match peer.send_data(payload.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(target: "cs.peer", peer_id = %peer.peer_id(), error = %e, "Data send failed");
                    last_error = Some(e);
                }
            }
        }
        match (delivered, last_error) {
            (0, Some(e)) => Err(e),
            (0, None) => Err(PeerError::DataChannelUnavailable),
            (n, _) => Ok(n),
        }
    }

    /// Remote stream of the first connected peer.
    #[must_use]
    pub fn connected_remote_stream(&self) -> Option<RemoteStream> {
        self.peers
            .values()
            .filter(|p| p.state() == PeerState::Connected)
            .find_map(|p| p.remote_stream().cloned())
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<PeerSnapshot> {
        let mut peers: Vec<PeerSnapshot> = self
            .peers
            .values()
            .map(|peer| PeerSnapshot {
                peer_id: peer.peer_id().clone(),
                connection_id: peer.connection_id().to_string(),
                state: peer.state(),
                has_remote_stream: peer.remote_stream().is_some(),
                data_channel_open: peer.is_data_channel_open(),
            })
            .collect();
        peers.sort_by(|a, b| a.peer_id.as_str().cmp(b.peer_id.as_str()));
        peers
    }

    #[must_use]
    pub fn peer_state(&self, peer_id: &ParticipantId) -> Option<PeerState> {
        self.peers.get(peer_id).map(PeerConnection::state)
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    #[must_use]
    pub fn is_recreate_scheduled(&self, peer_id: &ParticipantId) -> bool {
        self.recreate_at.contains_key(peer_id)
    }

    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.closing
    }

    async fn deliver(
        &mut self,
        from: &ParticipantId,
        envelope: NegotiationEnvelope,
        effects: &mut PeerEffects,
    ) {
        let mut queue = VecDeque::from([envelope]);
        while let Some(envelope) = queue.pop_front() {
            match self.route(from, envelope, effects).await {
                Route::Done => {}
                Route::Rebuild {
                    reason,
                    announce,
                    replay,
                } => {
                    self.destroy(from, reason, effects).await;
                    if self.build_peer(from, announce, effects).await {
                        if let Some(envelope) = replay {
                            queue.push_front(envelope);
                        }
                        if let Some(buffered) = self.pending_signals.remove(from) {
                            queue.extend(buffered);
                        }
                    }
                }
            }
        }
    }

    async fn route(
        &mut self,
        from: &ParticipantId,
        envelope: NegotiationEnvelope,
        effects: &mut PeerEffects,
    ) -> Route {
        let Some(peer) = self.peers.get_mut(from) else {
            self.buffer(from, envelope);
            return Route::Done;
        };

        let remote_changed = peer
            .remote_connection_id()
            .is_some_and(|current| current != envelope.connection_id);

        match &envelope.body {
            NegotiationBody::Restart if self.role.is_initiator() => {
                if remote_changed {
                    info!(target: "cs.peer", peer_id = %from, "Remote peer restarted, rebuilding");
                    return Route::Rebuild {
                        reason: RecreateReason::RemoteRestart,
                        announce: true,
                        replay: None,
                    };
                }
                return Route::Done;
            }
            NegotiationBody::Offer { .. } if !self.role.is_initiator() && remote_changed => {
                info!(target: "cs.peer", peer_id = %from, "Offer from new remote instance, rebuilding");
                return Route::Rebuild {
                    reason: RecreateReason::RemoteOffer,
                    announce: false,
                    replay: Some(envelope),
                };
            }
            _ => {}
        }

        let kind = envelope.kind();
        match peer.apply_remote(envelope).await {
            Ok(replies) => {
                for reply in replies {
                    effects.send(from, reply);
                }
            }
            Err(PeerError::RoleConflict(role)) => {
                self.role_conflict(from, role, effects).await;
            }
            Err(e) => {
                warn!(target: "cs.peer", peer_id = %from, kind = kind, error = %e, "Negotiation failed");
                self.fail_peer(from, &e.to_string(), RecreateReason::Negotiation, effects)
                    .await;
            }
        }
        Route::Done
    }

    fn buffer(&mut self, from: &ParticipantId, envelope: NegotiationEnvelope) {
        let queue = self.pending_signals.entry(from.clone()).or_default();
        if queue.len() >= MAX_PENDING_SIGNALS {
            warn!(target: "cs.peer", peer_id = %from, "Pending signal buffer full, dropping oldest");
            queue.pop_front();
        }
        debug!(target: "cs.peer", peer_id = %from, kind = envelope.kind(), "Buffering signal for unknown peer");
        queue.push_back(envelope);
    }

    async fn replay_pending(&mut self, peer_id: &ParticipantId, effects: &mut PeerEffects) {
        let Some(buffered) = self.pending_signals.remove(peer_id) else {
            return;
        };
        debug!(target: "cs.peer", peer_id = %peer_id, count = buffered.len(), "Replaying buffered signals");
        for envelope in buffered {
            self.deliver(peer_id, envelope, effects).await;
        }
    }

    /// Build a fresh instance. Returns `false` if it could not be built, in
    /// which case a rebuild is scheduled.
    async fn build_peer(
        &mut self,
        peer_id: &ParticipantId,
        announce: bool,
        effects: &mut PeerEffects,
    ) -> bool {
        let connection_id = Uuid::new_v4().simple().to_string();
        let spec = TransportSpec {
            peer_id: peer_id.clone(),
            connection_id: connection_id.clone(),
            role: self.role,
            local_stream: Arc::clone(&self.local_stream),
            ice_servers: self.settings.ice_servers.clone(),
        };
        let sink = PeerEventSink::new(peer_id.clone(), connection_id.clone(), self.events_tx.clone());

        let transport = match self.engine.create_transport(spec, sink).await {
            Ok(transport) => transport,
            Err(e) => {
                warn!(target: "cs.peer", peer_id = %peer_id, error = %e, "Failed to create transport");
                self.schedule_recreate(peer_id, RecreateReason::Engine);
                return false;
            }
        };

        let mut peer = PeerConnection::new(peer_id.clone(), connection_id, self.role, transport);
        match peer.start().await {
            Ok(Some(offer)) => effects.send(peer_id, offer),
            Ok(None) if announce => {
                effects.send(
                    peer_id,
                    NegotiationEnvelope::new(peer.connection_id(), NegotiationBody::Restart),
                );
            }
            Ok(None) => {}
            Err(e) => {
                peer.fail(&e.to_string()).await;
                self.schedule_recreate(peer_id, RecreateReason::Negotiation);
                return false;
            }
        }

        debug!(
            target: "cs.peer",
            peer_id = %peer_id,
            connection_id = %peer.connection_id(),
            role = %self.role,
            "Peer created"
        );
        self.peers.insert(peer_id.clone(), peer);
        metrics::set_active_peers(self.peers.len());
        true
    }

    /// Close the current instance ahead of an immediate rebuild.
    async fn destroy(
        &mut self,
        peer_id: &ParticipantId,
        reason: RecreateReason,
        effects: &mut PeerEffects,
    ) {
        metrics::record_peer_recreation(reason.as_str());
        if let Some(mut peer) = self.peers.remove(peer_id) {
            if peer.close().await == PeerState::Connected {
                effects.notices.push(PeerNotice::Disconnected {
                    peer_id: peer_id.clone(),
                });
            }
        }
    }

    async fn fail_peer(
        &mut self,
        peer_id: &ParticipantId,
        detail: &str,
        reason: RecreateReason,
        effects: &mut PeerEffects,
    ) {
        if let Some(mut peer) = self.peers.remove(peer_id) {
            if peer.fail(detail).await == PeerState::Connected {
                effects.notices.push(PeerNotice::Disconnected {
                    peer_id: peer_id.clone(),
                });
            }
            metrics::set_active_peers(self.peers.len());
        }
        self.schedule_recreate(peer_id, reason);
    }

    async fn role_conflict(
        &mut self,
        peer_id: &ParticipantId,
        role: Role,
        effects: &mut PeerEffects,
    ) {
        warn!(
            target: "cs.peer",
            peer_id = %peer_id,
            role = %role,
            "Remote participant holds the local role"
        );
        metrics::record_role_conflict();
        self.recreate_at.remove(peer_id);
        self.pending_signals.remove(peer_id);
        if let Some(mut peer) = self.peers.remove(peer_id) {
            if peer.fail("role conflict").await == PeerState::Connected {
                effects.notices.push(PeerNotice::Disconnected {
                    peer_id: peer_id.clone(),
                });
            }
            metrics::set_active_peers(self.peers.len());
        }
        effects.notices.push(PeerNotice::RoleConflict {
            peer_id: peer_id.clone(),
            role,
        });
    }

    fn schedule_recreate(&mut self, peer_id: &ParticipantId, reason: RecreateReason) {
        if self.closing {
            return;
        }
        metrics::record_peer_recreation(reason.as_str());
        let at = Instant::now() + self.settings.recreate_delay;
        info!(
            target: "cs.peer",
            peer_id = %peer_id,
            reason = reason.as_str(),
            delay_ms = u64::try_from(self.settings.recreate_delay.as_millis()).unwrap_or(u64::MAX),
            "Peer scheduled for recreation"
        );
        self.recreate_at.insert(peer_id.clone(), at);
    }
}
