//! `CallSession` - the call orchestrator actor.
//!
//! Each `CallSession`:
//! - Owns the local stream, the room membership and the peer registry
//! - Drives the signaling channel (connect, join, relay, leave)
//! - Serializes every reaction (signaling events, transport events, user
//!   commands, timers) on one task, so peer state is never mutated
//!   concurrently
//! - Relays chat over peer data channels and runs verification requests
//!
//! # Termination
//!
//! Hangup, capacity exceeded, a role conflict, unrecoverable signaling
//! failure, cancellation and dropping every handle all go through the same
//! cleanup path: stop
//! rebuilding peers, close them, leave and disconnect signaling, stop the
//! local tracks, reset verification state, emit `Ended`. After that the
//! actor only answers state queries until its handles are dropped.

use super::chat::{ChatDirection, ChatEntry, ChatLog, ChatMessage};
use super::identity::{Identity, IdentityProvider};
use super::verification::{
    BiometricKind, VerificationOracle, VerificationRecord, VerificationRecords,
};
use crate::config::Config;
use crate::errors::{SessionError, VerificationError};
use crate::media::{LocalStream, MediaConstraints, MediaDevices, TrackKind};
use crate::observability::metrics;
use crate::peer::{
    MediaEngine, NegotiationEnvelope, OutboundSignal, PeerEffects, PeerEvent, PeerManager,
    PeerManagerSettings, PeerNotice, PeerSnapshot,
};
use crate::room::{Admission, RoomCoordinator};
use crate::signaling::{
    ChannelSettings, ConnectionNotice, ConnectionState, RoomEvent, SignalEvent, SignalingChannel,
    SignalingChannelHandle, SignalingConnector, Subscription,
};

use bytes::Bytes;
use chrono::Utc;
use common::types::{ParticipantId, Role, RoomId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the session mailbox.
const SESSION_CHANNEL_BUFFER: usize = 64;

/// Session events retained for slow subscribers.
const SESSION_EVENT_BUFFER: usize = 256;

/// How long termination waits for the signaling channel to stop.
const SIGNALING_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// What the local user chose before the call starts.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub room_id: RoomId,
    /// Fixed for the lifetime of the session.
    pub role: Role,
    pub constraints: MediaConstraints,
}

/// Collaborators of a session.
#[derive(Clone)]
pub struct SessionDeps {
    pub connector: Arc<dyn SignalingConnector>,
    pub engine: Arc<dyn MediaEngine>,
    pub devices: Arc<dyn MediaDevices>,
    pub oracle: Arc<dyn VerificationOracle>,
    pub identity: Arc<dyn IdentityProvider>,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Hangup,
    CapacityExceeded,
    /// Both participants chose the same role.
    RoleConflict,
    SignalingFailed,
    HandleDropped,
    Cancelled,
}

impl EndReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Hangup => "hangup",
            EndReason::CapacityExceeded => "capacity_exceeded",
            EndReason::RoleConflict => "role_conflict",
            EndReason::SignalingFailed => "signaling_failed",
            EndReason::HandleDropped => "handle_dropped",
            EndReason::Cancelled => "cancelled",
        }
    }
}

/// Notifications for the embedding UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Signaling connection state change.
    Connection(ConnectionNotice),
    /// A third participant tried to join. The call ends right after.
    CapacityExceeded,
    /// The remote participant holds the local role. The call ends right
    /// after.
    RoleConflict { peer_id: ParticipantId, role: Role },
    PeerConnected { peer_id: ParticipantId },
    PeerDisconnected { peer_id: ParticipantId },
    ChatReceived {
        from: ParticipantId,
        message: ChatMessage,
    },
    VerificationUpdated(VerificationRecord),
    VerificationFailed {
        kind: BiometricKind,
        message: String,
    },
    Ended { reason: EndReason },
}

/// Point-in-time view of a session.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub local_id: ParticipantId,
    pub username: String,
    pub role: Role,
    pub room_id: RoomId,
    pub signaling: ConnectionState,
    /// Remote members, the local participant excluded.
    pub members: Vec<ParticipantId>,
    pub peers: Vec<PeerSnapshot>,
    pub chat: Vec<ChatEntry>,
    pub verifications: Vec<VerificationRecord>,
    pub verification_in_progress: bool,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub capacity_exceeded: bool,
    pub ended: bool,
}

enum TrackChange {
    Set(bool),
    Toggle,
}

enum SessionCommand {
    SendChat {
        text: String,
        respond_to: oneshot::Sender<Result<ChatMessage, SessionError>>,
    },
    SetTrack {
        kind: TrackKind,
        change: TrackChange,
        respond_to: oneshot::Sender<Result<bool, SessionError>>,
    },
    Verify {
        kind: BiometricKind,
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },
    GetState {
        respond_to: oneshot::Sender<SessionState>,
    },
    Hangup {
        respond_to: oneshot::Sender<()>,
    },
}

/// Handle to a `CallSession`.
///
/// Dropping every clone ends the call.
#[derive(Clone)]
pub struct CallSessionHandle {
    sender: mpsc::Sender<SessionCommand>,
    events: broadcast::Sender<SessionEvent>,
    cancel_token: CancellationToken,
    local_id: ParticipantId,
    room_id: RoomId,
    role: Role,
    public_base_url: String,
}

impl CallSessionHandle {
    /// Send a chat message. It is appended to the local log immediately and
    /// forwarded to every connected peer.
    ///
    /// # Errors
    ///
    /// - `SessionError::InvalidRequest` if the text is empty or whitespace
    /// - `SessionError::Ended` if the call is over
    pub async fn send_chat(&self, text: impl Into<String>) -> Result<ChatMessage, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::SendChat {
            text: text.into(),
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| SessionError::Ended)?
    }

    /// Mute or unmute the microphone. Returns the new enabled state.
    pub async fn set_audio_enabled(&self, enabled: bool) -> Result<bool, SessionError> {
        self.set_track(TrackKind::Audio, TrackChange::Set(enabled))
            .await
    }

    /// Turn the camera on or off. Returns the new enabled state.
    pub async fn set_video_enabled(&self, enabled: bool) -> Result<bool, SessionError> {
        self.set_track(TrackKind::Video, TrackChange::Set(enabled))
            .await
    }

    pub async fn toggle_audio(&self) -> Result<bool, SessionError> {
        self.set_track(TrackKind::Audio, TrackChange::Toggle).await
    }

    pub async fn toggle_video(&self) -> Result<bool, SessionError> {
        self.set_track(TrackKind::Video, TrackChange::Toggle).await
    }

    async fn set_track(&self, kind: TrackKind, change: TrackChange) -> Result<bool, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::SetTrack {
            kind,
            change,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| SessionError::Ended)?
    }

    /// Start verifying the remote participant. The outcome arrives as a
    /// `VerificationUpdated` or `VerificationFailed` event.
    ///
    /// # Errors
    ///
    /// - `VerificationError::NotInitiator` for the responder
    /// - `VerificationError::InProgress` if one is already running
    /// - `VerificationError::NoRemoteStream` if no peer is connected
    pub async fn verify(&self, kind: BiometricKind) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::Verify {
            kind,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| SessionError::Ended)?
    }

    /// Snapshot of the session.
    pub async fn state(&self) -> Result<SessionState, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::GetState { respond_to: tx })
            .await?;
        rx.await.map_err(|_| SessionError::Ended)
    }

    /// End the call. Idempotent.
    pub async fn hangup(&self) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::Hangup { respond_to: tx })
            .await?;
        rx.await.map_err(|_| SessionError::Ended)
    }

    async fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.sender
            .send(command)
            .await
            .map_err(|_| SessionError::Ended)
    }

    /// Subscribe to session events from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Link another participant can use to join this room.
    #[must_use]
    pub fn invite_url(&self) -> String {
        self.room_id.invite_url(&self.public_base_url)
    }

    #[must_use]
    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    #[must_use]
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Cancel the session. Cleanup still runs.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// A running session.
pub struct StartedSession {
    pub handle: CallSessionHandle,
    /// Receives every event from the moment the session started.
    pub events: broadcast::Receiver<SessionEvent>,
    pub task: JoinHandle<()>,
}

struct VerificationOutcome {
    kind: BiometricKind,
    result: Result<bool, VerificationError>,
}

struct Subscriptions {
    notices: Subscription<ConnectionNotice>,
    /// Membership and signals in server order.
    room: Subscription<RoomEvent>,
}

/// The `CallSession` actor.
pub struct CallSession {
    identity: Identity,
    role: Role,
    receiver: mpsc::Receiver<SessionCommand>,
    cancel_token: CancellationToken,
    events: broadcast::Sender<SessionEvent>,
    signaling: SignalingChannelHandle,
    signaling_task: JoinHandle<()>,
    subscriptions: Subscriptions,
    room: RoomCoordinator,
    joined: bool,
    local_stream: Arc<LocalStream>,
    peers: PeerManager,
    peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    chat: ChatLog,
    oracle: Arc<dyn VerificationOracle>,
    verifications: VerificationRecords,
    verification_task: Option<JoinHandle<()>>,
    verification_tx: mpsc::UnboundedSender<VerificationOutcome>,
    verification_rx: mpsc::UnboundedReceiver<VerificationOutcome>,
    scan_delay: Duration,
    maintenance_tick: Duration,
    ended: bool,
}

impl CallSession {
    /// Start a session: check identity, acquire local media, connect to the
    /// rendezvous server and spawn the actor. The room is joined as soon as
    /// the connection is up.
    ///
    /// # Errors
    ///
    /// - `SessionError::Unauthenticated` if nobody is signed in
    /// - `SessionError::MediaUnavailable` if local media cannot be acquired;
    ///   nothing is connected in that case
    #[instrument(skip_all, name = "cs.session.start", fields(room_id = %params.room_id, role = %params.role))]
    pub async fn start(
        config: &Config,
        params: SessionParams,
        deps: SessionDeps,
        cancel_token: CancellationToken,
    ) -> Result<StartedSession, SessionError> {
        let identity = deps
            .identity
            .current()
            .ok_or(SessionError::Unauthenticated)?;

        let local_stream = deps
            .devices
            .acquire(params.constraints)
            .await
            .map_err(|e| {
                warn!(target: "cs.session", error = %e, "Local media unavailable");
                SessionError::MediaUnavailable(e)
            })?;

        let (signaling, signaling_task) = SignalingChannel::spawn(
            Arc::clone(&deps.connector),
            ChannelSettings::from(config),
            cancel_token.child_token(),
        );

        let subscriptions = match subscribe_all(&signaling).await {
            Ok(subscriptions) => subscriptions,
            Err(e) => {
                signaling.cancel();
                local_stream.stop();
                return Err(e);
            }
        };
        if let Err(e) = signaling.connect(identity.id.clone()).await {
            signaling.cancel();
            local_stream.stop();
            return Err(e.into());
        }

        let (peers, peer_events) = PeerManager::new(
            Arc::clone(&deps.engine),
            Arc::clone(&local_stream),
            params.role,
            PeerManagerSettings::from(config),
        );

        let (sender, receiver) = mpsc::channel(SESSION_CHANNEL_BUFFER);
        let (events, events_rx) = broadcast::channel(SESSION_EVENT_BUFFER);
        let (verification_tx, verification_rx) = mpsc::unbounded_channel();

        let handle = CallSessionHandle {
            sender,
            events: events.clone(),
            cancel_token: cancel_token.clone(),
            local_id: identity.id.clone(),
            room_id: params.room_id.clone(),
            role: params.role,
            public_base_url: config.public_base_url.clone(),
        };

        let actor = Self {
            room: RoomCoordinator::new(params.room_id, identity.id.clone()),
            identity,
            role: params.role,
            receiver,
            cancel_token,
            events,
            signaling,
            signaling_task,
            subscriptions,
            joined: false,
            local_stream,
            peers,
            peer_events,
            chat: ChatLog::default(),
            oracle: deps.oracle,
            verifications: VerificationRecords::default(),
            verification_task: None,
            verification_tx,
            verification_rx,
            scan_delay: config.verification_scan_delay,
            maintenance_tick: config.maintenance_tick,
            ended: false,
        };

        let task = tokio::spawn(actor.run());

        Ok(StartedSession {
            handle,
            events: events_rx,
            task,
        })
    }

    #[instrument(
        skip_all,
        name = "cs.session",
        fields(room_id = %self.room.room_id(), local_id = %self.identity.id, role = %self.role)
    )]
    async fn run(mut self) {
        info!(target: "cs.session", "CallSession started");

        let mut tick = tokio::time::interval(self.maintenance_tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.ended {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(target: "cs.session", "CallSession received cancellation signal");
                    self.terminate(EndReason::Cancelled).await;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(command) => self.handle_command(command).await,
                        None => {
                            debug!(target: "cs.session", "All handles dropped, ending call");
                            self.terminate(EndReason::HandleDropped).await;
                            return;
                        }
                    }
                }

                notice = self.subscriptions.notices.recv() => {
                    match notice {
                        Some(notice) => self.handle_notice(notice).await,
                        None => self.terminate(EndReason::SignalingFailed).await,
                    }
                }

                Some(event) = self.subscriptions.room.recv() => {
                    self.handle_room_event(event).await;
                }

                Some(event) = self.peer_events.recv() => {
                    let effects = self.peers.handle_event(event).await;
                    self.apply(effects).await;
                }

                Some(outcome) = self.verification_rx.recv() => {
                    self.handle_verification_outcome(outcome);
                }

                _ = tick.tick() => {
                    let effects = self.peers.check_deadlines(Instant::now()).await;
                    self.apply(effects).await;
                }
            }
        }

        // Ended: answer queries until the handles go away.
        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => break,
                msg = self.receiver.recv() => {
                    match msg {
                        Some(command) => self.handle_command_after_end(command),
                        None => break,
                    }
                }
            }
        }

        debug!(target: "cs.session", "CallSession stopped");
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::SendChat { text, respond_to } => {
                let result = self.send_chat(text).await;
                let _ = respond_to.send(result);
            }
            SessionCommand::SetTrack {
                kind,
                change,
                respond_to,
            } => {
                let _ = respond_to.send(self.set_track(kind, change));
            }
            SessionCommand::Verify { kind, respond_to } => {
                let result = self.start_verification(kind).map_err(SessionError::from);
                let _ = respond_to.send(result);
            }
            SessionCommand::GetState { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
            SessionCommand::Hangup { respond_to } => {
                self.terminate(EndReason::Hangup).await;
                let _ = respond_to.send(());
            }
        }
    }

    fn handle_command_after_end(&self, command: SessionCommand) {
        match command {
            SessionCommand::SendChat { respond_to, .. } => {
                let _ = respond_to.send(Err(SessionError::Ended));
            }
            SessionCommand::SetTrack { respond_to, .. } => {
                let _ = respond_to.send(Err(SessionError::Ended));
            }
            SessionCommand::Verify { respond_to, .. } => {
                let _ = respond_to.send(Err(SessionError::Ended));
            }
            SessionCommand::GetState { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
            SessionCommand::Hangup { respond_to } => {
                let _ = respond_to.send(());
            }
        }
    }

    async fn handle_notice(&mut self, notice: ConnectionNotice) {
        self.emit(SessionEvent::Connection(notice.clone()));
        match notice {
            ConnectionNotice::Connected if !self.joined => {
                let room_id = self.room.room_id().clone();
                match self.signaling.join_room(room_id).await {
                    Ok(()) => self.joined = true,
                    Err(e) => warn!(target: "cs.session", error = %e, "Failed to join room"),
                }
            }
            ConnectionNotice::Failed { attempts } => {
                warn!(target: "cs.session", attempts = attempts, "Signaling unrecoverable, ending call");
                self.terminate(EndReason::SignalingFailed).await;
            }
            _ => {}
        }
    }

    async fn handle_room_event(&mut self, event: RoomEvent) {
        match event {
            RoomEvent::Members(peer_ids) => {
                let admission = self.room.admit_snapshot(peer_ids);
                self.handle_admission(admission).await;
            }
            RoomEvent::PeerJoined(peer_id) => {
                let admission = self.room.peer_joined(peer_id);
                self.handle_admission(admission).await;
            }
            RoomEvent::PeerLeft(peer_id) => self.handle_peer_left(peer_id).await,
            RoomEvent::Signal(signal) => self.handle_signal(signal).await,
        }
    }

    async fn handle_admission(&mut self, admission: Admission) {
        match admission {
            Admission::Admitted(peer_ids) => {
                for peer_id in peer_ids {
                    info!(target: "cs.session", peer_id = %peer_id, "Remote participant admitted");
                    let effects = self.peers.create_peer(&peer_id).await;
                    self.apply(effects).await;
                }
            }
            Admission::CapacityExceeded => {
                metrics::record_capacity_exceeded();
                self.emit(SessionEvent::CapacityExceeded);
                self.terminate(EndReason::CapacityExceeded).await;
            }
            Admission::Unchanged | Admission::Ignored => {}
        }
    }

    async fn handle_peer_left(&mut self, peer_id: ParticipantId) {
        if self.room.peer_left(&peer_id) {
            info!(target: "cs.session", peer_id = %peer_id, "Remote participant left");
            let effects = self.peers.remove_peer(&peer_id).await;
            self.apply(effects).await;
        }
    }

    async fn handle_signal(&mut self, signal: SignalEvent) {
        let SignalEvent { from, payload } = signal;
        match NegotiationEnvelope::from_payload(payload) {
            Ok(envelope) => {
                let effects = self.peers.handle_signal(&from, envelope).await;
                self.apply(effects).await;
            }
            Err(e) => {
                warn!(target: "cs.session", peer_id = %from, error = %e, "Dropping malformed signal");
            }
        }
    }

    /// Carry out what the peer manager asked for.
    async fn apply(&mut self, effects: PeerEffects) {
        for OutboundSignal { to, envelope } in effects.outbound {
            let kind = envelope.kind();
            let payload = match envelope.to_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(target: "cs.session", error = %e, "Failed to encode signal");
                    continue;
                }
            };
            if let Err(e) = self.signaling.send_signal(to.clone(), payload).await {
                warn!(target: "cs.session", peer_id = %to, kind = kind, error = %e, "Failed to relay signal");
            }
        }

        let mut role_conflict = false;
        for notice in effects.notices {
            match notice {
                PeerNotice::Connected { peer_id } => {
                    self.emit(SessionEvent::PeerConnected { peer_id });
                }
                PeerNotice::Disconnected { peer_id } => {
                    self.emit(SessionEvent::PeerDisconnected { peer_id });
                }
                PeerNotice::Data { from, payload } => self.receive_chat(from, &payload),
                PeerNotice::RoleConflict { peer_id, role } => {
                    self.emit(SessionEvent::RoleConflict { peer_id, role });
                    role_conflict = true;
                }
            }
        }
        if role_conflict {
            self.terminate(EndReason::RoleConflict).await;
        }
    }

    async fn send_chat(&mut self, text: String) -> Result<ChatMessage, SessionError> {
        let message = ChatMessage::new(self.identity.username.clone(), text)?;
        let payload = message.to_bytes()?;

        self.chat.push_sent(message.clone());
        metrics::record_chat_message(ChatDirection::Sent.as_str());

        match self.peers.broadcast_data(&payload).await {
            Ok(delivered) => {
                debug!(target: "cs.session", delivered = delivered, "Chat message sent");
            }
            Err(e) => {
                debug!(target: "cs.session", error = %e, "Chat message kept locally only");
            }
        }
        Ok(message)
    }

    fn receive_chat(&mut self, from: ParticipantId, payload: &Bytes) {
        match ChatMessage::from_bytes(payload) {
            Ok(message) => {
                metrics::record_chat_message(ChatDirection::Received.as_str());
                self.chat.push_received(from.clone(), message.clone());
                self.emit(SessionEvent::ChatReceived { from, message });
            }
            Err(e) => {
                warn!(target: "cs.session", peer_id = %from, error = %e, "Dropping malformed chat message");
            }
        }
    }

    fn set_track(&mut self, kind: TrackKind, change: TrackChange) -> Result<bool, SessionError> {
        let enabled = match change {
            TrackChange::Set(enabled) => enabled,
            TrackChange::Toggle => !self.local_stream.is_kind_enabled(kind),
        };
        if !self.local_stream.set_kind_enabled(kind, enabled) {
            return Err(SessionError::InvalidRequest(format!(
                "No local {} track",
                match kind {
                    TrackKind::Audio => "audio",
                    TrackKind::Video => "video",
                }
            )));
        }
        debug!(target: "cs.session", kind = ?kind, enabled = enabled, "Local track toggled");
        Ok(enabled)
    }

    fn start_verification(&mut self, kind: BiometricKind) -> Result<(), VerificationError> {
        if !self.role.is_initiator() {
            return Err(VerificationError::NotInitiator);
        }
        if self.verification_task.is_some() {
            return Err(VerificationError::InProgress);
        }
        let stream = self
            .peers
            .connected_remote_stream()
            .ok_or(VerificationError::NoRemoteStream)?;

        info!(target: "cs.verify", kind = %kind, "Verification started");

        let oracle = Arc::clone(&self.oracle);
        let delay = self.scan_delay;
        let results = self.verification_tx.clone();
        self.verification_task = Some(tokio::spawn(async move {
            let result = async {
                let capture = stream.capture_frame()?;
                tokio::time::sleep(delay).await;
                oracle.verify(kind, &capture).await
            }
            .await;
            let _ = results.send(VerificationOutcome { kind, result });
        }));
        Ok(())
    }

    fn handle_verification_outcome(&mut self, outcome: VerificationOutcome) {
        self.verification_task = None;
        let VerificationOutcome { kind, result } = outcome;
        match result {
            Ok(verified) => {
                info!(target: "cs.verify", kind = %kind, verified = verified, "Verification recorded");
                metrics::record_verification(
                    kind.as_str(),
                    if verified { "verified" } else { "rejected" },
                );
                let record = VerificationRecord {
                    kind,
                    verified,
                    timestamp: Utc::now(),
                };
                self.verifications.record(record.clone());
                self.emit(SessionEvent::VerificationUpdated(record));
            }
            Err(e) => {
                warn!(target: "cs.verify", kind = %kind, error = %e, "Verification failed");
                metrics::record_verification(kind.as_str(), "error");
                self.emit(SessionEvent::VerificationFailed {
                    kind,
                    message: e.to_string(),
                });
            }
        }
    }

    /// The single cleanup path.
    async fn terminate(&mut self, reason: EndReason) {
        if self.ended {
            return;
        }
        self.ended = true;
        info!(target: "cs.session", reason = reason.as_str(), "Ending call");

        self.peers.begin_teardown();
        if let Some(task) = self.verification_task.take() {
            task.abort();
        }

        let effects = self.peers.close_all().await;
        for notice in effects.notices {
            if let PeerNotice::Disconnected { peer_id } = notice {
                self.emit(SessionEvent::PeerDisconnected { peer_id });
            }
        }

        if self.joined {
            if let Err(e) = self.signaling.leave_room().await {
                debug!(target: "cs.session", error = %e, "Leave not delivered");
            }
        }
        if let Err(e) = self.signaling.disconnect().await {
            debug!(target: "cs.session", error = %e, "Signaling already stopped");
        }
        self.signaling.cancel();
        if tokio::time::timeout(SIGNALING_SHUTDOWN_TIMEOUT, &mut self.signaling_task)
            .await
            .is_err()
        {
            warn!(target: "cs.session", "Signaling channel did not stop in time");
            self.signaling_task.abort();
        }

        self.local_stream.stop();
        self.verifications.reset();

        self.emit(SessionEvent::Ended { reason });
    }

    fn snapshot(&self) -> SessionState {
        SessionState {
            local_id: self.identity.id.clone(),
            username: self.identity.username.clone(),
            role: self.role,
            room_id: self.room.room_id().clone(),
            signaling: self.signaling.state(),
            members: self.room.members(),
            peers: self.peers.snapshot(),
            chat: self.chat.entries().to_vec(),
            verifications: self.verifications.all(),
            verification_in_progress: self.verification_task.is_some(),
            audio_enabled: self.local_stream.is_kind_enabled(TrackKind::Audio),
            video_enabled: self.local_stream.is_kind_enabled(TrackKind::Video),
            capacity_exceeded: self.room.is_capacity_exceeded(),
            ended: self.ended,
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

async fn subscribe_all(
    signaling: &SignalingChannelHandle,
) -> Result<Subscriptions, SessionError> {
    Ok(Subscriptions {
        notices: signaling.on_connection_notice().await?,
        room: signaling.on_room_event().await?,
    })
}
