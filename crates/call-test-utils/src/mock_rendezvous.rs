//! In-memory rendezvous server.
//!
//! Implements `SignalingConnector` directly, so sessions under test get a
//! `SignalingLink` without a WebSocket. Behaves like the real server:
//! - Joining a room sends `room-members` (everyone already there) to the
//!   joiner and `peer-joined` to everyone else
//! - `signal` frames are relayed to the addressed participant
//! - Leaving or disconnecting sends `peer-left` to the rest of the room
//!
//! Faults can be injected: refused connections, dropped links and server
//! closes.
//!
//! # Example
//!
//! ```rust,ignore
//! use call_test_utils::MockRendezvous;
//!
//! let rendezvous = MockRendezvous::new();
//! rendezvous.set_refuse_connections(true);
//! // ... session fails to connect ...
//! assert_eq!(rendezvous.connection_attempts(), 5);
//! ```

use async_trait::async_trait;
use call_session::errors::SignalingError;
use call_session::signaling::{ClientFrame, ServerFrame, SignalingConnector, SignalingLink};
use common::types::{ParticipantId, RoomId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Mock rendezvous server for session tests.
#[derive(Debug, Clone, Default)]
pub struct MockRendezvous {
    inner: Arc<Mutex<RendezvousInner>>,
}

#[derive(Debug, Default)]
struct RendezvousInner {
    next_connection: u64,
    connections: HashMap<ParticipantId, ServerConnection>,
    /// Members per room, in join order.
    rooms: HashMap<RoomId, Vec<ParticipantId>>,
    refuse_connections: bool,
    connection_attempts: usize,
    relayed_signals: usize,
}

#[derive(Debug)]
struct ServerConnection {
    id: u64,
    to_client: mpsc::Sender<ServerFrame>,
    room: Option<RoomId>,
    cancel: CancellationToken,
}

impl RendezvousInner {
    fn send_to(&self, participant: &ParticipantId, frame: ServerFrame) {
        if let Some(connection) = self.connections.get(participant) {
            let _ = connection.to_client.try_send(frame);
        }
    }

    fn is_current(&self, participant: &ParticipantId, connection_id: u64) -> bool {
        self.connections
            .get(participant)
            .is_some_and(|c| c.id == connection_id)
    }

    fn join(&mut self, participant: &ParticipantId, room_id: RoomId) {
        self.leave(participant);

        let members = self.rooms.entry(room_id.clone()).or_default();
        let existing: Vec<ParticipantId> = members.clone();
        members.push(participant.clone());

        if let Some(connection) = self.connections.get_mut(participant) {
            connection.room = Some(room_id);
        }

        self.send_to(
            participant,
            ServerFrame::RoomMembers {
                peer_ids: existing.clone(),
            },
        );
        for member in &existing {
            self.send_to(
                member,
                ServerFrame::PeerJoined {
                    peer_id: participant.clone(),
                },
            );
        }
    }

    fn leave(&mut self, participant: &ParticipantId) {
        let room = self
            .connections
            .get_mut(participant)
            .and_then(|c| c.room.take());
        let Some(room) = room else {
            return;
        };
        let remaining = match self.rooms.get_mut(&room) {
            Some(members) => {
                members.retain(|m| m != participant);
                members.clone()
            }
            None => Vec::new(),
        };
        if remaining.is_empty() {
            self.rooms.remove(&room);
        }
        for member in &remaining {
            self.send_to(
                member,
                ServerFrame::PeerLeft {
                    peer_id: participant.clone(),
                },
            );
        }
    }

    fn relay(&mut self, from: &ParticipantId, to: &ParticipantId, signal: serde_json::Value) {
        self.relayed_signals += 1;
        self.send_to(
            to,
            ServerFrame::Signal {
                peer_id: from.clone(),
                signal,
            },
        );
    }

    /// Remove the connection, leaving its room first.
    fn remove(&mut self, participant: &ParticipantId) -> Option<ServerConnection> {
        self.leave(participant);
        let connection = self.connections.remove(participant)?;
        connection.cancel.cancel();
        Some(connection)
    }
}

impl MockRendezvous {
    /// Create a server with no rooms.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse (or accept again) new connection attempts.
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.inner.lock().unwrap().refuse_connections = refuse;
    }

    /// Drop the participant's link without a close frame, as a network
    /// failure would. Returns `false` if they were not connected.
    pub fn drop_connection(&self, participant: &ParticipantId) -> bool {
        self.inner.lock().unwrap().remove(participant).is_some()
    }

    /// Send a `close` frame and drop the participant's link.
    pub fn close_with_reason(&self, participant: &ParticipantId, reason: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.send_to(
            participant,
            ServerFrame::Close {
                reason: reason.to_string(),
            },
        );
        inner.remove(participant).is_some()
    }

    /// Number of `open` calls, refused ones included.
    #[must_use]
    pub fn connection_attempts(&self) -> usize {
        self.inner.lock().unwrap().connection_attempts
    }

    #[must_use]
    pub fn is_connected(&self, participant: &ParticipantId) -> bool {
        self.inner.lock().unwrap().connections.contains_key(participant)
    }

    /// Members of `room_id`, in join order.
    #[must_use]
    pub fn room_members(&self, room_id: &RoomId) -> Vec<ParticipantId> {
        self.inner
            .lock()
            .unwrap()
            .rooms
            .get(room_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of `signal` frames relayed so far.
    #[must_use]
    pub fn relayed_signals(&self) -> usize {
        self.inner.lock().unwrap().relayed_signals
    }

    fn handle_frame(&self, participant: &ParticipantId, connection_id: u64, frame: ClientFrame) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.is_current(participant, connection_id) {
            return;
        }
        match frame {
            ClientFrame::JoinRoom { room_id } => inner.join(participant, room_id),
            ClientFrame::LeaveRoom => inner.leave(participant),
            ClientFrame::Signal { peer_id, signal } => inner.relay(participant, &peer_id, signal),
        }
    }

    fn handle_client_gone(&self, participant: &ParticipantId, connection_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        if inner.is_current(participant, connection_id) {
            inner.remove(participant);
        }
    }
}

#[async_trait]
impl SignalingConnector for MockRendezvous {
    async fn open(&self, local_id: &ParticipantId) -> Result<SignalingLink, SignalingError> {
        let (link, mut from_client, to_client) = SignalingLink::pair();
        let cancel = CancellationToken::new();

        let connection_id = {
            let mut inner = self.inner.lock().unwrap();
            inner.connection_attempts += 1;
            if inner.refuse_connections {
                return Err(SignalingError::ConnectFailed(
                    "connection refused".to_string(),
                ));
            }
            // A second connection with the same id replaces the first.
            inner.remove(local_id);
            inner.next_connection += 1;
            let id = inner.next_connection;
            inner.connections.insert(
                local_id.clone(),
                ServerConnection {
                    id,
                    to_client,
                    room: None,
                    cancel: cancel.clone(),
                },
            );
            id
        };

        let server = self.clone();
        let participant = local_id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    frame = from_client.recv() => match frame {
                        Some(frame) => server.handle_frame(&participant, connection_id, frame),
                        None => {
                            server.handle_client_gone(&participant, connection_id);
                            break;
                        }
                    },
                }
            }
        });

        Ok(link)
    }
}
