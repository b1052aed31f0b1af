//! Room membership bookkeeping with a strict two-participant cap.
//!
//! The coordinator only decides; the session acts on its [`Admission`]
//! results (creating or tearing down peers, ending the call). Once capacity
//! is exceeded the room is terminal and every later event is ignored.

use common::types::{ParticipantId, RoomId};
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Maximum participants in a room, including the local one.
pub const ROOM_CAPACITY: usize = 2;

/// Outcome of a membership event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// These participants are now members and need a peer connection.
    Admitted(Vec<ParticipantId>),
    /// Nothing changed (duplicate, self, or empty snapshot).
    Unchanged,
    /// The room would exceed its capacity. Raised exactly once.
    CapacityExceeded,
    /// The room is already terminal.
    Ignored,
}

/// Membership of the local participant's room.
#[derive(Debug, Clone)]
pub struct RoomCoordinator {
    room_id: RoomId,
    local_id: ParticipantId,
    remote_members: BTreeSet<ParticipantId>,
    capacity_exceeded: bool,
}

impl RoomCoordinator {
    #[must_use]
    pub fn new(room_id: RoomId, local_id: ParticipantId) -> Self {
        Self {
            room_id,
            local_id,
            remote_members: BTreeSet::new(),
            capacity_exceeded: false,
        }
    }

    /// Admit the snapshot of participants already present when we joined.
    ///
    /// Admission is all-or-nothing: if the snapshot would push the room past
    /// its capacity nobody is admitted.
    pub fn admit_snapshot(&mut self, peer_ids: Vec<ParticipantId>) -> Admission {
        if self.capacity_exceeded {
            return Admission::Ignored;
        }

        let newcomers: BTreeSet<ParticipantId> = peer_ids
            .into_iter()
            .filter(|id| *id != self.local_id && !self.remote_members.contains(id))
            .collect();

        if newcomers.is_empty() {
            return Admission::Unchanged;
        }

        if 1 + self.remote_members.len() + newcomers.len() > ROOM_CAPACITY {
            return self.exceed(newcomers.len());
        }

        debug!(
            target: "cs.room",
            room_id = %self.room_id,
            count = newcomers.len(),
            "Admitting room snapshot"
        );
        self.remote_members.extend(newcomers.iter().cloned());
        Admission::Admitted(newcomers.into_iter().collect())
    }

    /// A participant announced itself after we joined.
    pub fn peer_joined(&mut self, peer_id: ParticipantId) -> Admission {
        if self.capacity_exceeded {
            return Admission::Ignored;
        }
        if peer_id == self.local_id || self.remote_members.contains(&peer_id) {
            return Admission::Unchanged;
        }
        if 1 + self.remote_members.len() + 1 > ROOM_CAPACITY {
            return self.exceed(1);
        }

        debug!(target: "cs.room", room_id = %self.room_id, peer_id = %peer_id, "Peer admitted");
        self.remote_members.insert(peer_id.clone());
        Admission::Admitted(vec![peer_id])
    }

    /// A participant left. Returns `true` if it was a member.
    pub fn peer_left(&mut self, peer_id: &ParticipantId) -> bool {
        if self.capacity_exceeded {
            return false;
        }
        let removed = self.remote_members.remove(peer_id);
        if removed {
            debug!(target: "cs.room", room_id = %self.room_id, peer_id = %peer_id, "Peer removed");
        }
        removed
    }

    fn exceed(&mut self, arriving: usize) -> Admission {
        warn!(
            target: "cs.room",
            room_id = %self.room_id,
            present = 1 + self.remote_members.len(),
            arriving = arriving,
            "Room capacity exceeded"
        );
        self.capacity_exceeded = true;
        Admission::CapacityExceeded
    }

    #[must_use]
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Participants in the room, the local one included.
    #[must_use]
    pub fn participant_count(&self) -> usize {
        1 + self.remote_members.len()
    }

    #[must_use]
    pub fn members(&self) -> Vec<ParticipantId> {
        self.remote_members.iter().cloned().collect()
    }

    #[must_use]
    pub fn contains(&self, peer_id: &ParticipantId) -> bool {
        self.remote_members.contains(peer_id)
    }

    #[must_use]
    pub fn is_capacity_exceeded(&self) -> bool {
        self.capacity_exceeded
    }
}
