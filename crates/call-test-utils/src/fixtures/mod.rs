//! Pre-configured test data fixtures for session testing.
//!
//! Provides:
//! - A configuration with short delays
//! - Participants with a role, identity and mock collaborators
//! - Running sessions with event helpers

use crate::mock_devices::MockDevices;
use crate::mock_media::MockNetwork;
use crate::mock_oracle::MockOracle;
use crate::mock_rendezvous::MockRendezvous;
use call_session::config::Config;
use call_session::errors::SessionError;
use call_session::media::MediaConstraints;
use call_session::session::{
    CallSession, CallSessionHandle, Identity, IdentityProvider, SessionDeps, SessionEvent,
    SessionParams, SessionState,
};
use common::types::{ParticipantId, Role, RoomId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use call_session::session::StaticIdentity;

/// How long event helpers wait before failing the test.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration with short delays, suitable for paused-clock tests.
#[must_use]
pub fn test_config() -> Config {
    Config {
        signaling_url: "ws://rendezvous.test/signaling".to_string(),
        ice_servers: Vec::new(),
        reconnect_max_attempts: 3,
        reconnect_delay: Duration::from_millis(100),
        connect_timeout: Duration::from_secs(1),
        negotiation_timeout: Some(Duration::from_secs(5)),
        peer_recreate_delay: Duration::from_millis(50),
        verification_scan_delay: Duration::from_secs(3),
        maintenance_tick: Duration::from_millis(10),
        public_base_url: "https://calls.example.com".to_string(),
        ..Config::default()
    }
}

/// Test participant fixture.
#[derive(Debug, Clone)]
pub struct TestParticipant {
    /// Participant ID.
    pub id: ParticipantId,
    /// Display name.
    pub username: String,
    pub role: Role,
    pub devices: MockDevices,
    pub oracle: MockOracle,
    /// Whether the identity provider reports a signed-in user.
    pub signed_in: bool,
    pub config: Config,
}

impl TestParticipant {
    /// Create a participant with the given role.
    #[must_use]
    pub fn new(id: &str, role: Role) -> Self {
        Self {
            id: ParticipantId::new(id),
            username: format!("{id}-name"),
            role,
            devices: MockDevices::working(),
            oracle: MockOracle::passing(),
            signed_in: true,
            config: test_config(),
        }
    }

    #[must_use]
    pub fn interviewer(id: &str) -> Self {
        Self::new(id, Role::Initiator)
    }

    #[must_use]
    pub fn interviewee(id: &str) -> Self {
        Self::new(id, Role::Responder)
    }

    #[must_use]
    pub fn with_devices(mut self, devices: MockDevices) -> Self {
        self.devices = devices;
        self
    }

    #[must_use]
    pub fn with_oracle(mut self, oracle: MockOracle) -> Self {
        self.oracle = oracle;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Nobody is signed in.
    #[must_use]
    pub fn signed_out(mut self) -> Self {
        self.signed_in = false;
        self
    }

    #[must_use]
    pub fn identity(&self) -> Identity {
        Identity {
            id: self.id.clone(),
            username: self.username.clone(),
        }
    }

    fn identity_provider(&self) -> Arc<dyn IdentityProvider> {
        if self.signed_in {
            Arc::new(StaticIdentity::new(self.identity()))
        } else {
            Arc::new(StaticIdentity::anonymous())
        }
    }

    /// Start a session in `room`.
    pub async fn try_start(
        &self,
        rendezvous: &MockRendezvous,
        network: &MockNetwork,
        room: &str,
    ) -> Result<RunningParticipant, SessionError> {
        let deps = SessionDeps {
            connector: Arc::new(rendezvous.clone()),
            engine: Arc::new(network.engine(self.id.clone())),
            devices: Arc::new(self.devices.clone()),
            oracle: Arc::new(self.oracle.clone()),
            identity: self.identity_provider(),
        };
        let params = SessionParams {
            room_id: RoomId::parse(room).unwrap(),
            role: self.role,
            constraints: MediaConstraints::default(),
        };

        let started =
            CallSession::start(&self.config, params, deps, CancellationToken::new()).await?;

        Ok(RunningParticipant {
            participant: self.clone(),
            handle: started.handle,
            events: started.events,
            task: started.task,
        })
    }

    /// Start a session in `room`, panicking on failure.
    pub async fn start(
        &self,
        rendezvous: &MockRendezvous,
        network: &MockNetwork,
        room: &str,
    ) -> RunningParticipant {
        self.try_start(rendezvous, network, room)
            .await
            .expect("session failed to start")
    }
}

/// A participant with a live session.
pub struct RunningParticipant {
    pub participant: TestParticipant,
    pub handle: CallSessionHandle,
    pub events: broadcast::Receiver<SessionEvent>,
    pub task: JoinHandle<()>,
}

impl RunningParticipant {
    #[must_use]
    pub fn id(&self) -> &ParticipantId {
        &self.participant.id
    }

    /// Wait for the next event matching `predicate`, skipping others.
    pub async fn wait_for<F>(&mut self, mut predicate: F) -> SessionEvent
    where
        F: FnMut(&SessionEvent) -> bool,
    {
        tokio::time::timeout(EVENT_TIMEOUT, async {
            loop {
                match self.events.recv().await {
                    Ok(event) if predicate(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        panic!("session event stream closed")
                    }
                }
            }
        })
        .await
        .expect("timed out waiting for session event")
    }

    /// Wait until a peer is connected; returns its id.
    pub async fn wait_for_peer_connected(&mut self) -> ParticipantId {
        match self
            .wait_for(|e| matches!(e, SessionEvent::PeerConnected { .. }))
            .await
        {
            SessionEvent::PeerConnected { peer_id } => peer_id,
            _ => unreachable!(),
        }
    }

    /// Poll the session state until `predicate` holds.
    pub async fn wait_for_state<F>(&self, mut predicate: F) -> SessionState
    where
        F: FnMut(&SessionState) -> bool,
    {
        tokio::time::timeout(EVENT_TIMEOUT, async {
            loop {
                let state = self.handle.state().await.expect("session gone");
                if predicate(&state) {
                    return state;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("timed out waiting for session state")
    }

    /// Wait until chat can reach the connected peer.
    pub async fn wait_for_data_channel(&self) -> SessionState {
        self.wait_for_state(|s| s.peers.iter().any(|p| p.data_channel_open))
            .await
    }

    /// Wait until the session reports that it ended.
    pub async fn wait_for_end(&mut self) -> SessionEvent {
        self.wait_for(|e| matches!(e, SessionEvent::Ended { .. }))
            .await
    }
}
