//! Identity seam.
//!
//! Authentication happens elsewhere; the session only asks who the local
//! participant is and refuses to start when nobody is signed in.

use common::types::ParticipantId;

/// The authenticated local participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: ParticipantId,
    /// Display name, used as the sender of chat messages.
    pub username: String,
}

impl Identity {
    #[must_use]
    pub fn new(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: ParticipantId::new(id),
            username: username.into(),
        }
    }
}

pub trait IdentityProvider: Send + Sync + 'static {
    /// The signed-in identity, or `None` if unauthenticated.
    fn current(&self) -> Option<Identity>;
}

/// Fixed identity, for headless agents and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    identity: Option<Identity>,
}

impl StaticIdentity {
    #[must_use]
    pub fn new(identity: Identity) -> Self {
        Self {
            identity: Some(identity),
        }
    }

    /// A provider with nobody signed in.
    #[must_use]
    pub fn anonymous() -> Self {
        Self { identity: None }
    }
}

impl IdentityProvider for StaticIdentity {
    fn current(&self) -> Option<Identity> {
        self.identity.clone()
    }
}
