//! Peer Connection Lifecycle Manager.
//!
//! - [`engine`] - media-engine seam (`MediaEngine`, `PeerTransport`)
//! - [`webrtc`] - `webrtc`-crate implementation of the seam
//! - [`negotiation`] - offer/answer/candidate/restart envelopes
//! - [`connection`] - per-peer state machine
//! - [`manager`] - registry, destroy-and-recreate, negotiation timeout

pub mod connection;
pub mod engine;
pub mod manager;
pub mod negotiation;
pub mod webrtc;

pub use connection::{PeerConnection, PeerState};
pub use engine::{
    IceCandidate, IceServer, MediaEngine, PeerEvent, PeerEventSink, PeerTransport,
    TransportEvent, TransportSpec,
};
pub use manager::{
    OutboundSignal, PeerEffects, PeerManager, PeerManagerSettings, PeerNotice, PeerSnapshot,
    RecreateReason,
};
pub use negotiation::{NegotiationBody, NegotiationEnvelope};
pub use webrtc::WebRtcEngine;
