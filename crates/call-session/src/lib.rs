//! Call Session Library
//!
//! Orchestrates one side of a two-party SecureCall video call:
//!
//! - Rendezvous signaling with bounded reconnection
//! - Room admission with a hard two-participant cap
//! - One peer connection per remote participant, rebuilt from scratch on
//!   failure
//! - Chat over peer data channels and in-call biometric verification
//!
//! # Architecture
//!
//! ```text
//! CallSession (one per call, owns everything below)
//! ├── SignalingChannel actor (WebSocket to the rendezvous server)
//! ├── RoomCoordinator (membership, capacity)
//! ├── PeerManager
//! │   └── PeerConnection (one per remote participant)
//! │       └── PeerTransport (webrtc)
//! └── LocalStream (shared read-only by every peer)
//! ```
//!
//! All reactions run on the `CallSession` task. Signaling runs in its own
//! actor and is reached only through its handle.
//!
//! # Modules
//!
//! - [`config`] - Configuration from environment
//! - [`errors`] - Error types
//! - [`media`] - Local and remote media streams
//! - [`observability`] - Metrics
//! - [`peer`] - Peer connection lifecycle
//! - [`room`] - Room membership
//! - [`session`] - Session surface
//! - [`signaling`] - Rendezvous signaling channel

#![warn(clippy::pedantic)]

pub mod config;
pub mod errors;
pub mod media;
pub mod observability;
pub mod peer;
pub mod room;
pub mod session;
pub mod signaling;
