//! # Call Test Utilities
//!
//! Shared test utilities for the call session orchestrator.
//!
//! This crate provides in-memory stand-ins for every collaborator of a
//! `CallSession`, so two (or three) sessions can hold a complete call
//! inside one test process without a network.
//!
//! ## Modules
//!
//! - `mock_rendezvous` - In-memory rendezvous server implementing `SignalingConnector`
//! - `mock_media` - `MediaEngine` whose transports pair up over a shared `MockNetwork`
//! - `mock_devices` - Working and failing `MediaDevices`
//! - `mock_oracle` - Scripted `VerificationOracle`
//! - `fixtures` - Fast configuration, identities and session wiring
//!
//! ## Usage
//!
//! ```rust,ignore
//! use call_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let rendezvous = MockRendezvous::new();
//!     let network = MockNetwork::new();
//!
//!     let alice = TestParticipant::interviewer("alice")
//!         .start(&rendezvous, &network, "abc12345")
//!         .await;
//!     let bob = TestParticipant::interviewee("bob")
//!         .start(&rendezvous, &network, "abc12345")
//!         .await;
//!
//!     alice.wait_for_peer_connected().await;
//!     // Run your test...
//! }
//! ```

pub mod fixtures;
pub mod mock_devices;
pub mod mock_media;
pub mod mock_oracle;
pub mod mock_rendezvous;

// Re-export commonly used items
pub use fixtures::*;
pub use mock_devices::*;
pub use mock_media::*;
pub use mock_oracle::*;
pub use mock_rendezvous::*;
