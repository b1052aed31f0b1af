//! Session Surface.
//!
//! - [`actor`] - `CallSession` orchestrator and its handle
//! - [`chat`] - chat messages and the per-call log
//! - [`identity`] - who the local participant is
//! - [`verification`] - biometric verification records and the oracle seam

pub mod actor;
pub mod chat;
pub mod identity;
pub mod verification;

pub use actor::{
    CallSession, CallSessionHandle, EndReason, SessionDeps, SessionEvent, SessionParams,
    SessionState, StartedSession,
};
pub use chat::{ChatDirection, ChatEntry, ChatLog, ChatMessage};
pub use identity::{Identity, IdentityProvider, StaticIdentity};
pub use verification::{
    BiometricKind, HttpVerificationOracle, UnavailableOracle, VerificationOracle,
    VerificationRecord, VerificationRecords,
};
