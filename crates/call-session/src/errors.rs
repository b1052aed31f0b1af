//! Call session error types.
//!
//! Runtime failures (transport loss, negotiation errors) are surfaced as
//! session events; these types are returned only where a caller can act on
//! them. Internal details are logged but not exposed through
//! `client_message`.

use common::types::Role;
use thiserror::Error;

/// Signaling channel errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalingError {
    /// Operation requires a live connection to the rendezvous server.
    #[error("Signaling channel is not connected")]
    NotConnected,

    /// A connection attempt was refused or failed.
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    /// A connection attempt exceeded the configured timeout.
    #[error("Connection attempt timed out")]
    Timeout,

    /// Frame could not be encoded or decoded.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The channel actor is no longer running.
    #[error("Signaling channel closed: {0}")]
    ActorGone(String),
}

/// Peer connection errors. Recoverable by destroy-and-recreate, except
/// `RoleConflict`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeerError {
    /// The media engine failed to build or drive a transport.
    #[error("Media engine error: {0}")]
    Engine(String),

    /// Offer/answer or candidate could not be applied.
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// A negotiation payload could not be decoded.
    #[error("Malformed negotiation payload: {0}")]
    MalformedSignal(String),

    /// The data channel is not open yet or was closed.
    #[error("Data channel unavailable")]
    DataChannelUnavailable,

    /// The remote participant holds the same role as the local one.
    #[error("Both participants joined as {0}")]
    RoleConflict(Role),
}

/// Local media errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    /// Camera or microphone could not be acquired.
    #[error("Media device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The remote stream has not delivered a frame yet.
    #[error("No frame available on remote stream")]
    NoFrame,
}

/// Verification trigger errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationError {
    /// Only the initiator may verify the other participant.
    #[error("Verification is restricted to the interviewer")]
    NotInitiator,

    /// Another verification is still running.
    #[error("A verification is already in progress")]
    InProgress,

    /// No connected peer with a remote stream.
    #[error("No remote stream to verify")]
    NoRemoteStream,

    /// Frame capture failed.
    #[error("Capture failed: {0}")]
    Capture(#[from] MediaError),

    /// The oracle could not produce a decision.
    #[error("Verification oracle error: {0}")]
    Oracle(String),
}

/// Call session error type.
///
/// Maps to stable numeric codes for the embedding UI:
/// - `Unauthenticated`: 2
/// - `Verification(NotInitiator)`: 3
/// - `InvalidRequest`, `Verification(InProgress | NoRemoteStream)`: 4
/// - `CapacityExceeded`: 7
/// - `MediaUnavailable`: 8
/// - `Signaling`, `Peer`, `Verification(Oracle | Capture)`: 9
/// - `Ended`, `Internal`: 6
#[derive(Debug, Error)]
pub enum SessionError {
    /// No authenticated identity is available.
    #[error("Not authenticated")]
    Unauthenticated,

    /// Local media could not be acquired; the session never starts.
    #[error("Media unavailable: {0}")]
    MediaUnavailable(#[source] MediaError),

    /// The room already holds two participants.
    #[error("Room is full")]
    CapacityExceeded,

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),

    #[error("Verification error: {0}")]
    Verification(#[from] VerificationError),

    /// Request rejected before reaching any transport.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The session has already terminated.
    #[error("Session has ended")]
    Ended,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SessionError {
    /// Returns the numeric error code for this error.
    #[must_use]
    pub fn error_code(&self) -> i32 {
        match self {
            SessionError::Unauthenticated => 2,
            SessionError::Verification(VerificationError::NotInitiator) => 3,
            SessionError::InvalidRequest(_)
            | SessionError::Verification(
                VerificationError::InProgress | VerificationError::NoRemoteStream,
            ) => 4,
            SessionError::CapacityExceeded => 7,
            SessionError::MediaUnavailable(_) => 8,
            SessionError::Signaling(_)
            | SessionError::Peer(_)
            | SessionError::Verification(
                VerificationError::Oracle(_) | VerificationError::Capture(_),
            ) => 9,
            SessionError::Ended | SessionError::Internal(_) => 6,
        }
    }

    /// Returns a user-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            SessionError::Unauthenticated => "Please sign in to join the call".to_string(),
            SessionError::MediaUnavailable(_) => {
                "Could not access camera or microphone".to_string()
            }
            SessionError::CapacityExceeded => {
                "This room already has two participants".to_string()
            }
            SessionError::Signaling(SignalingError::NotConnected) => {
                "Not connected to the call server".to_string()
            }
            SessionError::Signaling(_) => "Connection to the call server failed".to_string(),
            SessionError::Peer(_) => "Connection to the other participant failed".to_string(),
            SessionError::Verification(VerificationError::Oracle(_)) => {
                "Verification service unavailable".to_string()
            }
            SessionError::Verification(e) => e.to_string(),
            SessionError::InvalidRequest(msg) => msg.clone(),
            SessionError::Ended => "The call has ended".to_string(),
            SessionError::Internal(_) => "An internal error occurred".to_string(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(SessionError::Unauthenticated.error_code(), 2);
        assert_eq!(
            SessionError::Verification(VerificationError::NotInitiator).error_code(),
            3
        );
        assert_eq!(
            SessionError::InvalidRequest("empty".to_string()).error_code(),
            4
        );
        assert_eq!(SessionError::CapacityExceeded.error_code(), 7);
        assert_eq!(
            SessionError::MediaUnavailable(MediaError::DeviceUnavailable("cam".to_string()))
                .error_code(),
            8
        );
        assert_eq!(
            SessionError::Signaling(SignalingError::Timeout).error_code(),
            9
        );
        assert_eq!(SessionError::Ended.error_code(), 6);
    }

    #[test]
    fn test_client_messages_hide_internal_details() {
        let err = SessionError::Internal("mailbox closed at 0xdeadbeef".to_string());
        assert_eq!(err.client_message(), "An internal error occurred");

        let err = SessionError::Signaling(SignalingError::ConnectFailed(
            "tcp connect error 10.0.0.7:5000".to_string(),
        ));
        assert!(!err.client_message().contains("10.0.0.7"));

        let err = SessionError::Verification(VerificationError::Oracle(
            "HTTP 500 from internal host".to_string(),
        ));
        assert!(!err.client_message().contains("internal host"));
    }

    #[test]
    fn test_from_conversions() {
        let err: SessionError = SignalingError::NotConnected.into();
        assert!(matches!(
            err,
            SessionError::Signaling(SignalingError::NotConnected)
        ));

        let err: VerificationError = MediaError::NoFrame.into();
        assert_eq!(err, VerificationError::Capture(MediaError::NoFrame));
    }
}
