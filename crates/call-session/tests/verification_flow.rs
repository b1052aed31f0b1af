//! In-call biometric verification scenarios.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use call_session::errors::{SessionError, VerificationError};
use call_session::session::{BiometricKind, SessionEvent};
use call_test_utils::{
    MockNetwork, MockOracle, MockRendezvous, RunningParticipant, TestParticipant,
};
use std::time::Duration;
use tokio::time::Instant;

const ROOM: &str = "abc12345";

async fn call_with_oracle(
    oracle: MockOracle,
) -> (RunningParticipant, RunningParticipant, MockRendezvous) {
    let rendezvous = MockRendezvous::new();
    let network = MockNetwork::new();
    let mut interviewer = TestParticipant::interviewer("alice")
        .with_oracle(oracle)
        .start(&rendezvous, &network, ROOM)
        .await;
    let mut interviewee = TestParticipant::interviewee("bob")
        .start(&rendezvous, &network, ROOM)
        .await;
    interviewer.wait_for_peer_connected().await;
    interviewee.wait_for_peer_connected().await;
    (interviewer, interviewee, rendezvous)
}

#[tokio::test(start_paused = true)]
async fn test_face_verification_is_recorded() {
    let oracle = MockOracle::passing();
    let (mut alice, _bob, _rendezvous) = call_with_oracle(oracle.clone()).await;
    let started = Instant::now();

    alice.handle.verify(BiometricKind::Face).await.unwrap();
    assert!(alice.handle.state().await.unwrap().verification_in_progress);

    let event = alice
        .wait_for(|e| matches!(e, SessionEvent::VerificationUpdated(_)))
        .await;
    let SessionEvent::VerificationUpdated(record) = event else {
        unreachable!()
    };
    assert_eq!(record.kind, BiometricKind::Face);
    assert!(record.verified);
    // The scan delay elapses before the decision.
    assert!(started.elapsed() >= Duration::from_secs(3));

    let captures = oracle.captures();
    assert_eq!(captures.len(), 1);
    assert_eq!(captures[0].0, BiometricKind::Face);
    assert_eq!(captures[0].1.width, Some(640));
    assert_eq!(captures[0].1.height, Some(480));

    let state = alice.handle.state().await.unwrap();
    assert!(!state.verification_in_progress);
    assert_eq!(state.verifications, vec![record]);
}

#[tokio::test(start_paused = true)]
async fn test_rejection_is_recorded_per_kind() {
    let (mut alice, _bob, _rendezvous) = call_with_oracle(MockOracle::rejecting()).await;

    alice.handle.verify(BiometricKind::Fingerprint).await.unwrap();
    alice
        .wait_for(|e| matches!(e, SessionEvent::VerificationUpdated(_)))
        .await;

    let state = alice.handle.state().await.unwrap();
    assert_eq!(state.verifications.len(), 1);
    assert_eq!(state.verifications[0].kind, BiometricKind::Fingerprint);
    assert!(!state.verifications[0].verified);
}

#[tokio::test(start_paused = true)]
async fn test_oracle_error_leaves_no_record() {
    let (mut alice, _bob, _rendezvous) = call_with_oracle(MockOracle::erroring()).await;

    alice.handle.verify(BiometricKind::Face).await.unwrap();

    let event = alice
        .wait_for(|e| matches!(e, SessionEvent::VerificationFailed { .. }))
        .await;
    assert!(matches!(
        event,
        SessionEvent::VerificationFailed {
            kind: BiometricKind::Face,
            ..
        }
    ));
    assert!(alice.handle.state().await.unwrap().verifications.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_only_one_verification_at_a_time() {
    let (alice, _bob, _rendezvous) = call_with_oracle(MockOracle::passing()).await;

    alice.handle.verify(BiometricKind::Face).await.unwrap();
    let second = alice.handle.verify(BiometricKind::Fingerprint).await;

    assert!(matches!(
        second,
        Err(SessionError::Verification(VerificationError::InProgress))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_interviewee_cannot_verify() {
    let oracle = MockOracle::passing();
    let (_alice, bob, _rendezvous) = call_with_oracle(oracle.clone()).await;

    let result = bob.handle.verify(BiometricKind::Face).await;

    assert!(matches!(
        result,
        Err(SessionError::Verification(VerificationError::NotInitiator))
    ));
    assert_eq!(oracle.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_verification_needs_a_connected_peer() {
    let rendezvous = MockRendezvous::new();
    let network = MockNetwork::new();
    let alice = TestParticipant::interviewer("alice")
        .start(&rendezvous, &network, ROOM)
        .await;

    let result = alice.handle.verify(BiometricKind::Face).await;

    assert!(matches!(
        result,
        Err(SessionError::Verification(VerificationError::NoRemoteStream))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_hangup_resets_records_and_cancels_scan() {
    let oracle = MockOracle::passing();
    let (mut alice, _bob, _rendezvous) = call_with_oracle(oracle.clone()).await;

    alice.handle.verify(BiometricKind::Face).await.unwrap();
    alice
        .wait_for(|e| matches!(e, SessionEvent::VerificationUpdated(_)))
        .await;

    // A second scan is cut short by the hangup.
    alice.handle.verify(BiometricKind::Fingerprint).await.unwrap();
    alice.handle.hangup().await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    let state = alice.handle.state().await.unwrap();
    assert!(state.ended);
    assert!(state.verifications.is_empty());
    assert!(!state.verification_in_progress);
    assert_eq!(oracle.call_count(), 1);
}
