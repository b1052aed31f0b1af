//! Metric recording functions.
//!
//! All metrics use the `cs_` prefix and the `_total` suffix for counters.

use metrics::{counter, gauge};

// ============================================================================
// Signaling
// ============================================================================

/// Metric: `cs_signaling_reconnect_attempts_total`
pub fn record_signaling_reconnect_attempt() {
    counter!("cs_signaling_reconnect_attempts_total").increment(1);
}

/// Record that the reconnection bound was exhausted.
///
/// Metric: `cs_signaling_failures_total`
pub fn record_signaling_failure() {
    counter!("cs_signaling_failures_total").increment(1);
}

// ============================================================================
// Peers
// ============================================================================

/// Record one destroy-and-recreate cycle.
///
/// Metric: `cs_peer_recreations_total`
/// Labels: `reason`
pub fn record_peer_recreation(reason: &'static str) {
    counter!("cs_peer_recreations_total", "reason" => reason).increment(1);
}

/// Metric: `cs_negotiation_timeouts_total`
pub fn record_negotiation_timeout() {
    counter!("cs_negotiation_timeouts_total").increment(1);
}

/// Record that the remote participant held the local role.
///
/// Metric: `cs_role_conflicts_total`
pub fn record_role_conflict() {
    counter!("cs_role_conflicts_total").increment(1);
}

/// Set the number of live peer connections.
///
/// Metric: `cs_active_peers`
pub fn set_active_peers(count: usize) {
    // usize to f64 conversion is safe for a two-party room
    #[allow(clippy::cast_precision_loss)]
    gauge!("cs_active_peers").set(count as f64);
}

// ============================================================================
// Session
// ============================================================================

/// Metric: `cs_room_capacity_exceeded_total`
pub fn record_capacity_exceeded() {
    counter!("cs_room_capacity_exceeded_total").increment(1);
}

/// Metric: `cs_chat_messages_total`
/// Labels: `direction` (sent, received)
pub fn record_chat_message(direction: &'static str) {
    counter!("cs_chat_messages_total", "direction" => direction).increment(1);
}

/// Record a finished verification.
///
/// Metric: `cs_verifications_total`
/// Labels: `kind` (face, fingerprint), `outcome` (verified, rejected, error)
pub fn record_verification(kind: &'static str, outcome: &'static str) {
    counter!("cs_verifications_total", "kind" => kind, "outcome" => outcome).increment(1);
}
