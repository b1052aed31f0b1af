//! Observability for the call session.
//!
//! The library only records through the `metrics` facade; installing an
//! exporter is left to the embedding application. Labels are bounded:
//! - `reason`: recreate reasons (7 values)
//! - `direction`: sent, received
//! - `kind`: face, fingerprint
//! - `outcome`: verified, rejected, error
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `cs_signaling_reconnect_attempts_total` | Counter | none | Scheduled reconnection attempts |
//! | `cs_signaling_failures_total` | Counter | none | Reconnection bound exhausted |
//! | `cs_peer_recreations_total` | Counter | `reason` | Destroy-and-recreate cycles |
//! | `cs_negotiation_timeouts_total` | Counter | none | Hung negotiations failed |
//! | `cs_role_conflicts_total` | Counter | none | Remote participant held the local role |
//! | `cs_room_capacity_exceeded_total` | Counter | none | Third-participant rejections |
//! | `cs_chat_messages_total` | Counter | `direction` | Chat traffic |
//! | `cs_verifications_total` | Counter | `kind`, `outcome` | Verification results |
//! | `cs_active_peers` | Gauge | none | Live peer connections |

pub mod metrics;
