//! Call Agent
//!
//! Headless SecureCall participant. Joins one room, prints session events,
//! and sends each stdin line as a chat message.
//!
//! # Environment
//!
//! - `CS_ROOM` - room id or invite link (default: a new room)
//! - `CS_ROLE` - `interviewer` or `interviewee` (default: `interviewer`)
//! - `CS_USER_ID` / `CS_USERNAME` - local identity (default: random id)
//! - every `CS_*` variable read by [`Config::from_env`]
//!
//! # Commands
//!
//! - `/mute`, `/camera` - toggle local tracks
//! - `/verify face|fingerprint` - verify the remote participant (interviewer)
//! - `/state` - print a session snapshot
//! - `/quit` - hang up

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)]

use std::sync::Arc;

use call_session::config::Config;
use call_session::media::{MediaConstraints, SyntheticDevices};
use call_session::peer::WebRtcEngine;
use call_session::session::{
    BiometricKind, CallSession, CallSessionHandle, HttpVerificationOracle, Identity,
    SessionDeps, SessionEvent, SessionParams, StaticIdentity, UnavailableOracle,
    VerificationOracle,
};
use call_session::signaling::WebSocketConnector;
use common::types::{ParticipantId, Role, RoomId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Library events use `cs.*` targets rather than the crate path.
const DEFAULT_LOG_FILTER: &str = "call_agent=info,call_session=info,cs=info";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Call Agent");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;
    info!(
        signaling_url = %config.signaling_url,
        ice_servers = config.ice_servers.len(),
        "Configuration loaded"
    );

    let room_id = match std::env::var("CS_ROOM") {
        Ok(value) => RoomId::parse(&value).or_else(|_| RoomId::from_invite_url(&value))?,
        Err(_) => RoomId::generate(),
    };
    let role = match std::env::var("CS_ROLE") {
        Ok(value) => Role::from_name(&value).ok_or_else(|| format!("Unknown role: {value}"))?,
        Err(_) => Role::Initiator,
    };
    let user_id = std::env::var("CS_USER_ID")
        .map_or_else(|_| ParticipantId::random(), ParticipantId::new);
    let username = std::env::var("CS_USERNAME").unwrap_or_else(|_| user_id.to_string());

    let oracle: Arc<dyn VerificationOracle> = match &config.verification_url {
        Some(url) => Arc::new(HttpVerificationOracle::new(url.clone())?),
        None => Arc::new(UnavailableOracle),
    };
    let deps = SessionDeps {
        connector: Arc::new(WebSocketConnector::new(config.signaling_url.clone())),
        engine: Arc::new(WebRtcEngine::new()?),
        devices: Arc::new(SyntheticDevices),
        oracle,
        identity: Arc::new(StaticIdentity::new(Identity {
            id: user_id,
            username,
        })),
    };
    let params = SessionParams {
        room_id,
        role,
        constraints: MediaConstraints::default(),
    };

    let cancel_token = CancellationToken::new();
    let started = CallSession::start(&config, params, deps, cancel_token.clone()).await?;
    let handle = started.handle;
    let mut events = started.events;

    info!(
        room_id = %handle.room_id(),
        role = %handle.role(),
        invite_url = %handle.invite_url(),
        "Call started - type to chat, /quit to hang up"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => {
                info!("Shutdown signal received, hanging up");
                break;
            }

            event = events.recv() => {
                match event {
                    Ok(SessionEvent::Ended { reason }) => {
                        info!(reason = reason.as_str(), "Call ended");
                        break;
                    }
                    Ok(event) => print_event(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped = skipped, "Event stream lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }

            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if !run_command(&handle, line.trim()).await {
                            break;
                        }
                    }
                    Ok(None) => {
                        info!("Stdin closed, hanging up");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to read stdin");
                        break;
                    }
                }
            }
        }
    }

    if let Err(e) = handle.hangup().await {
        warn!(error = %e, "Hangup not delivered");
    }
    cancel_token.cancel();
    drop(handle);
    if let Err(e) = started.task.await {
        warn!(error = %e, "Session task ended abnormally");
    }

    info!("Call Agent shutdown complete");
    Ok(())
}

/// Returns `false` when the agent should stop.
async fn run_command(handle: &CallSessionHandle, line: &str) -> bool {
    if line.is_empty() {
        return true;
    }

    let result = match line.split_once(' ').unwrap_or((line, "")) {
        ("/quit", _) => return false,
        ("/mute", _) => handle
            .toggle_audio()
            .await
            .map(|enabled| info!(audio_enabled = enabled, "Microphone toggled")),
        ("/camera", _) => handle
            .toggle_video()
            .await
            .map(|enabled| info!(video_enabled = enabled, "Camera toggled")),
        ("/verify", kind) => match BiometricKind::from_name(kind) {
            Some(kind) => handle
                .verify(kind)
                .await
                .map(|()| info!(kind = %kind, "Verification requested")),
            None => {
                warn!("Usage: /verify face|fingerprint");
                return true;
            }
        },
        ("/state", _) => handle.state().await.map(|state| {
            info!(
                signaling = ?state.signaling,
                members = state.members.len(),
                peers = state.peers.len(),
                chat = state.chat.len(),
                verifications = state.verifications.len(),
                audio_enabled = state.audio_enabled,
                video_enabled = state.video_enabled,
                "Session state"
            );
        }),
        _ => handle.send_chat(line).await.map(|_| ()),
    };

    if let Err(e) = result {
        warn!(error_code = e.error_code(), "{}", e.client_message());
    }
    true
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::Connection(notice) => info!("{}", notice),
        SessionEvent::CapacityExceeded => warn!("Room is full - leaving"),
        SessionEvent::RoleConflict { peer_id, role } => {
            warn!(peer_id = %peer_id, role = %role, "Both participants chose the same role - leaving");
        }
        SessionEvent::PeerConnected { peer_id } => info!(peer_id = %peer_id, "Peer connected"),
        SessionEvent::PeerDisconnected { peer_id } => {
            info!(peer_id = %peer_id, "Peer disconnected");
        }
        SessionEvent::ChatReceived { message, .. } => {
            info!(sender = %message.sender, "{}", message.text);
        }
        SessionEvent::VerificationUpdated(record) => info!(
            kind = %record.kind,
            verified = record.verified,
            "Verification result"
        ),
        SessionEvent::VerificationFailed { kind, message } => {
            warn!(kind = %kind, "Verification failed: {}", message);
        }
        SessionEvent::Ended { reason } => info!(reason = reason.as_str(), "Call ended"),
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tracing_subscriber::layer::Context;
    use tracing_subscriber::{EnvFilter, Layer};

    struct CountingLayer(Arc<AtomicUsize>);

    impl<S: tracing::Subscriber> Layer<S> for CountingLayer {
        fn on_event(&self, _event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_default_filter_keeps_library_targets() {
        let seen = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry()
            .with(EnvFilter::new(DEFAULT_LOG_FILTER))
            .with(CountingLayer(Arc::clone(&seen)));

        tracing::subscriber::with_default(subscriber, || {
            info!(target: "cs.session", "kept");
            info!(target: "cs.peer", "kept");
            tracing::debug!(target: "cs.session", "below level");
            info!(target: "hyper", "other crate");
        });

        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
