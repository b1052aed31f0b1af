//! `SignalingChannel` - durable control connection to the rendezvous server.
//!
//! Each `SignalingChannel`:
//! - Owns at most one live [`SignalingLink`] at a time
//! - Re-establishes the link after an unexpected close (bounded attempts,
//!   fixed delay) and re-announces the joined room
//! - Fans server events out to typed subscriptions
//!
//! # Lifecycle
//!
//! `disconnected -> connecting -> connected -> (reconnecting <-> connected) -> disconnected`
//!
//! A local `disconnect()` is never retried. Exhausting the attempt bound
//! leaves the channel disconnected until `connect()` is called again.
//! Cancelling the token aborts any attempt in flight.

use super::messages::{ClientFrame, ServerFrame, SignalEvent};
use super::transport::{SignalingConnector, SignalingLink};
use crate::config::Config;
use crate::errors::SignalingError;
use crate::observability::metrics;

use common::types::{ParticipantId, RoomId};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the signaling mailbox.
const SIGNALING_CHANNEL_BUFFER: usize = 100;

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting for or running reconnection attempt `attempt`.
    Reconnecting { attempt: u32 },
}

impl ConnectionState {
    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Why the link went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Caller invoked `disconnect()` or replaced the connection.
    Local,
    /// Server closed the link with a reason.
    Remote(String),
    /// Transport dropped without a close frame.
    TransportLost,
}

/// Connection-state notification delivered to notice subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionNotice {
    Connected,
    Disconnected { reason: DisconnectReason },
    Reconnecting { attempt: u32 },
    AttemptFailed { attempt: u32, max_attempts: u32 },
    /// Terminal: no further automatic attempt will be made.
    Failed { attempts: u32 },
    /// Operation rejected, e.g. join while disconnected.
    Error { message: String },
}

impl fmt::Display for ConnectionNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionNotice::Connected => f.write_str("Connected to signaling server"),
            ConnectionNotice::Disconnected {
                reason: DisconnectReason::Local,
            } => f.write_str("Manually disconnected"),
            ConnectionNotice::Disconnected {
                reason: DisconnectReason::Remote(reason),
            } => write!(f, "Disconnected by server: {reason}"),
            ConnectionNotice::Disconnected {
                reason: DisconnectReason::TransportLost,
            } => f.write_str("Connection lost"),
            ConnectionNotice::Reconnecting { attempt } => {
                write!(f, "Reconnecting (attempt {attempt})")
            }
            ConnectionNotice::AttemptFailed { attempt, .. } => {
                write!(f, "Connection attempt {attempt} failed. Retrying...")
            }
            ConnectionNotice::Failed { attempts } => write!(
                f,
                "Failed to connect after {attempts} attempts. Call connect() to try again."
            ),
            ConnectionNotice::Error { message } => f.write_str(message),
        }
    }
}

/// Reconnection policy and attempt timeout.
#[derive(Debug, Clone, Copy)]
pub struct ChannelSettings {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub connect_timeout: Duration,
}

impl From<&Config> for ChannelSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_attempts: config.reconnect_max_attempts,
            retry_delay: config.reconnect_delay,
            connect_timeout: config.connect_timeout,
        }
    }
}

/// Room traffic of every kind, in the order the server sent it.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    Members(Vec<ParticipantId>),
    PeerJoined(ParticipantId),
    PeerLeft(ParticipantId),
    Signal(SignalEvent),
}

/// In-order stream of one event kind. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription<T> {
    receiver: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    /// Next event, or `None` once the channel actor has stopped.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    /// Next already-delivered event, if any.
    pub fn try_recv(&mut self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    /// Detach from the channel. Pending events are discarded.
    pub fn unsubscribe(mut self) {
        self.receiver.close();
    }
}

enum Subscriber {
    PeerJoined(mpsc::UnboundedSender<ParticipantId>),
    PeerLeft(mpsc::UnboundedSender<ParticipantId>),
    RoomMembers(mpsc::UnboundedSender<Vec<ParticipantId>>),
    Signal(mpsc::UnboundedSender<SignalEvent>),
    Room(mpsc::UnboundedSender<RoomEvent>),
    Notice(mpsc::UnboundedSender<ConnectionNotice>),
}

#[derive(Default)]
struct Subscribers {
    peer_joined: Vec<mpsc::UnboundedSender<ParticipantId>>,
    peer_left: Vec<mpsc::UnboundedSender<ParticipantId>>,
    room_members: Vec<mpsc::UnboundedSender<Vec<ParticipantId>>>,
    signal: Vec<mpsc::UnboundedSender<SignalEvent>>,
    room: Vec<mpsc::UnboundedSender<RoomEvent>>,
    notice: Vec<mpsc::UnboundedSender<ConnectionNotice>>,
}

impl Subscribers {
    fn add(&mut self, subscriber: Subscriber) {
        match subscriber {
            Subscriber::PeerJoined(tx) => self.peer_joined.push(tx),
            Subscriber::PeerLeft(tx) => self.peer_left.push(tx),
            Subscriber::RoomMembers(tx) => self.room_members.push(tx),
            Subscriber::Signal(tx) => self.signal.push(tx),
            Subscriber::Room(tx) => self.room.push(tx),
            Subscriber::Notice(tx) => self.notice.push(tx),
        }
    }
}

/// Deliver to every live subscriber, pruning the closed ones.
fn publish<T: Clone>(subscribers: &mut Vec<mpsc::UnboundedSender<T>>, value: &T) {
    subscribers.retain(|tx| tx.send(value.clone()).is_ok());
}

enum ChannelMessage {
    Connect {
        local_id: ParticipantId,
        respond_to: oneshot::Sender<()>,
    },
    JoinRoom {
        room_id: RoomId,
        respond_to: oneshot::Sender<Result<(), SignalingError>>,
    },
    LeaveRoom {
        respond_to: oneshot::Sender<Result<(), SignalingError>>,
    },
    SendSignal {
        peer_id: ParticipantId,
        payload: Value,
        respond_to: oneshot::Sender<Result<(), SignalingError>>,
    },
    Subscribe {
        subscriber: Subscriber,
    },
    Disconnect {
        respond_to: oneshot::Sender<()>,
    },
}

/// Handle to a `SignalingChannel`.
#[derive(Clone, Debug)]
pub struct SignalingChannelHandle {
    sender: mpsc::Sender<ChannelMessage>,
    state: watch::Receiver<ConnectionState>,
    cancel_token: CancellationToken,
}

impl fmt::Debug for ChannelMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelMessage::Connect { .. } => "Connect",
            ChannelMessage::JoinRoom { .. } => "JoinRoom",
            ChannelMessage::LeaveRoom { .. } => "LeaveRoom",
            ChannelMessage::SendSignal { .. } => "SendSignal",
            ChannelMessage::Subscribe { .. } => "Subscribe",
            ChannelMessage::Disconnect { .. } => "Disconnect",
        };
        f.write_str(name)
    }
}

fn send_failed(e: impl fmt::Display) -> SignalingError {
    SignalingError::ActorGone(format!("channel send failed: {e}"))
}

fn receive_failed(e: impl fmt::Display) -> SignalingError {
    SignalingError::ActorGone(format!("response receive failed: {e}"))
}

impl SignalingChannelHandle {
    /// Open a connection identified by `local_id`, closing any previous one.
    ///
    /// Returns once the attempt is scheduled; progress is reported through
    /// notices and [`Self::state`].
    pub async fn connect(&self, local_id: ParticipantId) -> Result<(), SignalingError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ChannelMessage::Connect {
                local_id,
                respond_to: tx,
            })
            .await
            .map_err(send_failed)?;
        rx.await.map_err(receive_failed)
    }

    /// Announce presence in `room_id`. The room is re-announced after every
    /// reconnection.
    ///
    /// Fails with [`SignalingError::NotConnected`] (and an `Error` notice)
    /// if there is no live connection.
    pub async fn join_room(&self, room_id: RoomId) -> Result<(), SignalingError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ChannelMessage::JoinRoom {
                room_id,
                respond_to: tx,
            })
            .await
            .map_err(send_failed)?;
        rx.await.map_err(receive_failed)?
    }

    /// Leave the current room, keeping the connection.
    pub async fn leave_room(&self) -> Result<(), SignalingError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ChannelMessage::LeaveRoom { respond_to: tx })
            .await
            .map_err(send_failed)?;
        rx.await.map_err(receive_failed)?
    }

    /// Relay an opaque negotiation payload to `peer_id`.
    ///
    /// Fails with [`SignalingError::NotConnected`] (and an `Error` notice)
    /// if there is no live connection.
    pub async fn send_signal(
        &self,
        peer_id: ParticipantId,
        payload: Value,
    ) -> Result<(), SignalingError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ChannelMessage::SendSignal {
                peer_id,
                payload,
                respond_to: tx,
            })
            .await
            .map_err(send_failed)?;
        rx.await.map_err(receive_failed)?
    }

    /// Close the connection. Idempotent: always emits a `Disconnected` notice.
    pub async fn disconnect(&self) -> Result<(), SignalingError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ChannelMessage::Disconnect { respond_to: tx })
            .await
            .map_err(send_failed)?;
        rx.await.map_err(receive_failed)
    }

    pub async fn on_peer_joined(&self) -> Result<Subscription<ParticipantId>, SignalingError> {
        let (tx, receiver) = mpsc::unbounded_channel();
        self.subscribe(Subscriber::PeerJoined(tx)).await?;
        Ok(Subscription { receiver })
    }

    pub async fn on_peer_left(&self) -> Result<Subscription<ParticipantId>, SignalingError> {
        let (tx, receiver) = mpsc::unbounded_channel();
        self.subscribe(Subscriber::PeerLeft(tx)).await?;
        Ok(Subscription { receiver })
    }

    /// Room snapshots sent to the local participant after each join.
    pub async fn on_room_members(
        &self,
    ) -> Result<Subscription<Vec<ParticipantId>>, SignalingError> {
        let (tx, receiver) = mpsc::unbounded_channel();
        self.subscribe(Subscriber::RoomMembers(tx)).await?;
        Ok(Subscription { receiver })
    }

    pub async fn on_signal(&self) -> Result<Subscription<SignalEvent>, SignalingError> {
        let (tx, receiver) = mpsc::unbounded_channel();
        self.subscribe(Subscriber::Signal(tx)).await?;
        Ok(Subscription { receiver })
    }

    /// Membership changes and signals on one stream, preserving their
    /// relative order. A signal sent before its sender left is always seen
    /// before the departure.
    pub async fn on_room_event(&self) -> Result<Subscription<RoomEvent>, SignalingError> {
        let (tx, receiver) = mpsc::unbounded_channel();
        self.subscribe(Subscriber::Room(tx)).await?;
        Ok(Subscription { receiver })
    }

    pub async fn on_connection_notice(
        &self,
    ) -> Result<Subscription<ConnectionNotice>, SignalingError> {
        let (tx, receiver) = mpsc::unbounded_channel();
        self.subscribe(Subscriber::Notice(tx)).await?;
        Ok(Subscription { receiver })
    }

    async fn subscribe(&self, subscriber: Subscriber) -> Result<(), SignalingError> {
        self.sender
            .send(ChannelMessage::Subscribe { subscriber })
            .await
            .map_err(send_failed)
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Wait until the channel reports `Connected`.
    pub async fn wait_connected(&self) -> Result<(), SignalingError> {
        let mut state = self.state.clone();
        state
            .wait_for(ConnectionState::is_connected)
            .await
            .map(|_| ())
            .map_err(receive_failed)
    }

    /// Cancel the channel actor. Aborts any attempt in flight.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

struct PendingAttempt {
    attempt: u32,
    task: JoinHandle<Result<SignalingLink, SignalingError>>,
}

/// The `SignalingChannel` actor.
pub struct SignalingChannel {
    connector: Arc<dyn SignalingConnector>,
    settings: ChannelSettings,
    receiver: mpsc::Receiver<ChannelMessage>,
    cancel_token: CancellationToken,
    state: watch::Sender<ConnectionState>,
    /// Identity of the current connection; kept across reconnects.
    local_id: Option<ParticipantId>,
    /// The single live transport.
    link: Option<SignalingLink>,
    /// Connection attempt in flight, if any.
    pending: Option<PendingAttempt>,
    /// Room to re-announce after reconnecting.
    room_id: Option<RoomId>,
    subscribers: Subscribers,
}

impl SignalingChannel {
    /// Spawn a new signaling channel actor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        connector: Arc<dyn SignalingConnector>,
        settings: ChannelSettings,
        cancel_token: CancellationToken,
    ) -> (SignalingChannelHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(SIGNALING_CHANNEL_BUFFER);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let actor = Self {
            connector,
            settings,
            receiver,
            cancel_token: cancel_token.clone(),
            state: state_tx,
            local_id: None,
            link: None,
            pending: None,
            room_id: None,
            subscribers: Subscribers::default(),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = SignalingChannelHandle {
            sender,
            state: state_rx,
            cancel_token,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "cs.signaling")]
    async fn run(mut self) {
        debug!(target: "cs.signaling", "SignalingChannel started");

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(target: "cs.signaling", "SignalingChannel received cancellation signal");
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => self.handle_message(message),
                        None => {
                            debug!(target: "cs.signaling", "All handles dropped, stopping");
                            break;
                        }
                    }
                }

                (attempt, result) = next_attempt_result(&mut self.pending) => {
                    self.pending = None;
                    self.handle_attempt_result(attempt, result);
                }

                frame = next_frame(&mut self.link) => {
                    match frame {
                        Some(frame) => self.handle_frame(frame),
                        None => self.handle_unexpected_close(DisconnectReason::TransportLost),
                    }
                }
            }
        }

        self.abort_pending();
        self.link = None;
        self.state.send_replace(ConnectionState::Disconnected);

        debug!(target: "cs.signaling", "SignalingChannel stopped");
    }

    fn handle_message(&mut self, message: ChannelMessage) {
        match message {
            ChannelMessage::Connect {
                local_id,
                respond_to,
            } => {
                self.handle_connect(local_id);
                let _ = respond_to.send(());
            }
            ChannelMessage::JoinRoom {
                room_id,
                respond_to,
            } => {
                let result = self.handle_join_room(room_id);
                let _ = respond_to.send(result);
            }
            ChannelMessage::LeaveRoom { respond_to } => {
                self.room_id = None;
                let result = self.send_frame(ClientFrame::LeaveRoom);
                let _ = respond_to.send(result);
            }
            ChannelMessage::SendSignal {
                peer_id,
                payload,
                respond_to,
            } => {
                let result = self.send_frame(ClientFrame::Signal {
                    peer_id: peer_id.clone(),
                    signal: payload,
                });
                if result.is_err() {
                    self.report_error(format!("Cannot send signal to {peer_id}: not connected"));
                }
                let _ = respond_to.send(result);
            }
            ChannelMessage::Subscribe { subscriber } => self.subscribers.add(subscriber),
            ChannelMessage::Disconnect { respond_to } => {
                self.handle_disconnect();
                let _ = respond_to.send(());
            }
        }
    }

    fn handle_connect(&mut self, local_id: ParticipantId) {
        self.abort_pending();
        if self.link.take().is_some() {
            debug!(target: "cs.signaling", "Closing previous connection before reconnecting");
            self.notify(ConnectionNotice::Disconnected {
                reason: DisconnectReason::Local,
            });
        }

        info!(target: "cs.signaling", local_id = %local_id, "Connecting to signaling server");

        self.local_id = Some(local_id);
        self.set_state(ConnectionState::Connecting);
        self.start_attempt(1, Duration::ZERO);
    }

    fn handle_join_room(&mut self, room_id: RoomId) -> Result<(), SignalingError> {
        match self.send_frame(ClientFrame::JoinRoom {
            room_id: room_id.clone(),
        }) {
            Ok(()) => {
                info!(target: "cs.signaling", room_id = %room_id, "Joined room");
                self.room_id = Some(room_id);
                Ok(())
            }
            Err(e) => {
                self.report_error(format!("Cannot join room {room_id}: not connected"));
                Err(e)
            }
        }
    }

    fn handle_disconnect(&mut self) {
        self.abort_pending();
        if self.link.take().is_some() {
            info!(target: "cs.signaling", "Disconnected from signaling server");
        }
        self.room_id = None;
        self.set_state(ConnectionState::Disconnected);
        self.notify(ConnectionNotice::Disconnected {
            reason: DisconnectReason::Local,
        });
    }

    fn handle_attempt_result(&mut self, attempt: u32, result: Result<SignalingLink, SignalingError>) {
        match result {
            Ok(link) => {
                info!(target: "cs.signaling", attempt = attempt, "Connected to signaling server");
                self.link = Some(link);
                self.set_state(ConnectionState::Connected);
                self.notify(ConnectionNotice::Connected);

                if let Some(room_id) = self.room_id.clone() {
                    debug!(target: "cs.signaling", room_id = %room_id, "Re-announcing room after reconnect");
                    if let Err(e) = self.send_frame(ClientFrame::JoinRoom { room_id }) {
                        warn!(target: "cs.signaling", error = %e, "Failed to re-announce room");
                    }
                }
            }
            Err(e) if attempt < self.settings.max_attempts => {
                warn!(
                    target: "cs.signaling",
                    attempt = attempt,
                    max_attempts = self.settings.max_attempts,
                    error = %e,
                    "Connection attempt failed, retrying"
                );
                self.notify(ConnectionNotice::AttemptFailed {
                    attempt,
                    max_attempts: self.settings.max_attempts,
                });
                self.schedule_reconnect(attempt + 1);
            }
            Err(e) => {
                error!(
                    target: "cs.signaling",
                    attempts = attempt,
                    error = %e,
                    "Giving up on signaling connection"
                );
                metrics::record_signaling_failure();
                self.set_state(ConnectionState::Disconnected);
                self.notify(ConnectionNotice::Failed { attempts: attempt });
            }
        }
    }

    fn handle_frame(&mut self, frame: ServerFrame) {
        match frame {
            ServerFrame::RoomMembers { peer_ids } => {
                debug!(target: "cs.signaling", count = peer_ids.len(), "Room snapshot received");
                publish(&mut self.subscribers.room_members, &peer_ids);
                publish(&mut self.subscribers.room, &RoomEvent::Members(peer_ids));
            }
            ServerFrame::PeerJoined { peer_id } => {
                debug!(target: "cs.signaling", peer_id = %peer_id, "Peer joined");
                publish(&mut self.subscribers.peer_joined, &peer_id);
                publish(&mut self.subscribers.room, &RoomEvent::PeerJoined(peer_id));
            }
            ServerFrame::PeerLeft { peer_id } => {
                debug!(target: "cs.signaling", peer_id = %peer_id, "Peer left");
                publish(&mut self.subscribers.peer_left, &peer_id);
                publish(&mut self.subscribers.room, &RoomEvent::PeerLeft(peer_id));
            }
            ServerFrame::Signal { peer_id, signal } => {
                let event = SignalEvent {
                    from: peer_id,
                    payload: signal,
                };
                publish(&mut self.subscribers.signal, &event);
                publish(&mut self.subscribers.room, &RoomEvent::Signal(event));
            }
            ServerFrame::Close { reason } => {
                self.handle_unexpected_close(DisconnectReason::Remote(reason));
            }
        }
    }

    fn handle_unexpected_close(&mut self, reason: DisconnectReason) {
        self.link = None;
        warn!(target: "cs.signaling", reason = ?reason, "Signaling connection closed unexpectedly");
        self.notify(ConnectionNotice::Disconnected { reason });
        self.schedule_reconnect(1);
    }

    fn schedule_reconnect(&mut self, attempt: u32) {
        metrics::record_signaling_reconnect_attempt();
        self.set_state(ConnectionState::Reconnecting { attempt });
        self.notify(ConnectionNotice::Reconnecting { attempt });
        self.start_attempt(attempt, self.settings.retry_delay);
    }

    fn start_attempt(&mut self, attempt: u32, delay: Duration) {
        let Some(local_id) = self.local_id.clone() else {
            return;
        };
        let connector = Arc::clone(&self.connector);
        let timeout = self.settings.connect_timeout;

        let task = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match tokio::time::timeout(timeout, connector.open(&local_id)).await {
                Ok(result) => result,
                Err(_) => Err(SignalingError::Timeout),
            }
        });

        if let Some(previous) = self.pending.replace(PendingAttempt { attempt, task }) {
            previous.task.abort();
        }
    }

    fn abort_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.task.abort();
        }
    }

    fn send_frame(&mut self, frame: ClientFrame) -> Result<(), SignalingError> {
        let Some(link) = &self.link else {
            return Err(SignalingError::NotConnected);
        };
        link.outbound.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => {
                SignalingError::Protocol("outbound buffer full".to_string())
            }
            TrySendError::Closed(_) => SignalingError::NotConnected,
        })
    }

    fn report_error(&mut self, message: String) {
        error!(target: "cs.signaling", "{message}");
        self.notify(ConnectionNotice::Error { message });
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn notify(&mut self, notice: ConnectionNotice) {
        publish(&mut self.subscribers.notice, &notice);
    }
}

async fn next_attempt_result(
    pending: &mut Option<PendingAttempt>,
) -> (u32, Result<SignalingLink, SignalingError>) {
    match pending {
        Some(pending) => {
            let result = match (&mut pending.task).await {
                Ok(result) => result,
                Err(e) => Err(SignalingError::ConnectFailed(format!(
                    "attempt task failed: {e}"
                ))),
            };
            (pending.attempt, result)
        }
        None => std::future::pending().await,
    }
}

async fn next_frame(link: &mut Option<SignalingLink>) -> Option<ServerFrame> {
    match link {
        Some(link) => link.inbound.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tokio::sync::Mutex;

    /// Server ends of links handed out by `FakeConnector`.
    struct ServerEnd {
        from_client: mpsc::Receiver<ClientFrame>,
        to_client: mpsc::Sender<ServerFrame>,
    }

    #[derive(Default)]
    struct FakeConnector {
        refuse: AtomicBool,
        attempts: AtomicU32,
        servers: Mutex<Vec<ServerEnd>>,
    }

    impl FakeConnector {
        async fn take_server(&self) -> ServerEnd {
            self.servers.lock().await.pop().expect("no open link")
        }
    }

    #[async_trait]
    impl SignalingConnector for FakeConnector {
        async fn open(&self, _local_id: &ParticipantId) -> Result<SignalingLink, SignalingError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.refuse.load(Ordering::SeqCst) {
                return Err(SignalingError::ConnectFailed("refused".to_string()));
            }
            let (link, from_client, to_client) = SignalingLink::pair();
            self.servers.lock().await.push(ServerEnd {
                from_client,
                to_client,
            });
            Ok(link)
        }
    }

    fn settings() -> ChannelSettings {
        ChannelSettings {
            max_attempts: 5,
            retry_delay: Duration::from_millis(1000),
            connect_timeout: Duration::from_secs(10),
        }
    }

    fn spawn_channel(connector: &Arc<FakeConnector>) -> SignalingChannelHandle {
        let connector: Arc<dyn SignalingConnector> = Arc::clone(connector) as _;
        let (handle, _task) = SignalingChannel::spawn(connector, settings(), CancellationToken::new());
        handle
    }

    async fn connected_channel(
        connector: &Arc<FakeConnector>,
    ) -> (SignalingChannelHandle, Subscription<ConnectionNotice>) {
        let handle = spawn_channel(connector);
        let mut notices = handle.on_connection_notice().await.unwrap();
        handle.connect(ParticipantId::new("alice")).await.unwrap();
        assert_eq!(notices.recv().await, Some(ConnectionNotice::Connected));
        (handle, notices)
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_reports_connected() {
        let connector = Arc::new(FakeConnector::default());
        let (handle, _notices) = connected_channel(&connector).await;

        assert!(handle.is_connected());
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_room_while_disconnected_reports_error() {
        let connector = Arc::new(FakeConnector::default());
        let handle = spawn_channel(&connector);
        let mut notices = handle.on_connection_notice().await.unwrap();

        let result = handle.join_room(RoomId::parse("abc12345").unwrap()).await;

        assert_eq!(result, Err(SignalingError::NotConnected));
        assert!(matches!(
            notices.recv().await,
            Some(ConnectionNotice::Error { .. })
        ));

        let result = handle
            .send_signal(ParticipantId::new("bob"), json!({"type": "offer"}))
            .await;
        assert_eq!(result, Err(SignalingError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_close_exhausts_bounded_retries() {
        let connector = Arc::new(FakeConnector::default());
        let (handle, mut notices) = connected_channel(&connector).await;

        connector.refuse.store(true, Ordering::SeqCst);
        drop(connector.take_server().await);

        assert_eq!(
            notices.recv().await,
            Some(ConnectionNotice::Disconnected {
                reason: DisconnectReason::TransportLost
            })
        );
        for attempt in 1..5 {
            assert_eq!(
                notices.recv().await,
                Some(ConnectionNotice::Reconnecting { attempt })
            );
            assert_eq!(
                notices.recv().await,
                Some(ConnectionNotice::AttemptFailed {
                    attempt,
                    max_attempts: 5
                })
            );
        }
        assert_eq!(
            notices.recv().await,
            Some(ConnectionNotice::Reconnecting { attempt: 5 })
        );
        assert_eq!(
            notices.recv().await,
            Some(ConnectionNotice::Failed { attempts: 5 })
        );

        // 1 initial connect + 5 retries, and nothing further.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 6);
        assert!(!handle.is_connected());
        assert_eq!(handle.state(), ConnectionState::Disconnected);
        assert!(notices.try_recv().is_none());

        // Explicit connect starts over.
        connector.refuse.store(false, Ordering::SeqCst);
        handle.connect(ParticipantId::new("alice")).await.unwrap();
        assert_eq!(notices.recv().await, Some(ConnectionNotice::Connected));
        assert!(handle.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_close_is_retried_and_room_rejoined() {
        let connector = Arc::new(FakeConnector::default());
        let (handle, mut notices) = connected_channel(&connector).await;
        let room = RoomId::parse("abc12345").unwrap();

        handle.join_room(room.clone()).await.unwrap();
        let mut server = connector.take_server().await;
        assert_eq!(
            server.from_client.recv().await,
            Some(ClientFrame::JoinRoom {
                room_id: room.clone()
            })
        );

        server
            .to_client
            .send(ServerFrame::Close {
                reason: "restarting".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(
            notices.recv().await,
            Some(ConnectionNotice::Disconnected {
                reason: DisconnectReason::Remote("restarting".to_string())
            })
        );
        assert_eq!(
            notices.recv().await,
            Some(ConnectionNotice::Reconnecting { attempt: 1 })
        );
        assert_eq!(notices.recv().await, Some(ConnectionNotice::Connected));

        let mut server = connector.take_server().await;
        assert_eq!(
            server.from_client.recv().await,
            Some(ClientFrame::JoinRoom { room_id: room })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_is_idempotent_and_never_retried() {
        let connector = Arc::new(FakeConnector::default());
        let (handle, mut notices) = connected_channel(&connector).await;

        handle.disconnect().await.unwrap();
        handle.disconnect().await.unwrap();

        let local = Some(ConnectionNotice::Disconnected {
            reason: DisconnectReason::Local,
        });
        assert_eq!(notices.recv().await, local);
        assert_eq!(notices.recv().await, local);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(notices.try_recv().is_none());
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
        assert!(!handle.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_closes_previous_transport() {
        let connector = Arc::new(FakeConnector::default());
        let (handle, mut notices) = connected_channel(&connector).await;
        let mut first = connector.take_server().await;

        handle.connect(ParticipantId::new("alice")).await.unwrap();

        assert_eq!(
            notices.recv().await,
            Some(ConnectionNotice::Disconnected {
                reason: DisconnectReason::Local
            })
        );
        assert_eq!(notices.recv().await, Some(ConnectionNotice::Connected));
        // The first link's outbound sender was dropped.
        assert_eq!(first.from_client.recv().await, None);
        assert_eq!(connector.servers.lock().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_fan_out_to_every_subscriber() {
        let connector = Arc::new(FakeConnector::default());
        let (handle, _notices) = connected_channel(&connector).await;

        let mut first = handle.on_peer_joined().await.unwrap();
        let mut second = handle.on_peer_joined().await.unwrap();
        let detached = handle.on_peer_joined().await.unwrap();
        detached.unsubscribe();
        let mut signals = handle.on_signal().await.unwrap();

        let server = connector.take_server().await;
        server
            .to_client
            .send(ServerFrame::PeerJoined {
                peer_id: ParticipantId::new("bob"),
            })
            .await
            .unwrap();
        server
            .to_client
            .send(ServerFrame::Signal {
                peer_id: ParticipantId::new("bob"),
                signal: json!({"n": 1}),
            })
            .await
            .unwrap();

        assert_eq!(first.recv().await, Some(ParticipantId::new("bob")));
        assert_eq!(second.recv().await, Some(ParticipantId::new("bob")));
        assert_eq!(
            signals.recv().await,
            Some(SignalEvent {
                from: ParticipantId::new("bob"),
                payload: json!({"n": 1})
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_room_events_keep_server_order() {
        let connector = Arc::new(FakeConnector::default());
        let (handle, _notices) = connected_channel(&connector).await;
        let mut room = handle.on_room_event().await.unwrap();
        let mut members = handle.on_room_members().await.unwrap();
        let mut left = handle.on_peer_left().await.unwrap();

        let server = connector.take_server().await;
        let bob = || ParticipantId::new("bob");
        for frame in [
            ServerFrame::RoomMembers {
                peer_ids: vec![bob()],
            },
            ServerFrame::Signal {
                peer_id: bob(),
                signal: json!({"n": 1}),
            },
            ServerFrame::PeerLeft { peer_id: bob() },
            ServerFrame::PeerJoined { peer_id: bob() },
        ] {
            server.to_client.send(frame).await.unwrap();
        }

        assert_eq!(room.recv().await, Some(RoomEvent::Members(vec![bob()])));
        assert_eq!(
            room.recv().await,
            Some(RoomEvent::Signal(SignalEvent {
                from: bob(),
                payload: json!({"n": 1})
            }))
        );
        assert_eq!(room.recv().await, Some(RoomEvent::PeerLeft(bob())));
        assert_eq!(room.recv().await, Some(RoomEvent::PeerJoined(bob())));

        // Per-kind subscribers see only their own kind.
        assert_eq!(members.recv().await, Some(vec![bob()]));
        assert_eq!(members.try_recv(), None);
        assert_eq!(left.recv().await, Some(bob()));
        assert_eq!(left.try_recv(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_pending_attempt() {
        let connector = Arc::new(FakeConnector::default());
        let (handle, mut notices) = connected_channel(&connector).await;

        connector.refuse.store(true, Ordering::SeqCst);
        drop(connector.take_server().await);
        assert!(matches!(
            notices.recv().await,
            Some(ConnectionNotice::Disconnected { .. })
        ));

        handle.cancel();
        tokio::time::sleep(Duration::from_secs(30)).await;

        // Only the initial connect ran; the delayed retry was aborted.
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
        assert!(!handle.is_connected());
    }

    #[test]
    fn test_notice_messages() {
        assert_eq!(
            ConnectionNotice::AttemptFailed {
                attempt: 2,
                max_attempts: 5
            }
            .to_string(),
            "Connection attempt 2 failed. Retrying..."
        );
        assert_eq!(
            ConnectionNotice::Failed { attempts: 5 }.to_string(),
            "Failed to connect after 5 attempts. Call connect() to try again."
        );
        assert_eq!(
            ConnectionNotice::Disconnected {
                reason: DisconnectReason::Local
            }
            .to_string(),
            "Manually disconnected"
        );
    }
}
