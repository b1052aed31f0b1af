//! Signaling: the control connection to the rendezvous server.
//!
//! - [`messages`] - JSON wire frames
//! - [`transport`] - connector seam and the WebSocket implementation
//! - [`channel`] - the `SignalingChannel` actor (reconnection, subscriptions)

pub mod channel;
pub mod messages;
pub mod transport;

pub use channel::{
    ChannelSettings, ConnectionNotice, ConnectionState, DisconnectReason, RoomEvent,
    SignalingChannel, SignalingChannelHandle, Subscription,
};
pub use messages::{ClientFrame, ServerFrame, SignalEvent};
pub use transport::{SignalingConnector, SignalingLink, WebSocketConnector};
