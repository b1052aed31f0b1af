//! Duplex transport to the rendezvous server.
//!
//! A [`SignalingConnector`] opens one [`SignalingLink`] per connection
//! attempt. The link is a pair of channels: dropping `outbound` closes the
//! connection from the local side; `inbound` yielding `None` means the
//! transport is gone.

use super::messages::{ClientFrame, ServerFrame};
use crate::errors::SignalingError;
use async_trait::async_trait;
use common::types::ParticipantId;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

/// Buffer size of each direction of a link.
pub const LINK_CHANNEL_BUFFER: usize = 256;

/// Query parameter carrying the local participant id.
const USER_ID_QUERY_PARAM: &str = "userId";

/// One live connection to the rendezvous server.
#[derive(Debug)]
pub struct SignalingLink {
    pub outbound: mpsc::Sender<ClientFrame>,
    pub inbound: mpsc::Receiver<ServerFrame>,
}

impl SignalingLink {
    /// Create a link and the server-side ends of its channels.
    ///
    /// Used by connectors to wire their I/O tasks, and by in-memory servers.
    #[must_use]
    pub fn pair() -> (
        Self,
        mpsc::Receiver<ClientFrame>,
        mpsc::Sender<ServerFrame>,
    ) {
        let (outbound, outbound_rx) = mpsc::channel(LINK_CHANNEL_BUFFER);
        let (inbound_tx, inbound) = mpsc::channel(LINK_CHANNEL_BUFFER);
        (Self { outbound, inbound }, outbound_rx, inbound_tx)
    }
}

/// Opens connections to a rendezvous server.
#[async_trait]
pub trait SignalingConnector: Send + Sync + 'static {
    /// Open a connection identified by `local_id`.
    async fn open(&self, local_id: &ParticipantId) -> Result<SignalingLink, SignalingError>;
}

/// WebSocket connector speaking JSON text frames.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    base_url: String,
}

impl WebSocketConnector {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    /// URL of the connection for `local_id`.
    pub fn connection_url(&self, local_id: &ParticipantId) -> Result<Url, SignalingError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| SignalingError::ConnectFailed(format!("invalid signaling URL: {e}")))?;
        url.query_pairs_mut()
            .append_pair(USER_ID_QUERY_PARAM, local_id.as_str());
        Ok(url)
    }
}

#[async_trait]
impl SignalingConnector for WebSocketConnector {
    async fn open(&self, local_id: &ParticipantId) -> Result<SignalingLink, SignalingError> {
        let url = self.connection_url(local_id)?;

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectFailed(format!("websocket connect failed: {e}")))?;

        debug!(
            target: "cs.signaling",
            local_id = %local_id,
            "WebSocket connection established"
        );

        let (mut ws_write, mut ws_read) = ws_stream.split();
        let (link, mut outbound_rx, inbound_tx) = SignalingLink::pair();

        // Writer: ends when the local side drops its sender.
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let text = match frame.to_text() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(target: "cs.signaling", error = %e, "Dropping unencodable frame");
                        continue;
                    }
                };
                if ws_write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_write.send(Message::Close(None)).await;
            let _ = ws_write.close().await;
        });

        // Reader: ends on close, error, or when the local side stops listening.
        tokio::spawn(async move {
            while let Some(message) = ws_read.next().await {
                match message {
                    Ok(Message::Text(text)) => match ServerFrame::from_text(&text) {
                        Ok(frame) => {
                            if inbound_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(target: "cs.signaling", error = %e, "Ignoring malformed server frame");
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!(target: "cs.signaling", error = %e, "WebSocket read failed");
                        break;
                    }
                }
            }
        });

        Ok(link)
    }
}
