//! [`MediaEngine`] backed by the `webrtc` crate.
//!
//! One `RTCPeerConnection` per transport, carrying every local track, a
//! single reliable ordered `chat` data channel (opened by the initiator) and
//! trickled ICE. Remote VP8 video is reassembled into frames so the latest
//! one can be captured for verification.

use super::engine::{
    IceCandidate, IceServer, MediaEngine, PeerEventSink, PeerTransport, TransportEvent,
    TransportSpec,
};
use crate::errors::PeerError;
use crate::media::{ImageCapture, RemoteStream, RemoteStreamFeed, TrackKind};

use async_trait::async_trait;
use bytes::Bytes;
use common::secret::ExposeSecret;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine as RtcMediaEngine, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::io::sample_builder::SampleBuilder;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp::codecs::vp8::Vp8Packet;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Label of the chat data channel.
pub const CHAT_CHANNEL_LABEL: &str = "chat";

/// Packets the sample builder may hold back while reordering.
const SAMPLE_BUILDER_MAX_LATE: u16 = 64;

/// RTP clock rate of VP8 video.
const VIDEO_CLOCK_RATE: u32 = 90_000;

type FeedSlot = Arc<Mutex<Option<RemoteStreamFeed>>>;
type DataChannelSlot = Arc<RwLock<Option<Arc<RTCDataChannel>>>>;

fn engine_error(e: impl std::fmt::Display) -> PeerError {
    PeerError::Engine(e.to_string())
}

fn negotiation_error(e: impl std::fmt::Display) -> PeerError {
    PeerError::Negotiation(e.to_string())
}

fn to_rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server
            .credential
            .as_ref()
            .map(|c| c.expose_secret().to_string())
            .unwrap_or_default(),
        ..Default::default()
    }
}

pub struct WebRtcEngine {
    api: API,
}

impl WebRtcEngine {
    /// Build an engine with the default codecs (Opus, VP8, ...) and
    /// interceptors.
    pub fn new() -> Result<Self, PeerError> {
        let mut media_engine = RtcMediaEngine::default();
        media_engine.register_default_codecs().map_err(engine_error)?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(engine_error)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api })
    }
}

#[async_trait]
impl MediaEngine for WebRtcEngine {
    async fn create_transport(
        &self,
        spec: TransportSpec,
        events: PeerEventSink,
    ) -> Result<Box<dyn PeerTransport>, PeerError> {
        let config = RTCConfiguration {
            ice_servers: spec.ice_servers.iter().map(to_rtc_ice_server).collect(),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(engine_error)?,
        );

        for track in spec.local_stream.tracks() {
            let rtc_track: Arc<dyn TrackLocal + Send + Sync> = track.rtc_track();
            let sender = pc.add_track(rtc_track).await.map_err(engine_error)?;
            // RTCP must be drained for interceptors (NACK, reports) to run.
            tokio::spawn(async move { while sender.read_rtcp().await.is_ok() {} });
        }

        install_ice_handler(&pc, events.clone());
        install_state_handler(&pc, events.clone());
        install_track_handler(&pc, events.clone());

        let data_channel: DataChannelSlot = Arc::new(RwLock::new(None));
        if spec.role.is_initiator() {
            let dc = pc
                .create_data_channel(CHAT_CHANNEL_LABEL, None)
                .await
                .map_err(engine_error)?;
            attach_data_channel(&dc, events.clone());
            *data_channel.write().await = Some(dc);
        } else {
            let slot = Arc::clone(&data_channel);
            let dc_events = events.clone();
            pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let slot = Arc::clone(&slot);
                let events = dc_events.clone();
                Box::pin(async move {
                    if dc.label() != CHAT_CHANNEL_LABEL {
                        debug!(target: "cs.peer", label = dc.label(), "Ignoring unknown data channel");
                        return;
                    }
                    attach_data_channel(&dc, events);
                    *slot.write().await = Some(dc);
                })
            }));
        }

        debug!(
            target: "cs.peer",
            peer_id = %spec.peer_id,
            connection_id = %events.connection_id(),
            "WebRTC transport created"
        );

        Ok(Box::new(WebRtcTransport {
            pc,
            data_channel,
            closed: AtomicBool::new(false),
        }))
    }
}

fn install_ice_handler(pc: &Arc<RTCPeerConnection>, events: PeerEventSink) {
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        if let Some(candidate) = candidate {
            match candidate.to_json() {
                Ok(init) => events.emit(TransportEvent::LocalCandidate(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                })),
                Err(e) => {
                    warn!(target: "cs.peer", error = %e, "Failed to serialize local candidate");
                }
            }
        }
        Box::pin(async {})
    }));
}

fn install_state_handler(pc: &Arc<RTCPeerConnection>, events: PeerEventSink) {
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        debug!(
            target: "cs.peer",
            peer_id = %events.peer_id(),
            state = %state,
            "Transport state changed"
        );
        match state {
            RTCPeerConnectionState::Failed => {
                events.emit(TransportEvent::Failed("peer connection failed".to_string()));
            }
            RTCPeerConnectionState::Closed => events.emit(TransportEvent::Closed),
            _ => {}
        }
        Box::pin(async {})
    }));
}

fn install_track_handler(pc: &Arc<RTCPeerConnection>, events: PeerEventSink) {
    let feed: FeedSlot = Arc::new(Mutex::new(None));
    pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
        let events = events.clone();
        let feed = Arc::clone(&feed);
        Box::pin(async move {
            let kind = match track.kind() {
                RTPCodecType::Audio => TrackKind::Audio,
                RTPCodecType::Video => TrackKind::Video,
                _ => return,
            };

            {
                let mut slot = feed.lock().await;
                match slot.as_ref() {
                    Some(existing) => existing.add_track(kind),
                    None => {
                        let (new_feed, stream) =
                            RemoteStream::new(track.stream_id().to_string(), kind);
                        *slot = Some(new_feed);
                        info!(target: "cs.peer", peer_id = %events.peer_id(), "Remote stream received");
                        events.emit(TransportEvent::RemoteStream(stream));
                    }
                }
            }

            let is_vp8 = track
                .codec()
                .capability
                .mime_type
                .eq_ignore_ascii_case(MIME_TYPE_VP8);
            if kind == TrackKind::Video && is_vp8 {
                tokio::spawn(capture_video(track, feed));
            } else {
                tokio::spawn(async move { while track.read_rtp().await.is_ok() {} });
            }
        })
    }));
}

/// Reassemble VP8 frames into the remote stream's latest-frame slot.
async fn capture_video(track: Arc<TrackRemote>, feed: FeedSlot) {
    let mut builder = SampleBuilder::new(
        SAMPLE_BUILDER_MAX_LATE,
        Vp8Packet::default(),
        VIDEO_CLOCK_RATE,
    );
    while let Ok((packet, _)) = track.read_rtp().await {
        builder.push(packet);
        while let Some(sample) = builder.pop() {
            if let Some(feed) = feed.lock().await.as_ref() {
                feed.push_frame(ImageCapture::from_vp8(sample.data));
            }
        }
    }
    debug!(target: "cs.peer", "Remote video track ended");
}

fn attach_data_channel(dc: &Arc<RTCDataChannel>, events: PeerEventSink) {
    let open_events = events.clone();
    dc.on_open(Box::new(move || {
        debug!(target: "cs.peer", peer_id = %open_events.peer_id(), "Data channel open");
        open_events.emit(TransportEvent::DataChannelOpen);
        Box::pin(async {})
    }));
    dc.on_message(Box::new(move |message: DataChannelMessage| {
        events.emit(TransportEvent::DataMessage(message.data));
        Box::pin(async {})
    }));
}

struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    data_channel: DataChannelSlot,
    closed: AtomicBool,
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<String, PeerError> {
        let offer = self.pc.create_offer(None).await.map_err(negotiation_error)?;
        let sdp = offer.sdp.clone();
        self.pc
            .set_local_description(offer)
            .await
            .map_err(negotiation_error)?;
        Ok(sdp)
    }

    async fn accept_offer(&self, sdp: String) -> Result<String, PeerError> {
        let offer = RTCSessionDescription::offer(sdp)
            .map_err(|e| PeerError::MalformedSignal(e.to_string()))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(negotiation_error)?;

        let answer = self.pc.create_answer(None).await.map_err(negotiation_error)?;
        let sdp = answer.sdp.clone();
        self.pc
            .set_local_description(answer)
            .await
            .map_err(negotiation_error)?;
        Ok(sdp)
    }

    async fn accept_answer(&self, sdp: String) -> Result<(), PeerError> {
        let answer = RTCSessionDescription::answer(sdp)
            .map_err(|e| PeerError::MalformedSignal(e.to_string()))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(negotiation_error)
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(negotiation_error)
    }

    async fn send_data(&self, payload: Bytes) -> Result<(), PeerError> {
        let guard = self.data_channel.read().await;
        let Some(dc) = guard.as_ref() else {
            return Err(PeerError::DataChannelUnavailable);
        };
        dc.send(&payload).await.map(|_| ()).map_err(engine_error)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.pc.close().await {
            debug!(target: "cs.peer", error = %e, "Error while closing peer connection");
        }
    }
}
