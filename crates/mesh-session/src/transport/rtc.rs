//! `webrtc` crate binding of the transport traits

use super::{
    ChannelDirection, ControlChannel, LinkEvent, MediaChannel, PeerTransport, PlatformConnection,
    RemoteTrack, SignalingState, TransportEvent,
};
use crate::config::IceServer;
use crate::media::{LocalTrack, MediaKind, TrackKind};
use crate::peer::LinkState;
use crate::signaling::IceCandidate;
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Creates `webrtc` peer connections with the default codecs and interceptors
#[derive(Debug, Default, Clone)]
pub struct WebRtcTransport;

impl WebRtcTransport {
    pub fn new() -> Self {
        Self
    }
}

/// Tags platform callbacks with the peer they belong to
#[derive(Clone)]
struct EventSink {
    peer_id: String,
    tx: mpsc::UnboundedSender<LinkEvent>,
}

impl EventSink {
    fn emit(&self, event: TransportEvent) {
        if self
            .tx
            .send(LinkEvent::new(self.peer_id.clone(), event))
            .is_err()
        {
            debug!("Session gone, dropping event for {}", self.peer_id);
        }
    }
}

fn to_rtc_ice_server(server: &IceServer) -> RTCIceServer {
    #[allow(clippy::needless_update)]
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    #[instrument(skip(self, ice_servers, events), fields(peer_id = %peer_id))]
    async fn connect(
        &self,
        peer_id: &str,
        ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PlatformConnection>> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::WebRtcError(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers.iter().map(to_rtc_ice_server).collect(),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
            Error::PeerConnectionError(format!("Failed to create peer connection: {}", e))
        })?);

        let connection = WebRtcConnection {
            peer_id: peer_id.to_string(),
            pc,
            sink: EventSink {
                peer_id: peer_id.to_string(),
                tx: events,
            },
        };
        connection.register_handlers();

        info!("Created peer connection to {}", peer_id);
        Ok(Arc::new(connection))
    }
}

pub struct WebRtcConnection {
    peer_id: String,
    pc: Arc<RTCPeerConnection>,
    sink: EventSink,
}

impl WebRtcConnection {
    fn register_handlers(&self) {
        let sink = self.sink.clone();
        self.pc.on_negotiation_needed(Box::new(move || {
            let sink = sink.clone();
            Box::pin(async move {
                sink.emit(TransportEvent::NegotiationNeeded);
            })
        }));

        let sink = self.sink.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let sink = sink.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        debug!("ICE gathering complete for {}", sink.peer_id);
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => sink.emit(TransportEvent::IceCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        })),
                        Err(e) => warn!("Failed to serialize local candidate: {}", e),
                    }
                })
            }));

        let sink = self.sink.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let sink = sink.clone();
                Box::pin(async move {
                    let state = match s {
                        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
                            LinkState::New
                        }
                        RTCPeerConnectionState::Connecting => LinkState::Connecting,
                        RTCPeerConnectionState::Connected => LinkState::Connected,
                        RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
                        RTCPeerConnectionState::Failed => LinkState::Failed,
                        RTCPeerConnectionState::Closed => LinkState::Closed,
                    };
                    info!("Peer connection to {} is {}", sink.peer_id, state);
                    sink.emit(TransportEvent::StateChanged(state));
                })
            }));

        let sink = self.sink.clone();
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  transceiver: Arc<RTCRtpTransceiver>| {
                let sink = sink.clone();
                Box::pin(async move {
                    let mid = transceiver.mid().map(|m| m.to_string());
                    let kind = match track.kind() {
                        RTPCodecType::Audio => TrackKind::Audio,
                        _ => TrackKind::Video,
                    };
                    let remote = RemoteTrack {
                        id: track.id(),
                        kind,
                        mid: mid.clone(),
                        stream_id: track.stream_id(),
                    };
                    info!(
                        "Received remote {:?} track {} from {} (mid {:?})",
                        kind, remote.id, sink.peer_id, mid
                    );
                    sink.emit(TransportEvent::TrackReceived(remote));

                    // Drain RTP; the track is gone once reads fail
                    tokio::spawn(async move {
                        while track.read_rtp().await.is_ok() {}
                        if let Some(mid) = mid {
                            sink.emit(TransportEvent::RemoteTrackState {
                                mid,
                                receiving: false,
                            });
                        }
                    });
                })
            },
        ));

        let sink = self.sink.clone();
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let sink = sink.clone();
                Box::pin(async move {
                    debug!("Remote opened data channel '{}' from {}", dc.label(), sink.peer_id);
                    WebRtcControlChannel::wire(dc, sink);
                })
            }));
    }

    /// Report, per mid, whether the remote is currently sending to us
    async fn report_remote_directions(&self) {
        for transceiver in self.pc.get_transceivers().await {
            let Some(mid) = transceiver.mid() else {
                continue;
            };
            let receiving = matches!(
                transceiver.current_direction(),
                RTCRtpTransceiverDirection::Sendrecv | RTCRtpTransceiverDirection::Recvonly
            );
            self.sink.emit(TransportEvent::RemoteTrackState {
                mid: mid.to_string(),
                receiving,
            });
        }
    }

    async fn local_sdp(&self, what: &str) -> Result<String> {
        let local_desc = self.pc.local_description().await.ok_or_else(|| {
            Error::SdpError(format!("No local description after setting {}", what))
        })?;
        Ok(local_desc.sdp)
    }
}

#[async_trait]
impl PlatformConnection for WebRtcConnection {
    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::Stable => SignalingState::Stable,
            RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Other,
        }
    }

    async fn add_channel(
        &self,
        kind: MediaKind,
        track: Arc<LocalTrack>,
    ) -> Result<Arc<dyn MediaChannel>> {
        let rtp: Arc<dyn TrackLocal + Send + Sync> = track.rtp();
        let transceiver = self
            .pc
            .add_transceiver_from_track(
                rtp,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Sendrecv,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| Error::MediaTrackError(format!("Failed to add {} channel: {}", kind, e)))?;

        // Read incoming RTCP so interceptors keep working
        let sender = transceiver.sender().await;
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while sender.read(&mut rtcp_buf).await.is_ok() {}
        });

        debug!("Added {} transceiver for {}", kind, self.peer_id);
        Ok(Arc::new(WebRtcMediaChannel { kind, transceiver }))
    }

    async fn create_offer(&self) -> Result<String> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create offer: {}", e)))?;

        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

        debug!("Created SDP offer for peer {}", self.peer_id);
        self.local_sdp("offer").await
    }

    async fn accept_offer(&self, sdp: String) -> Result<String> {
        let offer = RTCSessionDescription::offer(sdp)
            .map_err(|e| Error::SdpError(format!("Failed to parse offer: {}", e)))?;

        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?;

        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

        self.report_remote_directions().await;
        debug!("Created SDP answer for peer {}", self.peer_id);
        self.local_sdp("answer").await
    }

    async fn accept_answer(&self, sdp: String) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp)
            .map_err(|e| Error::SdpError(format!("Failed to parse answer: {}", e)))?;

        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))?;

        self.report_remote_directions().await;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        // Rollback must carry the pending offer's SDP, an empty one is rejected
        let Some(mut pending) = self.pc.pending_local_description().await else {
            return Ok(());
        };
        pending.sdp_type = RTCSdpType::Rollback;

        self.pc
            .set_local_description(pending)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to roll back local offer: {}", e)))?;

        debug!("Rolled back local offer to peer {}", self.peer_id);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };

        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn create_control_channel(&self, label: &str) -> Result<Arc<dyn ControlChannel>> {
        let dc = self
            .pc
            .create_data_channel(
                label,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| {
                Error::DataChannelError(format!("Failed to create data channel: {}", e))
            })?;

        debug!("Created data channel '{}' to {}", label, self.peer_id);
        Ok(WebRtcControlChannel::wire(dc, self.sink.clone()))
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await.map_err(|e| {
            Error::PeerConnectionError(format!("Failed to close connection: {}", e))
        })
    }
}

pub struct WebRtcMediaChannel {
    kind: MediaKind,
    transceiver: Arc<RTCRtpTransceiver>,
}

#[async_trait]
impl MediaChannel for WebRtcMediaChannel {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn mid(&self) -> Option<String> {
        self.transceiver.mid().map(|m| m.to_string())
    }

    async fn replace_track(&self, track: Option<Arc<LocalTrack>>) -> Result<()> {
        let rtp = track.map(|t| t.rtp() as Arc<dyn TrackLocal + Send + Sync>);
        self.transceiver
            .sender()
            .await
            .replace_track(rtp)
            .await
            .map_err(|e| Error::MediaTrackError(format!("Failed to replace track: {}", e)))
    }

    async fn set_direction(&self, direction: ChannelDirection) -> Result<()> {
        self.transceiver.set_direction(direction.into()).await;
        Ok(())
    }

    fn direction(&self) -> ChannelDirection {
        self.transceiver.direction().into()
    }
}

impl From<ChannelDirection> for RTCRtpTransceiverDirection {
    fn from(direction: ChannelDirection) -> Self {
        match direction {
            ChannelDirection::SendRecv => RTCRtpTransceiverDirection::Sendrecv,
            ChannelDirection::SendOnly => RTCRtpTransceiverDirection::Sendonly,
            ChannelDirection::RecvOnly => RTCRtpTransceiverDirection::Recvonly,
            ChannelDirection::Inactive => RTCRtpTransceiverDirection::Inactive,
        }
    }
}

impl From<RTCRtpTransceiverDirection> for ChannelDirection {
    fn from(direction: RTCRtpTransceiverDirection) -> Self {
        match direction {
            RTCRtpTransceiverDirection::Sendrecv => ChannelDirection::SendRecv,
            RTCRtpTransceiverDirection::Sendonly => ChannelDirection::SendOnly,
            RTCRtpTransceiverDirection::Recvonly => ChannelDirection::RecvOnly,
            _ => ChannelDirection::Inactive,
        }
    }
}

/// Reliable ordered data channel carrying control messages
pub struct WebRtcControlChannel {
    dc: Arc<RTCDataChannel>,
    /// Guards against announcing the open state twice
    announced: AtomicBool,
}

impl WebRtcControlChannel {
    /// Hook message and open callbacks; announces immediately if already open
    fn wire(dc: Arc<RTCDataChannel>, sink: EventSink) -> Arc<Self> {
        let channel = Arc::new(Self {
            dc: Arc::clone(&dc),
            announced: AtomicBool::new(false),
        });

        let message_sink = sink.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let sink = message_sink.clone();
            Box::pin(async move {
                if msg.is_string {
                    let text = String::from_utf8_lossy(&msg.data).into_owned();
                    sink.emit(TransportEvent::ControlMessage(text));
                } else {
                    debug!("Ignoring binary control frame from {}", sink.peer_id);
                }
            })
        }));

        let on_open_channel = Arc::clone(&channel);
        let on_open_sink = sink.clone();
        dc.on_open(Box::new(move || {
            Box::pin(async move {
                on_open_channel.announce_open(&on_open_sink);
            })
        }));

        if dc.ready_state() == RTCDataChannelState::Open {
            channel.announce_open(&sink);
        }

        channel
    }

    fn announce_open(self: &Arc<Self>, sink: &EventSink) {
        if self.announced.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Data channel '{}' to {} open", self.dc.label(), sink.peer_id);
        sink.emit(TransportEvent::ControlChannelOpened(
            Arc::clone(self) as Arc<dyn ControlChannel>
        ));
    }
}

#[async_trait]
impl ControlChannel for WebRtcControlChannel {
    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.dc
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|e| Error::DataChannelError(format!("Failed to send: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        self.dc
            .close()
            .await
            .map_err(|e| Error::DataChannelError(format!("Failed to close: {}", e)))
    }
}
