//! Platform transport capability
//!
//! The engine does not implement peer connections; it drives them through
//! these traits. [`rtc::WebRtcTransport`] binds them to the `webrtc` crate.
//! Connection callbacks are delivered as [`LinkEvent`]s on the channel passed
//! to [`PeerTransport::connect`].

pub mod rtc;

#[cfg(test)]
pub(crate) mod mock;

pub use rtc::WebRtcTransport;

use crate::config::IceServer;
use crate::media::{LocalTrack, MediaKind, TrackKind};
use crate::peer::LinkState;
use crate::signaling::IceCandidate;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Signaling state of a platform connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
    Other,
}

/// Direction of a media channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

/// A remote track as reported by the platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    /// Mid of the channel the track arrived on
    pub mid: Option<String>,
    pub stream_id: String,
}

/// Platform callback, tagged with the remote participant it concerns
#[derive(Clone)]
pub struct LinkEvent {
    pub peer_id: String,
    pub event: TransportEvent,
}

impl LinkEvent {
    pub fn new(peer_id: impl Into<String>, event: TransportEvent) -> Self {
        Self {
            peer_id: peer_id.into(),
            event,
        }
    }
}

#[derive(Clone)]
pub enum TransportEvent {
    /// The connection's channel set changed and needs an offer/answer round
    NegotiationNeeded,

    /// Locally gathered ICE candidate
    IceCandidate(IceCandidate),

    StateChanged(LinkState),

    TrackReceived(RemoteTrack),

    /// After a description was applied: whether the remote is sending on `mid`
    RemoteTrackState { mid: String, receiving: bool },

    /// A control channel reached the open state (locally created or accepted)
    ControlChannelOpened(Arc<dyn ControlChannel>),

    /// Text frame received on the control channel
    ControlMessage(String),
}

impl TransportEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TransportEvent::NegotiationNeeded => "negotiation_needed",
            TransportEvent::IceCandidate(_) => "ice_candidate",
            TransportEvent::StateChanged(_) => "state_changed",
            TransportEvent::TrackReceived(_) => "track_received",
            TransportEvent::RemoteTrackState { .. } => "remote_track_state",
            TransportEvent::ControlChannelOpened(_) => "control_channel_opened",
            TransportEvent::ControlMessage(_) => "control_message",
        }
    }
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportEvent::StateChanged(state) => write!(f, "StateChanged({:?})", state),
            TransportEvent::TrackReceived(track) => write!(f, "TrackReceived({:?})", track),
            TransportEvent::RemoteTrackState { mid, receiving } => {
                write!(f, "RemoteTrackState({}, {})", mid, receiving)
            }
            other => f.write_str(other.name()),
        }
    }
}

/// Factory for platform connections
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Create a connection to `peer_id`; callbacks are sent on `events`
    async fn connect(
        &self,
        peer_id: &str,
        ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PlatformConnection>>;
}

/// One platform peer connection
#[async_trait]
pub trait PlatformConnection: Send + Sync {
    fn signaling_state(&self) -> SignalingState;

    /// Create a send/receive channel seeded with `track`
    async fn add_channel(
        &self,
        kind: MediaKind,
        track: Arc<LocalTrack>,
    ) -> Result<Arc<dyn MediaChannel>>;

    /// Create an offer and set it as the local description; returns the SDP
    async fn create_offer(&self) -> Result<String>;

    /// Apply a remote offer, create and apply the answer; returns the answer SDP
    async fn accept_offer(&self, sdp: String) -> Result<String>;

    async fn accept_answer(&self, sdp: String) -> Result<()>;

    /// Discard the pending local offer and return to stable
    ///
    /// A no-op when no local offer is outstanding.
    async fn rollback(&self) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Create the reliable ordered control channel
    async fn create_control_channel(&self, label: &str) -> Result<Arc<dyn ControlChannel>>;

    async fn close(&self) -> Result<()>;
}

/// One media channel (transceiver) on a connection
#[async_trait]
pub trait MediaChannel: Send + Sync {
    fn kind(&self) -> MediaKind;

    /// Transport-assigned mid, once a local description has been applied
    fn mid(&self) -> Option<String>;

    /// Swap the outbound track without renegotiating; `None` detaches
    async fn replace_track(&self, track: Option<Arc<LocalTrack>>) -> Result<()>;

    async fn set_direction(&self, direction: ChannelDirection) -> Result<()>;

    fn direction(&self) -> ChannelDirection;
}

/// Reliable ordered side channel
#[async_trait]
pub trait ControlChannel: Send + Sync {
    fn label(&self) -> String;

    async fn send_text(&self, text: String) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
