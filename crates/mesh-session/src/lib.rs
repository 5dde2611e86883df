//! Mesh video-conferencing session engine
//!
//! Every participant holds one peer connection to every other participant.
//! A WebSocket signaling service handles room membership and relays SDP and
//! ICE candidates; a per-peer control data channel carries speaking state and
//! the camera/screen role of each outbound video channel.
//!
//! # Features
//!
//! - **Deterministic initiation**: the smaller participant id sends the first offer
//! - **Channel reuse**: at most one media channel per (peer, kind), ever; toggling
//!   media swaps the outbound track and never renegotiates
//! - **Serialized negotiation**: one offer in flight per peer, deferred requests replayed
//! - **Semantic video**: remote video is classified as camera or screen by
//!   sender-declared mids, with undeclared video kept in a combined stream
//! - **Voice activity**: local speaking state broadcast to every peer
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  MeshSession (event loop, registry, local media)         │
//! │  ├─ SignalingClient (JSON over WebSocket, keepalive)     │
//! │  ├─ LocalMediaController + VoiceActivityDetector         │
//! │  └─ PeerLink per remote participant                      │
//! │      ├─ media channels (mic / camera / screen)           │
//! │      ├─ negotiation flag + deferred renegotiation        │
//! │      └─ control channel (speaking, media_type)           │
//! │         ↓                                                │
//! │  PeerTransport (WebRtcTransport over the webrtc crate)   │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use mesh_session::MeshConfig;
//!
//! let config = MeshConfig {
//!     signaling_url: "wss://meet.example.com/ws".to_string(),
//!     ..Default::default()
//! };
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.control_channel_label, "control");
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use mesh_session::{MediaKind, MeshConfig, MeshSession, RoomGrant, SyntheticCapture, WebRtcTransport};
//! use std::sync::Arc;
//!
//! # async fn example() -> mesh_session::Result<()> {
//! let session = MeshSession::new(
//!     MeshConfig::default(),
//!     Arc::new(WebRtcTransport::new()),
//!     Arc::new(SyntheticCapture::new()),
//! )?;
//!
//! session.set_media_enabled(MediaKind::Mic, true).await;
//! session.connect(RoomGrant::new("standup", "a1")).await?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod channels;
pub mod config;
pub mod error;
pub mod media;
pub mod peer;
pub mod provisioning;
pub mod session;
pub mod signaling;
pub mod transport;

pub use channels::ControlMessage;
pub use config::{IceServer, MeshConfig, MidResolutionConfig, VoiceActivityConfig};
pub use error::{Error, Result};
pub use media::{
    LocalTrack, MediaCapture, MediaFlags, MediaKind, SyntheticCapture, TrackKind, VideoSource,
};
pub use peer::{LinkState, LinkStats};
pub use provisioning::{fetch_room_grant, RoomGrant};
pub use session::{
    MeetingState, MeshSession, Participant, RemoteStream, SessionEvent, SessionSnapshot,
};
pub use transport::{PeerTransport, RemoteTrack, WebRtcTransport};
