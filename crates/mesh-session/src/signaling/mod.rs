//! Signaling client and protocol
//!
//! The signaling service owns room membership and relays SDP and ICE
//! candidates between participants. This module owns no media state.

pub mod client;
pub mod protocol;

pub use client::{room_url, SignalingClient, SignalingEvent};
pub use protocol::{ClientMessage, IceCandidate, ParticipantInfo, ServerMessage};
