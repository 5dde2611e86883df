//! Signaling protocol message types
//!
//! JSON messages exchanged with the signaling service over one WebSocket.
//! Both directions are closed tagged unions keyed by `type`; an unknown tag
//! fails to parse and the message is dropped by the client.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Roster entry for a remote participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub id: String,

    #[serde(default)]
    pub display_name: String,

    #[serde(default)]
    pub is_creator: bool,

    /// Free-form profile metadata (avatar, etc.)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<serde_json::Value>,
}

impl ParticipantInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: String::new(),
            is_creator: false,
            profile: None,
        }
    }
}

/// ICE candidate as relayed through signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,

    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,

    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,

    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

/// Messages received from the signaling service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Local participant admitted; carries the existing roster
    Joined {
        #[serde(rename = "participantId")]
        participant_id: String,
        #[serde(default)]
        participants: Vec<ParticipantInfo>,
    },

    PeerJoined {
        participant: ParticipantInfo,
    },

    PeerLeft {
        #[serde(rename = "participantId")]
        participant_id: String,
    },

    Offer {
        from: String,
        sdp: String,
    },

    Answer {
        from: String,
        sdp: String,
    },

    Candidate {
        from: String,
        candidate: IceCandidate,
    },

    RoomClosed {
        #[serde(default)]
        reason: Option<String>,
    },

    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::InvalidData(format!("Malformed signaling message: {}", e)))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::SerializationError(e.to_string()))
    }

    /// Tag name, for logging
    pub fn name(&self) -> &'static str {
        match self {
            ServerMessage::Joined { .. } => "joined",
            ServerMessage::PeerJoined { .. } => "peer_joined",
            ServerMessage::PeerLeft { .. } => "peer_left",
            ServerMessage::Offer { .. } => "offer",
            ServerMessage::Answer { .. } => "answer",
            ServerMessage::Candidate { .. } => "candidate",
            ServerMessage::RoomClosed { .. } => "room_closed",
            ServerMessage::Error { .. } => "error",
        }
    }
}

/// Messages sent to the signaling service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Leave,

    /// Keepalive
    Ping,

    Offer {
        to: String,
        sdp: String,
    },

    Answer {
        to: String,
        sdp: String,
    },

    Candidate {
        to: String,
        candidate: IceCandidate,
    },
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::SerializationError(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::InvalidData(format!("Malformed client message: {}", e)))
    }
}
