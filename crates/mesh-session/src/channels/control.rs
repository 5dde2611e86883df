//! Control-channel protocol
//!
//! One reliable, ordered data channel per peer carries advisory metadata.
//! Messages are JSON tagged by `type`; unknown tags are rejected.

use crate::media::VideoSource;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Sender's voice-activity state changed
    Speaking { speaking: bool },

    /// Binds the sender's channel `mid` to the video source it carries
    MediaType { mid: String, kind: VideoSource },
}

impl ControlMessage {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::SerializationError(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::InvalidData(format!("Malformed control message: {}", e)))
    }
}
