//! Session state and change notifications

use super::registry::Participant;
use crate::media::MediaFlags;
use serde::{Deserialize, Serialize};

/// Overall meeting state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeetingState {
    Idle,
    Connecting,
    Connected,
    Error,
}

impl std::fmt::Display for MeetingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MeetingState::Idle => "idle",
            MeetingState::Connecting => "connecting",
            MeetingState::Connected => "connected",
            MeetingState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Broadcast to subscribers whenever observable session state changes
///
/// Events carry ids only; read the details from [`SessionSnapshot`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(MeetingState),
    ParticipantJoined(String),
    ParticipantLeft(String),
    /// Link state, speaking flag or classified streams changed
    ParticipantUpdated(String),
    LocalMediaChanged(MediaFlags),
    LocalSpeaking(bool),
}

/// Point-in-time copy of the session for rendering
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub local_id: Option<String>,
    pub state: MeetingState,
    pub media: MediaFlags,
    pub speaking: bool,
    pub last_error: Option<String>,
    /// Sorted by id
    pub participants: Vec<Participant>,
}

impl SessionSnapshot {
    pub fn participant(&self, id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == id)
    }
}
