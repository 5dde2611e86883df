//! Local media: capture, tracks, enable/disable and voice activity

pub mod capture;
pub mod controller;
pub mod track;
pub mod vad;

pub use capture::{MediaCapture, SyntheticCapture};
pub use controller::LocalMediaController;
pub use track::{AudioLevelMeter, LocalTrack};
pub use vad::VoiceActivityDetector;

use serde::{Deserialize, Serialize};

/// Local media kinds; each maps to at most one channel per peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Mic,
    Camera,
    Screen,
}

impl MediaKind {
    pub const ALL: [MediaKind; 3] = [MediaKind::Mic, MediaKind::Camera, MediaKind::Screen];

    pub fn track_kind(&self) -> TrackKind {
        match self {
            MediaKind::Mic => TrackKind::Audio,
            MediaKind::Camera | MediaKind::Screen => TrackKind::Video,
        }
    }

    /// Semantic video source announced over the control channel
    pub fn video_source(&self) -> Option<VideoSource> {
        match self {
            MediaKind::Mic => None,
            MediaKind::Camera => Some(VideoSource::Camera),
            MediaKind::Screen => Some(VideoSource::Screen),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Mic => "mic",
            MediaKind::Camera => "camera",
            MediaKind::Screen => "screen",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire-level track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// What a video channel carries, as declared by its sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoSource {
    Camera,
    Screen,
}

/// Local media-enabled flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaFlags {
    pub mic: bool,
    pub camera: bool,
    pub screen: bool,
}

impl MediaFlags {
    pub fn get(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Mic => self.mic,
            MediaKind::Camera => self.camera,
            MediaKind::Screen => self.screen,
        }
    }

    pub fn set(&mut self, kind: MediaKind, enabled: bool) {
        match kind {
            MediaKind::Mic => self.mic = enabled,
            MediaKind::Camera => self.camera = enabled,
            MediaKind::Screen => self.screen = enabled,
        }
    }
}
