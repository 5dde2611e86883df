//! Configuration types for the mesh session engine

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Public STUN servers used when a room grant carries no ICE servers
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Main configuration for a MeshSession
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// WebSocket signaling server URL (ws:// or wss://)
    pub signaling_url: String,

    /// STUN servers used when the room grant supplies none
    pub fallback_stun_servers: Vec<String>,

    /// Application-level keepalive ping interval in milliseconds (default: 25000)
    pub keepalive_interval_ms: u64,

    /// Label of the per-peer control data channel (default: "control")
    pub control_channel_label: String,

    /// Bounded wait for transport-assigned mids
    pub mid_resolution: MidResolutionConfig,

    /// Local voice-activity detection
    pub voice_activity: VoiceActivityConfig,
}

/// Bounded retry budget for mid resolution
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MidResolutionConfig {
    /// Number of attempts before giving up (default: 20)
    pub attempts: u32,

    /// Delay between attempts in milliseconds (default: 100)
    pub interval_ms: u64,
}

/// Voice-activity detection parameters
///
/// Levels are normalised amplitudes in `0.0..=1.0`. The detector averages the
/// last `smoothing_window` samples, enters the speaking state when the average
/// rises above `threshold`, and leaves it only after the average has stayed at
/// or below the threshold for `release_samples` consecutive samples.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VoiceActivityConfig {
    /// Sampling interval in milliseconds (default: 100)
    pub sample_interval_ms: u64,

    /// Smoothed level above which the local participant is speaking (default: 0.08)
    pub threshold: f32,

    /// Moving-average window in samples (default: 4)
    pub smoothing_window: usize,

    /// Quiet samples required before leaving the speaking state (default: 3)
    pub release_samples: u32,
}

/// ICE server entry as delivered by room provisioning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// One or more `stun:`/`turn:` URLs
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,

    /// Username for TURN authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Credential for TURN authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// STUN entry without credentials
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(url) => vec![url],
        OneOrMany::Many(urls) => urls,
    })
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://localhost:8080/ws".to_string(),
            fallback_stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            keepalive_interval_ms: 25_000,
            control_channel_label: "control".to_string(),
            mid_resolution: MidResolutionConfig::default(),
            voice_activity: VoiceActivityConfig::default(),
        }
    }
}

impl Default for MidResolutionConfig {
    fn default() -> Self {
        Self {
            attempts: 20,
            interval_ms: 100,
        }
    }
}

impl Default for VoiceActivityConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 100,
            threshold: 0.08,
            smoothing_window: 4,
            release_samples: 3,
        }
    }
}

impl MidResolutionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl VoiceActivityConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

impl MeshConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    /// Fallback STUN servers as ICE server entries
    pub fn fallback_ice_servers(&self) -> Vec<IceServer> {
        self.fallback_stun_servers
            .iter()
            .map(|url| IceServer::stun(url.clone()))
            .collect()
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `signaling_url` is not a WebSocket URL
    /// - `fallback_stun_servers` is empty
    /// - `keepalive_interval_ms` is zero
    /// - `control_channel_label` is empty
    /// - the mid resolution budget is zero
    /// - the voice-activity threshold is outside `0.0..=1.0` or the window is empty
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if !self.signaling_url.starts_with("ws://") && !self.signaling_url.starts_with("wss://") {
            return Err(Error::InvalidConfig(format!(
                "signaling_url must start with ws:// or wss://, got {}",
                self.signaling_url
            )));
        }

        if self.fallback_stun_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one fallback STUN server is required".to_string(),
            ));
        }

        if self.keepalive_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "keepalive_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.control_channel_label.is_empty() {
            return Err(Error::InvalidConfig(
                "control_channel_label must not be empty".to_string(),
            ));
        }

        if self.mid_resolution.attempts == 0 || self.mid_resolution.interval_ms == 0 {
            return Err(Error::InvalidConfig(format!(
                "mid_resolution budget must be non-zero, got {} x {}ms",
                self.mid_resolution.attempts, self.mid_resolution.interval_ms
            )));
        }

        let vad = &self.voice_activity;
        if !(0.0..=1.0).contains(&vad.threshold) {
            return Err(Error::InvalidConfig(format!(
                "voice_activity.threshold must be in range 0.0-1.0, got {}",
                vad.threshold
            )));
        }
        if vad.smoothing_window == 0 || vad.sample_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "voice_activity window and sample interval must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}
