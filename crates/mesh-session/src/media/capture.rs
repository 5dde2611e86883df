//! Local capture capability
//!
//! Hardware capture lives outside the engine; it is reached through the narrow
//! [`MediaCapture`] acquire/release interface. [`SyntheticCapture`] is a
//! device-free implementation that produces silent audio and placeholder video
//! frames, used by the client binary and by tests.

use super::track::{AudioLevelMeter, LocalTrack};
use super::{MediaKind, TrackKind};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use webrtc::media::Sample;

/// Opus frame encoding 20ms of silence
const OPUS_SILENCE_FRAME: &[u8] = &[0xf8, 0xff, 0xfe];

/// Placeholder VP8 payload; receivers only need RTP to flow
const SYNTHETIC_VP8_FRAME: &[u8] = &[0x10, 0x02, 0x00, 0x9d, 0x01, 0x2a, 0x10, 0x00, 0x10, 0x00];

/// Acquire/release interface to local capture devices
#[async_trait]
pub trait MediaCapture: Send + Sync {
    /// Open a capture device for `kind`
    ///
    /// Returns [`Error::MediaAcquisitionDenied`] when the user or platform refuses.
    async fn acquire(&self, kind: MediaKind) -> Result<Arc<LocalTrack>>;

    /// Release a previously acquired track (after it has been stopped)
    async fn release(&self, track: &LocalTrack);
}

struct SharedLevel(AtomicU32);

impl AudioLevelMeter for SharedLevel {
    fn level(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Device-free capture
pub struct SyntheticCapture {
    stream_id: String,
    denied: Mutex<HashSet<MediaKind>>,
    level: Arc<SharedLevel>,
    active: Mutex<HashMap<MediaKind, Arc<LocalTrack>>>,
    released: Mutex<Vec<String>>,
    pump_samples: bool,
}

impl Default for SyntheticCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticCapture {
    pub fn new() -> Self {
        Self {
            stream_id: format!("local-{}", uuid::Uuid::new_v4()),
            denied: Mutex::new(HashSet::new()),
            level: Arc::new(SharedLevel(AtomicU32::new(0f32.to_bits()))),
            active: Mutex::new(HashMap::new()),
            released: Mutex::new(Vec::new()),
            pump_samples: true,
        }
    }

    /// Do not write samples into acquired tracks
    pub fn without_sample_pump(mut self) -> Self {
        self.pump_samples = false;
        self
    }

    /// Refuse future acquisitions of `kind`
    pub fn deny(&self, kind: MediaKind) {
        self.denied.lock().insert(kind);
    }

    pub fn allow(&self, kind: MediaKind) {
        self.denied.lock().remove(&kind);
    }

    /// Set the microphone amplitude reported to voice-activity detection
    pub fn set_level(&self, level: f32) {
        self.level
            .0
            .store(level.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    /// Simulate the platform ending a capture (e.g. the native stop-sharing button)
    ///
    /// Returns `false` if nothing of that kind is active.
    pub fn end_native(&self, kind: MediaKind) -> bool {
        match self.active.lock().get(&kind) {
            Some(track) => {
                info!("Platform ended {} capture", kind);
                track.notify_ended();
                true
            }
            None => false,
        }
    }

    /// IDs of released tracks, in release order
    pub fn released(&self) -> Vec<String> {
        self.released.lock().clone()
    }

    async fn pump(track: Arc<LocalTrack>) {
        let (payload, duration) = match track.kind().track_kind() {
            TrackKind::Audio => (OPUS_SILENCE_FRAME, Duration::from_millis(20)),
            TrackKind::Video => (SYNTHETIC_VP8_FRAME, Duration::from_millis(33)),
        };
        let rtp = track.rtp();
        let mut ticker = tokio::time::interval(duration);

        while !track.is_stopped() && !track.has_ended() {
            ticker.tick().await;
            let sample = Sample {
                data: Bytes::from_static(payload),
                duration,
                ..Default::default()
            };
            if let Err(e) = rtp.write_sample(&sample).await {
                debug!("Sample pump for {} stopped: {}", track.id(), e);
                break;
            }
        }
    }
}

#[async_trait]
impl MediaCapture for SyntheticCapture {
    async fn acquire(&self, kind: MediaKind) -> Result<Arc<LocalTrack>> {
        if self.denied.lock().contains(&kind) {
            return Err(Error::MediaAcquisitionDenied(format!(
                "{} capture refused",
                kind
            )));
        }

        let mut track = LocalTrack::new(kind, &self.stream_id);
        if kind == MediaKind::Mic {
            track = track.with_level_meter(Arc::clone(&self.level) as Arc<dyn AudioLevelMeter>);
        }
        let track = Arc::new(track);

        self.active.lock().insert(kind, Arc::clone(&track));
        if self.pump_samples {
            tokio::spawn(Self::pump(Arc::clone(&track)));
        }

        debug!("Acquired synthetic {} track {}", kind, track.id());
        Ok(track)
    }

    async fn release(&self, track: &LocalTrack) {
        let mut active = self.active.lock();
        if active.get(&track.kind()).map(|t| t.id()) == Some(track.id()) {
            active.remove(&track.kind());
        }
        drop(active);

        self.released.lock().push(track.id().to_string());
    }
}
