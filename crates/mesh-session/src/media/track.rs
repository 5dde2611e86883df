//! Local media tracks

use super::{MediaKind, TrackKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Source of the current microphone amplitude, normalised to `0.0..=1.0`
pub trait AudioLevelMeter: Send + Sync {
    fn level(&self) -> f32;
}

/// A captured local track
///
/// Wraps the sample track handed to peer connections. Stopping is idempotent:
/// the first `stop` wins and later calls are no-ops, so teardown can stop
/// every track exactly once regardless of how many paths reach it.
pub struct LocalTrack {
    id: String,
    kind: MediaKind,
    rtp: Arc<TrackLocalStaticSample>,
    level: Option<Arc<dyn AudioLevelMeter>>,
    stopped: AtomicBool,
    /// Flips to true when the track ends, by `stop` or by the platform
    ended: watch::Sender<bool>,
}

impl LocalTrack {
    /// Create a track with the default codec for `kind` (Opus or VP8)
    pub fn new(kind: MediaKind, stream_id: &str) -> Self {
        let id = format!("{}-{}", kind, uuid::Uuid::new_v4());
        let rtp = Arc::new(TrackLocalStaticSample::new(
            codec_for(kind.track_kind()),
            id.clone(),
            stream_id.to_string(),
        ));
        let (ended, _) = watch::channel(false);

        Self {
            id,
            kind,
            rtp,
            level: None,
            stopped: AtomicBool::new(false),
            ended,
        }
    }

    /// Attach an amplitude source (microphone tracks)
    pub fn with_level_meter(mut self, meter: Arc<dyn AudioLevelMeter>) -> Self {
        self.level = Some(meter);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Sample track bound to peer connection senders
    pub fn rtp(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.rtp)
    }

    /// Current amplitude, if this track has a meter and is live
    pub fn level(&self) -> Option<f32> {
        if self.is_stopped() {
            return None;
        }
        self.level.as_ref().map(|meter| meter.level())
    }

    /// Stop the underlying capture
    ///
    /// Returns `true` only for the call that actually stopped the track.
    pub fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        debug!("Stopped local {} track {}", self.kind, self.id);
        self.ended.send_replace(true);
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Platform-originated end (e.g. the native "stop sharing" control)
    pub fn notify_ended(&self) {
        debug!("Local {} track {} ended by platform", self.kind, self.id);
        self.ended.send_replace(true);
    }

    pub fn has_ended(&self) -> bool {
        *self.ended.borrow()
    }

    /// Watch that flips to `true` when the track ends
    pub fn ended(&self) -> watch::Receiver<bool> {
        self.ended.subscribe()
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
            rtcp_feedback: vec![],
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
    }
}
