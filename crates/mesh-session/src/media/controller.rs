//! Local media controller
//!
//! Holds at most one live track per kind. Enabling acquires through the
//! capture capability; disabling stops the track and releases it. Fan-out to
//! peer links is done by the session, which calls into this controller first.

use super::capture::MediaCapture;
use super::track::LocalTrack;
use super::{MediaFlags, MediaKind};
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

pub struct LocalMediaController {
    capture: Arc<dyn MediaCapture>,
    tracks: RwLock<HashMap<MediaKind, Arc<LocalTrack>>>,
}

impl LocalMediaController {
    pub fn new(capture: Arc<dyn MediaCapture>) -> Self {
        Self {
            capture,
            tracks: RwLock::new(HashMap::new()),
        }
    }

    /// Enable `kind`, acquiring a new track if none is live
    ///
    /// Returns the live track. On denial the previous state is left unchanged.
    pub async fn enable(&self, kind: MediaKind) -> Result<Arc<LocalTrack>> {
        if let Some(track) = self.track(kind).await {
            debug!("{} already enabled", kind);
            return Ok(track);
        }

        let track = self.capture.acquire(kind).await?;

        let mut tracks = self.tracks.write().await;
        if let Some(existing) = tracks.get(&kind) {
            // Lost a race with a concurrent enable; keep the first track
            let existing = Arc::clone(existing);
            drop(tracks);
            track.stop();
            self.capture.release(&track).await;
            return Ok(existing);
        }
        tracks.insert(kind, Arc::clone(&track));
        drop(tracks);

        info!("Enabled local {} ({})", kind, track.id());
        Ok(track)
    }

    /// Disable `kind`, stopping and releasing its track
    ///
    /// Returns the stopped track, or `None` if the kind was not enabled.
    pub async fn disable(&self, kind: MediaKind) -> Option<Arc<LocalTrack>> {
        let track = self.tracks.write().await.remove(&kind)?;
        if track.stop() {
            self.capture.release(&track).await;
        }
        info!("Disabled local {}", kind);
        Some(track)
    }

    /// Live track for `kind` (the local preview)
    pub async fn track(&self, kind: MediaKind) -> Option<Arc<LocalTrack>> {
        self.tracks.read().await.get(&kind).cloned()
    }

    pub async fn is_enabled(&self, kind: MediaKind) -> bool {
        self.tracks.read().await.contains_key(&kind)
    }

    pub async fn flags(&self) -> MediaFlags {
        let tracks = self.tracks.read().await;
        let mut flags = MediaFlags::default();
        for kind in tracks.keys() {
            flags.set(*kind, true);
        }
        flags
    }

    /// Current microphone amplitude, if the mic is live and metered
    pub async fn mic_level(&self) -> Option<f32> {
        self.track(MediaKind::Mic).await.and_then(|t| t.level())
    }

    /// Stop every live track exactly once; returns how many were stopped
    pub async fn stop_all(&self) -> usize {
        let drained: Vec<Arc<LocalTrack>> =
            self.tracks.write().await.drain().map(|(_, t)| t).collect();

        let mut stopped = 0;
        for track in drained {
            if track.stop() {
                self.capture.release(&track).await;
                stopped += 1;
            }
        }
        stopped
    }
}
