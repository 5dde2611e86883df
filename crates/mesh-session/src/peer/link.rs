//! Peer link: everything the session holds for one remote participant

use super::negotiation::NegotiationFlag;
use crate::channels::ControlMessage;
use crate::media::{MediaKind, VideoSource};
use crate::signaling::IceCandidate;
use crate::transport::{ControlChannel, MediaChannel, PlatformConnection};
use crate::Result;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

/// Point-in-time view of a link
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkStats {
    pub peer_id: String,
    /// Channels currently held, one per kind at most
    pub channels: usize,
    /// Channels ever created on this link
    pub channels_created: usize,
    pub control_ready: bool,
    pub negotiating: bool,
    pub closed: bool,
}

pub struct PeerLink {
    peer_id: String,
    connection: Arc<dyn PlatformConnection>,

    /// Held across channel creation so a kind is never created twice
    channels: AsyncMutex<HashMap<MediaKind, Arc<dyn MediaChannel>>>,
    channels_created: AtomicUsize,

    negotiation: NegotiationFlag,
    renegotiate_pending: AtomicBool,

    control: RwLock<Option<Arc<dyn ControlChannel>>>,
    control_ready: AtomicBool,

    /// Sender-declared mid -> video source, for classifying incoming video
    remote_media: RwLock<HashMap<String, VideoSource>>,

    remote_description_set: AtomicBool,
    pending_candidates: Mutex<Vec<IceCandidate>>,

    /// Bumped whenever a local description is applied
    description_applied: watch::Sender<u64>,

    closed: AtomicBool,
}

impl PeerLink {
    pub fn new(peer_id: impl Into<String>, connection: Arc<dyn PlatformConnection>) -> Self {
        let (description_applied, _) = watch::channel(0);
        Self {
            peer_id: peer_id.into(),
            connection,
            channels: AsyncMutex::new(HashMap::new()),
            channels_created: AtomicUsize::new(0),
            negotiation: NegotiationFlag::default(),
            renegotiate_pending: AtomicBool::new(false),
            control: RwLock::new(None),
            control_ready: AtomicBool::new(false),
            remote_media: RwLock::new(HashMap::new()),
            remote_description_set: AtomicBool::new(false),
            pending_candidates: Mutex::new(Vec::new()),
            description_applied,
            closed: AtomicBool::new(false),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn connection(&self) -> &Arc<dyn PlatformConnection> {
        &self.connection
    }

    pub fn negotiation(&self) -> &NegotiationFlag {
        &self.negotiation
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn mark_renegotiate_pending(&self) {
        self.renegotiate_pending.store(true, Ordering::SeqCst);
    }

    /// Consume a deferred negotiation request
    pub fn take_renegotiate_pending(&self) -> bool {
        self.renegotiate_pending.swap(false, Ordering::SeqCst)
    }

    // ---- channels ----

    pub(crate) fn channels(&self) -> &AsyncMutex<HashMap<MediaKind, Arc<dyn MediaChannel>>> {
        &self.channels
    }

    pub(crate) fn record_channel_created(&self) {
        self.channels_created.fetch_add(1, Ordering::SeqCst);
    }

    pub fn channels_created(&self) -> usize {
        self.channels_created.load(Ordering::SeqCst)
    }

    pub async fn channel(&self, kind: MediaKind) -> Option<Arc<dyn MediaChannel>> {
        self.channels.lock().await.get(&kind).cloned()
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.lock().await.len()
    }

    pub async fn channels_snapshot(&self) -> Vec<(MediaKind, Arc<dyn MediaChannel>)> {
        let channels = self.channels.lock().await;
        let mut snapshot: Vec<_> = channels
            .iter()
            .map(|(kind, channel)| (*kind, Arc::clone(channel)))
            .collect();
        snapshot.sort_by_key(|(kind, _)| *kind);
        snapshot
    }

    // ---- mid resolution ----

    pub fn notify_description_applied(&self) {
        self.description_applied.send_modify(|n| *n += 1);
    }

    /// Wait for `channel` to be assigned a mid
    ///
    /// Wakes on every applied local description and otherwise polls every
    /// `interval`, for at most `attempts` rounds.
    pub async fn resolve_mid(
        &self,
        channel: &Arc<dyn MediaChannel>,
        attempts: u32,
        interval: Duration,
    ) -> Option<String> {
        let mut applied = self.description_applied.subscribe();

        for _ in 0..attempts {
            if let Some(mid) = channel.mid() {
                return Some(mid);
            }
            if self.is_closed() {
                return None;
            }
            tokio::select! {
                _ = applied.changed() => {}
                _ = tokio::time::sleep(interval) => {}
            }
        }

        channel.mid()
    }

    // ---- remote media ----

    pub fn record_media_type(&self, mid: impl Into<String>, source: VideoSource) {
        self.remote_media.write().insert(mid.into(), source);
    }

    pub fn media_type(&self, mid: &str) -> Option<VideoSource> {
        self.remote_media.read().get(mid).copied()
    }

    pub fn remote_media(&self) -> HashMap<String, VideoSource> {
        self.remote_media.read().clone()
    }

    // ---- ICE ----

    pub fn has_remote_description(&self) -> bool {
        self.remote_description_set.load(Ordering::SeqCst)
    }

    /// Apply a remote candidate, or hold it until a remote description exists
    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if !self.has_remote_description() {
            debug!("Buffering candidate from {} until remote description", self.peer_id);
            self.pending_candidates.lock().push(candidate);
            return Ok(());
        }
        self.connection.add_ice_candidate(candidate).await
    }

    /// Record that a remote description is in place and flush buffered candidates
    ///
    /// Returns the number of buffered candidates applied.
    pub async fn remote_description_applied(&self) -> usize {
        self.remote_description_set.store(true, Ordering::SeqCst);

        let pending: Vec<IceCandidate> = std::mem::take(&mut *self.pending_candidates.lock());
        let mut applied = 0;
        for candidate in pending {
            match self.connection.add_ice_candidate(candidate).await {
                Ok(()) => applied += 1,
                Err(e) => warn!("Failed to apply buffered candidate from {}: {}", self.peer_id, e),
            }
        }
        if applied > 0 {
            debug!("Flushed {} buffered candidates for {}", applied, self.peer_id);
        }
        applied
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.lock().len()
    }

    // ---- control channel ----

    /// Adopt `channel` unless one is already held (first instance wins)
    pub fn set_control_if_absent(&self, channel: Arc<dyn ControlChannel>) -> bool {
        let mut control = self.control.write();
        if control.is_some() {
            return false;
        }
        *control = Some(channel);
        true
    }

    pub fn mark_control_ready(&self) {
        self.control_ready.store(true, Ordering::SeqCst);
    }

    pub fn control_ready(&self) -> bool {
        self.control_ready.load(Ordering::SeqCst)
    }

    /// Send on the control channel
    ///
    /// Returns `Ok(false)` if the channel is not open yet.
    pub async fn send_control(&self, message: &ControlMessage) -> Result<bool> {
        if !self.control_ready() {
            return Ok(false);
        }
        let Some(channel) = self.control.read().clone() else {
            return Ok(false);
        };
        channel.send_text(message.to_json()?).await?;
        Ok(true)
    }

    // ---- lifecycle ----

    pub async fn stats(&self) -> LinkStats {
        LinkStats {
            peer_id: self.peer_id.clone(),
            channels: self.channel_count().await,
            channels_created: self.channels_created(),
            control_ready: self.control_ready(),
            negotiating: self.negotiation.is_in_flight(),
            closed: self.is_closed(),
        }
    }

    /// Close the control channel, drop the channel set and close the connection
    ///
    /// Idempotent; only the first call does any work.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.control_ready.store(false, Ordering::SeqCst);
        let control = self.control.write().take();
        if let Some(control) = control {
            if let Err(e) = control.close().await {
                debug!("Control channel close for {} failed: {}", self.peer_id, e);
            }
        }

        self.channels.lock().await.clear();
        self.remote_media.write().clear();
        self.pending_candidates.lock().clear();

        info!("Closing link to {}", self.peer_id);
        self.connection.close().await
    }
}
