//! In-memory platform connection for unit tests

use super::{ChannelDirection, ControlChannel, MediaChannel, PlatformConnection, SignalingState};
use crate::media::{LocalTrack, MediaKind};
use crate::signaling::IceCandidate;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub(crate) struct MockChannel {
    kind: MediaKind,
    mid: Mutex<Option<String>>,
    direction: Mutex<ChannelDirection>,
    track: Mutex<Option<String>>,
}

#[async_trait]
impl MediaChannel for MockChannel {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn mid(&self) -> Option<String> {
        self.mid.lock().clone()
    }

    async fn replace_track(&self, track: Option<Arc<LocalTrack>>) -> Result<()> {
        *self.track.lock() = track.map(|t| t.id().to_string());
        Ok(())
    }

    async fn set_direction(&self, direction: ChannelDirection) -> Result<()> {
        *self.direction.lock() = direction;
        Ok(())
    }

    fn direction(&self) -> ChannelDirection {
        *self.direction.lock()
    }
}

pub(crate) struct MockControl {
    label: String,
    sent: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl MockControl {
    pub(crate) fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl ControlChannel for MockControl {
    fn label(&self) -> String {
        self.label.clone()
    }

    async fn send_text(&self, text: String) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::DataChannelError("closed".to_string()));
        }
        self.sent.lock().push(text);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Records calls; `create_offer` yields once so concurrent callers interleave
pub(crate) struct MockConnection {
    state: Mutex<SignalingState>,
    offers: AtomicUsize,
    next_mid: AtomicUsize,
    channels: Mutex<Vec<Arc<MockChannel>>>,
    /// Negotiation requests caused by channel creation
    negotiation_requests: AtomicUsize,
    candidates: Mutex<Vec<IceCandidate>>,
    close_calls: AtomicUsize,
    fail_offers: AtomicBool,
    roll_back_offers: AtomicBool,
    rollbacks: AtomicUsize,
}

impl MockConnection {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SignalingState::Stable),
            offers: AtomicUsize::new(0),
            next_mid: AtomicUsize::new(0),
            channels: Mutex::new(Vec::new()),
            negotiation_requests: AtomicUsize::new(0),
            candidates: Mutex::new(Vec::new()),
            close_calls: AtomicUsize::new(0),
            fail_offers: AtomicBool::new(false),
            roll_back_offers: AtomicBool::new(false),
            rollbacks: AtomicUsize::new(0),
        }
    }

    /// Make every later `create_offer` fail while staying stable
    pub(crate) fn fail_offers(&self) {
        self.fail_offers.store(true, Ordering::SeqCst);
    }

    /// Roll back every later offer right after creating it, as a colliding
    /// remote offer would
    pub(crate) fn roll_back_offers(&self) {
        self.roll_back_offers.store(true, Ordering::SeqCst);
    }

    pub(crate) fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    pub(crate) fn offers(&self) -> usize {
        self.offers.load(Ordering::SeqCst)
    }

    pub(crate) fn negotiation_requests(&self) -> usize {
        self.negotiation_requests.load(Ordering::SeqCst)
    }

    pub(crate) fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    pub(crate) fn channel_track(&self, index: usize) -> Option<String> {
        self.channels
            .lock()
            .get(index)
            .and_then(|c| c.track.lock().clone())
    }

    pub(crate) fn candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.close_calls() > 0
    }

    /// Give every channel without a mid the next sequential mid
    pub(crate) fn assign_mids(&self) {
        for channel in self.channels.lock().iter() {
            let mut mid = channel.mid.lock();
            if mid.is_none() {
                *mid = Some(self.next_mid.fetch_add(1, Ordering::SeqCst).to_string());
            }
        }
    }
}

#[async_trait]
impl PlatformConnection for MockConnection {
    fn signaling_state(&self) -> SignalingState {
        *self.state.lock()
    }

    async fn add_channel(
        &self,
        kind: MediaKind,
        track: Arc<LocalTrack>,
    ) -> Result<Arc<dyn MediaChannel>> {
        tokio::task::yield_now().await;
        let channel = Arc::new(MockChannel {
            kind,
            mid: Mutex::new(None),
            direction: Mutex::new(ChannelDirection::SendRecv),
            track: Mutex::new(Some(track.id().to_string())),
        });
        self.channels.lock().push(Arc::clone(&channel));
        self.negotiation_requests.fetch_add(1, Ordering::SeqCst);
        Ok(channel)
    }

    async fn create_offer(&self) -> Result<String> {
        tokio::task::yield_now().await;
        if self.fail_offers.load(Ordering::SeqCst) {
            return Err(Error::SdpError("offer rejected".to_string()));
        }
        {
            let mut state = self.state.lock();
            if *state != SignalingState::Stable {
                return Err(Error::SdpError(format!("cannot offer in {:?}", *state)));
            }
            *state = SignalingState::HaveLocalOffer;
        }

        self.assign_mids();
        let n = self.offers.fetch_add(1, Ordering::SeqCst) + 1;
        if self.roll_back_offers.load(Ordering::SeqCst) {
            self.rollback().await?;
        }
        Ok(format!("offer-{}", n))
    }

    async fn accept_offer(&self, _sdp: String) -> Result<String> {
        let mut state = self.state.lock();
        if *state == SignalingState::HaveLocalOffer {
            return Err(Error::SdpError("offer collided with local offer".to_string()));
        }
        *state = SignalingState::Stable;
        drop(state);

        self.assign_mids();
        Ok("answer".to_string())
    }

    async fn accept_answer(&self, _sdp: String) -> Result<()> {
        *self.state.lock() = SignalingState::Stable;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state == SignalingState::HaveLocalOffer {
            *state = SignalingState::Stable;
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn create_control_channel(&self, label: &str) -> Result<Arc<dyn ControlChannel>> {
        Ok(Arc::new(MockControl::new(label)))
    }

    async fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        *self.state.lock() = SignalingState::Closed;
        Ok(())
    }
}
