//! In-memory peer transport
//!
//! Every session in a test gets a [`FakeTransport`] bound to the same
//! [`FakeNetwork`]. Descriptions are JSON documents listing the sender's
//! channels; applying one reports remote tracks to the receiving session the
//! way a real connection would. The control channel opens on both ends once
//! the first answer is applied, and its frames are delivered straight to the
//! counterpart connection.
//!
//! Negotiation-needed is coalesced: it fires once per batch of changes, and
//! changes made while an exchange is in progress fire it again on the return
//! to stable.

use async_trait::async_trait;
use mesh_session::signaling::IceCandidate;
use mesh_session::transport::{
    ChannelDirection, ControlChannel, LinkEvent, MediaChannel, PlatformConnection, RemoteTrack,
    SignalingState, TransportEvent,
};
use mesh_session::{Error, IceServer, LinkState, LocalTrack, MediaKind, PeerTransport, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::debug;

type Connections = Mutex<HashMap<(String, String), Arc<FakeConnection>>>;

/// Shared registry of every connection, keyed by (local, remote)
#[derive(Clone, Default)]
pub struct FakeNetwork {
    connections: Arc<Connections>,
}

impl FakeNetwork {
    /// Transport for the session of participant `local`
    pub fn transport(&self, local: &str) -> FakeTransport {
        FakeTransport {
            local: local.to_string(),
            connections: Arc::downgrade(&self.connections),
        }
    }

    /// Most recent connection `local` opened towards `remote`
    pub fn connection(&self, local: &str, remote: &str) -> Option<Arc<FakeConnection>> {
        lookup(&self.connections, local, remote)
    }

    /// Every open connection is stable with no unannounced changes
    pub fn settled(&self) -> bool {
        self.connections
            .lock()
            .values()
            .filter(|c| c.signaling_state() != SignalingState::Closed)
            .all(|c| c.signaling_state() == SignalingState::Stable && !c.is_dirty())
    }
}

fn lookup(connections: &Connections, local: &str, remote: &str) -> Option<Arc<FakeConnection>> {
    connections
        .lock()
        .get(&(local.to_string(), remote.to_string()))
        .cloned()
}

pub struct FakeTransport {
    local: String,
    connections: Weak<Connections>,
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn connect(
        &self,
        peer_id: &str,
        _ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PlatformConnection>> {
        let connections = self
            .connections
            .upgrade()
            .ok_or_else(|| Error::PeerConnectionError("network is gone".to_string()))?;

        let connection =
            FakeConnection::new(&self.local, peer_id, events, Arc::downgrade(&connections));
        connections.lock().insert(
            (self.local.clone(), peer_id.to_string()),
            Arc::clone(&connection),
        );
        debug!("Fake connection {} -> {}", self.local, peer_id);
        Ok(connection)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChannelEntry {
    mid: String,
    kind: MediaKind,
    sending: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Description {
    channels: Vec<ChannelEntry>,
}

/// Emits link events on behalf of one connection
#[derive(Clone)]
struct Sink {
    remote: String,
    tx: mpsc::UnboundedSender<LinkEvent>,
}

impl Sink {
    fn emit(&self, event: TransportEvent) {
        let _ = self.tx.send(LinkEvent::new(self.remote.clone(), event));
    }
}

pub struct FakeChannel {
    kind: MediaKind,
    mid: Mutex<Option<String>>,
    direction: Mutex<ChannelDirection>,
    track: Mutex<Option<String>>,
    owner: Weak<FakeConnection>,
}

impl FakeChannel {
    fn is_sending(&self) -> bool {
        matches!(
            *self.direction.lock(),
            ChannelDirection::SendRecv | ChannelDirection::SendOnly
        ) && self.track.lock().is_some()
    }

    /// Id of the outbound track, if any
    pub fn track_id(&self) -> Option<String> {
        self.track.lock().clone()
    }
}

#[async_trait]
impl MediaChannel for FakeChannel {
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
        let previous = std::mem::replace(&mut *self.direction.lock(), direction);
        if previous != direction {
            if let Some(owner) = self.owner.upgrade() {
                owner.mark_dirty();
            }
        }
        Ok(())
    }

    fn direction(&self) -> ChannelDirection {
        *self.direction.lock()
    }
}

pub struct FakeControl {
    label: String,
    local: String,
    remote: String,
    connections: Weak<Connections>,
    closed: AtomicBool,
}

#[async_trait]
impl ControlChannel for FakeControl {
    fn label(&self) -> String {
        self.label.clone()
    }

    async fn send_text(&self, text: String) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::DataChannelError("control channel closed".to_string()));
        }
        let counterpart = self
            .connections
            .upgrade()
            .and_then(|c| lookup(&c, &self.remote, &self.local))
            .filter(|c| c.signaling_state() != SignalingState::Closed)
            .ok_or_else(|| Error::DataChannelError(format!("{} is unreachable", self.remote)))?;

        counterpart.sink.emit(TransportEvent::ControlMessage(text));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// One side of an in-memory peer connection
pub struct FakeConnection {
    local: String,
    remote: String,
    sink: Sink,
    connections: Weak<Connections>,
    me: Weak<FakeConnection>,

    state: Mutex<SignalingState>,
    channels: Mutex<Vec<Arc<FakeChannel>>>,
    next_mid: AtomicUsize,
    dirty: AtomicBool,
    remote_mids: Mutex<HashSet<String>>,
    control: Mutex<Option<Arc<FakeControl>>>,
    control_open: AtomicBool,

    offers: AtomicUsize,
    answers: AtomicUsize,
    rollbacks: AtomicUsize,
    candidates: AtomicUsize,
}

impl FakeConnection {
    fn new(
        local: &str,
        remote: &str,
        tx: mpsc::UnboundedSender<LinkEvent>,
        connections: Weak<Connections>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            local: local.to_string(),
            remote: remote.to_string(),
            sink: Sink {
                remote: remote.to_string(),
                tx,
            },
            connections,
            me: me.clone(),
            state: Mutex::new(SignalingState::Stable),
            channels: Mutex::new(Vec::new()),
            next_mid: AtomicUsize::new(0),
            dirty: AtomicBool::new(false),
            remote_mids: Mutex::new(HashSet::new()),
            control: Mutex::new(None),
            control_open: AtomicBool::new(false),
            offers: AtomicUsize::new(0),
            answers: AtomicUsize::new(0),
            rollbacks: AtomicUsize::new(0),
            candidates: AtomicUsize::new(0),
        })
    }

    pub fn local(&self) -> &str {
        &self.local
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Offers this side created
    pub fn offers(&self) -> usize {
        self.offers.load(Ordering::SeqCst)
    }

    /// Answers this side created
    pub fn answers(&self) -> usize {
        self.answers.load(Ordering::SeqCst)
    }

    /// Local offers this side discarded
    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    /// Remote candidates applied
    pub fn candidates(&self) -> usize {
        self.candidates.load(Ordering::SeqCst)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn channel(&self, kind: MediaKind) -> Option<Arc<FakeChannel>> {
        self.channels
            .lock()
            .iter()
            .find(|c| c.kind == kind)
            .cloned()
    }

    pub fn is_closed(&self) -> bool {
        self.signaling_state() == SignalingState::Closed
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    fn mark_dirty(&self) {
        if !self.dirty.swap(true, Ordering::SeqCst)
            && self.signaling_state() == SignalingState::Stable
        {
            self.sink.emit(TransportEvent::NegotiationNeeded);
        }
    }

    /// Back to stable; changes made during the exchange ask for another round
    fn become_stable(&self) {
        *self.state.lock() = SignalingState::Stable;
        if self.is_dirty() {
            self.sink.emit(TransportEvent::NegotiationNeeded);
        }
    }

    fn local_description(&self) -> Result<String> {
        let channels = self
            .channels
            .lock()
            .iter()
            .filter_map(|c| {
                c.mid().map(|mid| ChannelEntry {
                    mid,
                    kind: c.kind,
                    sending: c.is_sending(),
                })
            })
            .collect();
        serde_json::to_string(&Description { channels })
            .map_err(|e| Error::SerializationError(e.to_string()))
    }

    fn apply_remote(&self, sdp: &str) -> Result<()> {
        let description: Description =
            serde_json::from_str(sdp).map_err(|e| Error::SdpError(e.to_string()))?;

        for entry in description.channels {
            let first_seen = self.remote_mids.lock().insert(entry.mid.clone());
            if first_seen && entry.sending {
                self.sink.emit(TransportEvent::TrackReceived(RemoteTrack {
                    id: format!("track-{}", entry.mid),
                    kind: entry.kind.track_kind(),
                    mid: Some(entry.mid.clone()),
                    stream_id: format!("{}-media", self.remote),
                }));
            }
            self.sink.emit(TransportEvent::RemoteTrackState {
                mid: entry.mid,
                receiving: entry.sending,
            });
        }
        Ok(())
    }

    fn emit_candidate(&self) {
        self.sink.emit(TransportEvent::IceCandidate(IceCandidate {
            candidate: format!("candidate:1 1 udp 2130706431 127.0.0.1 9 typ host {}", self.local),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
    }

    /// Open the control channel on both ends
    fn open_control(&self) {
        let Some(local_control) = self.control.lock().clone() else {
            return;
        };
        if self.control_open.swap(true, Ordering::SeqCst) {
            return;
        }

        self.sink
            .emit(TransportEvent::ControlChannelOpened(local_control.clone()));

        let counterpart = self
            .connections
            .upgrade()
            .and_then(|c| lookup(&c, &self.remote, &self.local));
        if let Some(counterpart) = counterpart {
            let accepted = Arc::new(FakeControl {
                label: local_control.label.clone(),
                local: self.remote.clone(),
                remote: self.local.clone(),
                connections: self.connections.clone(),
                closed: AtomicBool::new(false),
            });
            counterpart.control_open.store(true, Ordering::SeqCst);
            counterpart
                .control
                .lock()
                .get_or_insert_with(|| Arc::clone(&accepted));
            counterpart
                .sink
                .emit(TransportEvent::ControlChannelOpened(accepted));
        }
    }
}

#[async_trait]
impl PlatformConnection for FakeConnection {
    fn signaling_state(&self) -> SignalingState {
        *self.state.lock()
    }

    async fn add_channel(
        &self,
        kind: MediaKind,
        track: Arc<LocalTrack>,
    ) -> Result<Arc<dyn MediaChannel>> {
        if self.is_closed() {
            return Err(Error::LinkClosed(self.remote.clone()));
        }
        let channel = Arc::new(FakeChannel {
            kind,
            mid: Mutex::new(None),
            direction: Mutex::new(ChannelDirection::SendRecv),
            track: Mutex::new(Some(track.id().to_string())),
            owner: self.me.clone(),
        });
        self.channels.lock().push(Arc::clone(&channel));
        self.mark_dirty();
        Ok(channel)
    }

    async fn create_offer(&self) -> Result<String> {
        {
            let mut state = self.state.lock();
            if *state != SignalingState::Stable {
                return Err(Error::SdpError(format!("cannot offer in {:?}", *state)));
            }
            *state = SignalingState::HaveLocalOffer;
        }
        self.dirty.store(false, Ordering::SeqCst);

        for channel in self.channels.lock().iter() {
            let mut mid = channel.mid.lock();
            if mid.is_none() {
                let n = self.next_mid.fetch_add(1, Ordering::SeqCst);
                *mid = Some(format!("{}-{}", self.local, n));
            }
        }

        self.offers.fetch_add(1, Ordering::SeqCst);
        self.emit_candidate();
        self.local_description()
    }

    async fn accept_offer(&self, sdp: String) -> Result<String> {
        if self.is_closed() {
            return Err(Error::LinkClosed(self.remote.clone()));
        }
        {
            let mut state = self.state.lock();
            if *state == SignalingState::HaveLocalOffer {
                return Err(Error::SdpError("offer collided with our offer".to_string()));
            }
            *state = SignalingState::HaveRemoteOffer;
        }
        self.apply_remote(&sdp)?;

        let answer = self.local_description()?;
        self.answers.fetch_add(1, Ordering::SeqCst);
        self.become_stable();
        self.emit_candidate();
        self.sink.emit(TransportEvent::StateChanged(LinkState::Connected));
        Ok(answer)
    }

    async fn accept_answer(&self, sdp: String) -> Result<()> {
        let state = self.signaling_state();
        if state != SignalingState::HaveLocalOffer {
            return Err(Error::SdpError(format!("unexpected answer in {:?}", state)));
        }
        self.apply_remote(&sdp)?;
        self.sink.emit(TransportEvent::StateChanged(LinkState::Connected));
        self.open_control();
        self.become_stable();
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state != SignalingState::HaveLocalOffer {
            return Ok(());
        }
        *state = SignalingState::Stable;
        // The discarded offer's changes are still unannounced
        self.dirty.store(true, Ordering::SeqCst);
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<()> {
        if self.is_closed() {
            return Err(Error::IceCandidateError("connection closed".to_string()));
        }
        self.candidates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_control_channel(&self, label: &str) -> Result<Arc<dyn ControlChannel>> {
        let control = Arc::new(FakeControl {
            label: label.to_string(),
            local: self.local.clone(),
            remote: self.remote.clone(),
            connections: self.connections.clone(),
            closed: AtomicBool::new(false),
        });
        *self.control.lock() = Some(Arc::clone(&control));
        Ok(control)
    }

    async fn close(&self) -> Result<()> {
        *self.state.lock() = SignalingState::Closed;
        if let Some(control) = self.control.lock().take() {
            control.closed.store(true, Ordering::SeqCst);
        }
        Ok(())
    }
}
