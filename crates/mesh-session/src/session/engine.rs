//! Mesh session engine
//!
//! One event loop per connection consumes signaling messages and platform
//! callbacks in arrival order. Offer creation, mid resolution and screen-end
//! watching run as spawned tasks that only touch per-link state.

use super::events::{MeetingState, SessionEvent, SessionSnapshot};
use super::registry::{Participant, Registry};
use crate::channels::ControlMessage;
use crate::config::{IceServer, MeshConfig};
use crate::media::{
    LocalMediaController, LocalTrack, MediaCapture, MediaFlags, MediaKind, VideoSource,
    VoiceActivityDetector,
};
use crate::peer::{
    ensure, negotiate, should_initiate, EnsureOutcome, LinkState, LinkStats, NegotiationOutcome,
    PeerLink,
};
use crate::provisioning::RoomGrant;
use crate::signaling::{
    ClientMessage, IceCandidate, ParticipantInfo, ServerMessage, SignalingClient, SignalingEvent,
};
use crate::transport::{
    ControlChannel, LinkEvent, MediaChannel, PeerTransport, SignalingState, TransportEvent,
};
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

const EVENT_CAPACITY: usize = 256;

/// A participant's view of one room
///
/// Cheap to clone; all clones drive the same session.
#[derive(Clone)]
pub struct MeshSession {
    inner: Arc<SessionInner>,
}

struct LocalState {
    local_id: Option<String>,
    meeting: MeetingState,
    speaking: bool,
    last_error: Option<String>,
}

struct SessionInner {
    config: MeshConfig,
    transport: Arc<dyn PeerTransport>,
    media: LocalMediaController,

    local: RwLock<LocalState>,
    registry: RwLock<Registry>,
    links: RwLock<HashMap<String, Arc<PeerLink>>>,

    signaling: RwLock<Option<SignalingClient>>,
    ice_servers: RwLock<Vec<IceServer>>,
    link_events: Mutex<Option<mpsc::UnboundedSender<LinkEvent>>>,

    events: broadcast::Sender<SessionEvent>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    vad_task: Mutex<Option<JoinHandle<()>>>,
}

impl MeshSession {
    pub fn new(
        config: MeshConfig,
        transport: Arc<dyn PeerTransport>,
        capture: Arc<dyn MediaCapture>,
    ) -> Result<Self> {
        config.validate()?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = SessionInner {
            config,
            transport,
            media: LocalMediaController::new(capture),
            local: RwLock::new(LocalState {
                local_id: None,
                meeting: MeetingState::Idle,
                speaking: false,
                last_error: None,
            }),
            registry: RwLock::new(Registry::default()),
            links: RwLock::new(HashMap::new()),
            signaling: RwLock::new(None),
            ice_servers: RwLock::new(Vec::new()),
            link_events: Mutex::new(None),
            events,
            event_loop: Mutex::new(None),
            vad_task: Mutex::new(None),
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn config(&self) -> &MeshConfig {
        &self.inner.config
    }

    /// Open the signaling socket for `grant` and start the event loop
    ///
    /// Returns once the socket is open; membership arrives asynchronously as
    /// `joined`. Fails if the session is already connecting or connected.
    pub async fn connect(&self, grant: RoomGrant) -> Result<()> {
        let inner = &self.inner;

        let current = inner.local.read().meeting;
        match current {
            MeetingState::Connecting | MeetingState::Connected => {
                return Err(Error::SignalingError(format!(
                    "session is already {}",
                    current
                )));
            }
            MeetingState::Error => inner.reset_connection().await,
            MeetingState::Idle => {}
        }

        let ice_servers = grant.ice_servers_or(inner.config.fallback_ice_servers());
        info!(
            room_id = %grant.room_id,
            ice_servers = ice_servers.len(),
            "Connecting to room"
        );
        *inner.ice_servers.write() = ice_servers;
        inner.local.write().last_error = None;
        inner.set_meeting(MeetingState::Connecting);

        let connected = SignalingClient::connect(
            &inner.config.signaling_url,
            &grant.room_id,
            &grant.token,
            inner.config.keepalive_interval(),
        )
        .await;
        let (client, signaling_rx) = match connected {
            Ok(pair) => pair,
            Err(e) => {
                inner.fail(e.to_string());
                return Err(e);
            }
        };

        let (link_tx, link_rx) = mpsc::unbounded_channel();
        *inner.signaling.write() = Some(client);
        *inner.link_events.lock() = Some(link_tx);

        let handle = tokio::spawn(SessionInner::run(
            Arc::clone(inner),
            signaling_rx,
            link_rx,
        ));
        let previous = inner.event_loop.lock().replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }

        inner.start_voice_activity();
        Ok(())
    }

    /// Leave the room and release everything
    ///
    /// Notifies the server, stops local tracks, closes every link and the
    /// socket, then returns to idle. Safe to call in any state.
    pub async fn leave(&self) {
        let event_loop = self.inner.event_loop.lock().take();
        if let Some(handle) = event_loop {
            handle.abort();
        }
        self.inner.teardown(true).await;
    }

    /// Enable or disable a local media kind
    ///
    /// Returns `false` only when enabling failed (for example denied by the
    /// platform); the previous state is then left unchanged.
    ///
    /// ```
    /// # tokio_test::block_on(async {
    /// use mesh_session::{MediaKind, MeshConfig, MeshSession, SyntheticCapture, WebRtcTransport};
    /// use std::sync::Arc;
    ///
    /// let capture = Arc::new(SyntheticCapture::new());
    /// let session = MeshSession::new(
    ///     MeshConfig::default(),
    ///     Arc::new(WebRtcTransport::new()),
    ///     capture.clone(),
    /// )
    /// .unwrap();
    ///
    /// assert!(session.set_media_enabled(MediaKind::Camera, true).await);
    /// assert!(session.media_flags().await.camera);
    ///
    /// capture.deny(MediaKind::Screen);
    /// assert!(!session.set_media_enabled(MediaKind::Screen, true).await);
    /// # });
    /// ```
    pub async fn set_media_enabled(&self, kind: MediaKind, enabled: bool) -> bool {
        if enabled {
            self.inner.enable_media(kind).await
        } else {
            self.inner.disable_media(kind).await;
            true
        }
    }

    /// Flip a media kind; returns whether the toggle took effect
    pub async fn toggle_media(&self, kind: MediaKind) -> bool {
        let enabled = self.inner.media.is_enabled(kind).await;
        self.set_media_enabled(kind, !enabled).await
    }

    pub async fn media_flags(&self) -> MediaFlags {
        self.inner.media.flags().await
    }

    /// Live local track for `kind`, for preview
    pub async fn local_track(&self, kind: MediaKind) -> Option<Arc<LocalTrack>> {
        self.inner.media.track(kind).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> MeetingState {
        self.inner.local.read().meeting
    }

    pub fn local_id(&self) -> Option<String> {
        self.inner.local_id()
    }

    pub fn participant(&self, id: &str) -> Option<Participant> {
        self.inner.registry.read().get(id).cloned()
    }

    pub async fn link_stats(&self, peer_id: &str) -> Option<LinkStats> {
        let link = self.inner.link(peer_id)?;
        Some(link.stats().await)
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let media = self.inner.media.flags().await;
        let (local_id, state, speaking, last_error) = {
            let local = self.inner.local.read();
            (
                local.local_id.clone(),
                local.meeting,
                local.speaking,
                local.last_error.clone(),
            )
        };
        let participants = self.inner.registry.read().snapshot();

        SessionSnapshot {
            local_id,
            state,
            media,
            speaking,
            last_error,
            participants,
        }
    }
}

impl SessionInner {
    async fn run(
        self: Arc<Self>,
        mut signaling: mpsc::UnboundedReceiver<SignalingEvent>,
        mut links: mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        loop {
            tokio::select! {
                event = signaling.recv() => {
                    let Some(event) = event else {
                        debug!("Signaling event stream ended");
                        break;
                    };
                    if self.handle_signaling(event).await.is_break() {
                        break;
                    }
                }
                Some(event) = links.recv() => {
                    self.handle_link_event(event).await;
                }
            }
        }

        debug!("Session event loop exited");
    }

    // ---- signaling ----

    async fn handle_signaling(&self, event: SignalingEvent) -> ControlFlow<()> {
        let msg = match event {
            SignalingEvent::Message(msg) => msg,
            SignalingEvent::Lost(reason) => {
                self.on_signaling_lost(reason).await;
                return ControlFlow::Break(());
            }
        };

        debug!("Signaling message: {}", msg.name());
        match msg {
            ServerMessage::Joined {
                participant_id,
                participants,
            } => self.on_joined(participant_id, participants).await,
            ServerMessage::PeerJoined { participant } => self.admit(participant).await,
            ServerMessage::PeerLeft { participant_id } => self.on_peer_left(&participant_id).await,
            ServerMessage::Offer { from, sdp } => self.on_offer(from, sdp).await,
            ServerMessage::Answer { from, sdp } => self.on_answer(&from, sdp).await,
            ServerMessage::Candidate { from, candidate } => {
                self.on_candidate(&from, candidate).await
            }
            ServerMessage::RoomClosed { reason } => {
                self.on_room_closed(reason).await;
                return ControlFlow::Break(());
            }
            ServerMessage::Error { message } => self.on_server_error(message),
        }

        ControlFlow::Continue(())
    }

    async fn on_joined(&self, local_id: String, participants: Vec<ParticipantInfo>) {
        info!(
            participant_id = %local_id,
            roster = participants.len(),
            "Joined room"
        );
        self.local.write().local_id = Some(local_id.clone());
        self.set_meeting(MeetingState::Connected);

        for info in participants {
            if info.id == local_id {
                continue;
            }
            self.admit(info).await;
        }
    }

    /// Register a remote participant and open a link if we are the initiator
    async fn admit(&self, info: ParticipantInfo) {
        let peer_id = info.id.clone();
        let Some(local_id) = self.local_id() else {
            warn!("Ignoring participant {} before join completed", peer_id);
            return;
        };
        if peer_id == local_id {
            return;
        }

        let is_new = self.registry.write().upsert(info);
        if is_new {
            info!("Participant joined: {}", peer_id);
            self.emit(SessionEvent::ParticipantJoined(peer_id.clone()));
        } else {
            self.emit(SessionEvent::ParticipantUpdated(peer_id.clone()));
        }

        if should_initiate(&local_id, &peer_id) {
            if let Err(e) = self.initiate(&peer_id).await {
                warn!("Failed to open link to {}: {}", peer_id, e);
            }
        } else {
            debug!("Waiting for offer from {}", peer_id);
        }
    }

    #[instrument(skip_all, fields(peer_id = %peer_id))]
    async fn initiate(&self, peer_id: &str) -> Result<()> {
        let (link, created) = self.open_link(peer_id).await?;
        if !created {
            debug!("Link already open");
            return Ok(());
        }

        let control = link
            .connection()
            .create_control_channel(&self.config.control_channel_label)
            .await?;
        link.set_control_if_absent(control);

        self.attach_local_media(&link).await;

        // With no media the control channel alone still needs an offer
        if link.channel_count().await == 0 {
            self.spawn_negotiation(link);
        }
        Ok(())
    }

    /// Existing link for `peer_id`, or a fresh one; the flag is `true` if created
    async fn open_link(&self, peer_id: &str) -> Result<(Arc<PeerLink>, bool)> {
        if let Some(link) = self.link(peer_id) {
            return Ok((link, false));
        }

        let events = self
            .link_events
            .lock()
            .clone()
            .ok_or_else(|| Error::SignalingError("session is not connected".to_string()))?;
        let ice_servers = self.ice_servers.read().clone();

        let connection = self.transport.connect(peer_id, &ice_servers, events).await?;
        let link = Arc::new(PeerLink::new(peer_id, connection));
        self.links
            .write()
            .insert(peer_id.to_string(), Arc::clone(&link));
        debug!("Opened link to {}", peer_id);

        let is_new = self
            .registry
            .write()
            .upsert(ParticipantInfo::new(peer_id));
        if is_new {
            self.emit(SessionEvent::ParticipantJoined(peer_id.to_string()));
        }
        self.set_link_state(peer_id, LinkState::Connecting);

        Ok((link, true))
    }

    async fn on_offer(&self, from: String, sdp: String) {
        let (link, created) = match self.open_link(&from).await {
            Ok(opened) => opened,
            Err(e) => {
                warn!("Cannot accept offer from {}: {}", from, e);
                return;
            }
        };

        if link.connection().signaling_state() == SignalingState::HaveLocalOffer {
            let local_id = self.local_id().unwrap_or_default();
            if should_initiate(&local_id, &from) {
                // They roll back and answer ours
                debug!("Offer from {} collided with ours, keeping ours", from);
                return;
            }
            if let Err(e) = link.connection().rollback().await {
                warn!("Cannot roll back our offer to {}: {}", from, e);
                return;
            }
            info!("Offer from {} collided with ours, rolled ours back", from);
            link.mark_renegotiate_pending();
        }

        let answer = match link.connection().accept_offer(sdp).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!("Failed to apply offer from {}: {}", from, e);
                return;
            }
        };
        link.remote_description_applied().await;
        link.notify_description_applied();

        self.send_signal(&ClientMessage::Answer {
            to: from.clone(),
            sdp: answer,
        });
        info!("Sent answer to {}", from);

        if created {
            self.attach_local_media(&link).await;
        }
        if link.take_renegotiate_pending() {
            debug!("Replaying deferred negotiation with {}", from);
            self.spawn_negotiation(link);
        }
    }

    async fn on_answer(&self, from: &str, sdp: String) {
        let Some(link) = self.link(from) else {
            debug!("Answer from {} without a link, dropping", from);
            return;
        };

        if let Err(e) = link.connection().accept_answer(sdp).await {
            warn!("Failed to apply answer from {}: {}", from, e);
            return;
        }
        link.remote_description_applied().await;
        link.notify_description_applied();
        debug!("Applied answer from {}", from);

        if link.take_renegotiate_pending() {
            debug!("Replaying deferred negotiation with {}", from);
            self.spawn_negotiation(link);
        }
    }

    async fn on_candidate(&self, from: &str, candidate: IceCandidate) {
        let Some(link) = self.link(from) else {
            debug!("Candidate from {} without a link, dropping", from);
            return;
        };
        if let Err(e) = link.add_remote_candidate(candidate).await {
            warn!("Failed to add candidate from {}: {}", from, e);
        }
    }

    async fn on_peer_left(&self, peer_id: &str) {
        info!("Participant left: {}", peer_id);
        self.close_link(peer_id).await;
        let removed = self.registry.write().remove(peer_id);
        if removed.is_some() {
            self.emit(SessionEvent::ParticipantLeft(peer_id.to_string()));
        }
    }

    async fn on_room_closed(&self, reason: Option<String>) {
        let reason = reason.unwrap_or_else(|| "room closed".to_string());
        info!("Room closed by server: {}", reason);
        self.teardown(false).await;
        self.local.write().last_error = Some(reason);
    }

    fn on_server_error(&self, message: String) {
        warn!("Signaling server error: {}", message);
        self.fail(message);
    }

    async fn on_signaling_lost(&self, reason: String) {
        warn!("Signaling connection lost: {}; not reconnecting", reason);

        let client = self.signaling.write().take();
        if let Some(client) = client {
            client.close();
        }
        let vad = self.vad_task.lock().take();
        if let Some(vad) = vad {
            vad.abort();
        }
        self.close_all_links().await;
        self.fail(reason);
    }

    // ---- platform callbacks ----

    async fn handle_link_event(&self, event: LinkEvent) {
        let LinkEvent { peer_id, event } = event;
        let link = match self.link(&peer_id) {
            Some(link) if !link.is_closed() => link,
            _ => {
                debug!("Dropping {} for closed link {}", event.name(), peer_id);
                return;
            }
        };

        match event {
            TransportEvent::NegotiationNeeded => self.spawn_negotiation(link),
            TransportEvent::IceCandidate(candidate) => self.send_signal(&ClientMessage::Candidate {
                to: peer_id,
                candidate,
            }),
            TransportEvent::StateChanged(state) => {
                if state == LinkState::Failed {
                    warn!("Connection to {} failed; no ICE restart is attempted", peer_id);
                } else {
                    debug!("Connection to {} is {}", peer_id, state);
                }
                self.set_link_state(&peer_id, state);
            }
            TransportEvent::TrackReceived(track) => {
                debug!("Received {:?} track {} from {}", track.kind, track.id, peer_id);
                let added = self
                    .registry
                    .write()
                    .get_mut(&peer_id)
                    .map(|p| p.add_track(track))
                    .unwrap_or(false);
                self.reclassify(&link, added);
            }
            TransportEvent::RemoteTrackState { mid, receiving } => {
                let changed = self
                    .registry
                    .write()
                    .get_mut(&peer_id)
                    .map(|p| p.set_receiving(&mid, receiving))
                    .unwrap_or(false);
                self.reclassify(&link, changed);
            }
            TransportEvent::ControlChannelOpened(channel) => {
                self.on_control_open(&link, channel).await
            }
            TransportEvent::ControlMessage(text) => self.on_control_message(&link, &text),
        }
    }

    async fn on_control_open(&self, link: &Arc<PeerLink>, channel: Arc<dyn ControlChannel>) {
        let label = channel.label();
        if label != self.config.control_channel_label {
            debug!("Ignoring data channel '{}' from {}", label, link.peer_id());
            return;
        }
        if !link.set_control_if_absent(channel) {
            debug!("Control channel to {} already held", link.peer_id());
        }
        link.mark_control_ready();
        info!("Control channel to {} open", link.peer_id());

        // Catch up on declarations made before the channel was usable
        for (kind, channel) in link.channels_snapshot().await {
            let (Some(source), Some(mid)) = (kind.video_source(), channel.mid()) else {
                continue;
            };
            if !self.media.is_enabled(kind).await {
                continue;
            }
            if let Err(e) = link
                .send_control(&ControlMessage::MediaType { mid, kind: source })
                .await
            {
                warn!("Failed to announce {} to {}: {}", kind, link.peer_id(), e);
            }
        }

        let speaking = self.local.read().speaking;
        if let Err(e) = link.send_control(&ControlMessage::Speaking { speaking }).await {
            debug!("Failed to send speaking state to {}: {}", link.peer_id(), e);
        }
    }

    fn on_control_message(&self, link: &PeerLink, text: &str) {
        let peer_id = link.peer_id();
        match ControlMessage::from_json(text) {
            Ok(ControlMessage::Speaking { speaking }) => {
                let changed = self
                    .registry
                    .write()
                    .get_mut(peer_id)
                    .map(|p| std::mem::replace(&mut p.speaking, speaking) != speaking)
                    .unwrap_or(false);
                if changed {
                    debug!("{} speaking: {}", peer_id, speaking);
                    self.emit(SessionEvent::ParticipantUpdated(peer_id.to_string()));
                }
            }
            Ok(ControlMessage::MediaType { mid, kind }) => {
                debug!("{} declared mid {} as {:?}", peer_id, mid, kind);
                link.record_media_type(mid, kind);
                self.reclassify(link, false);
            }
            Err(e) => debug!("Dropping control message from {}: {}", peer_id, e),
        }
    }

    /// Recompute the participant's streams; emits an update if anything changed
    fn reclassify(&self, link: &PeerLink, already_changed: bool) {
        let media = link.remote_media();
        let reclassified = self
            .registry
            .write()
            .get_mut(link.peer_id())
            .map(|p| p.reclassify(&media))
            .unwrap_or(false);
        if already_changed || reclassified {
            self.emit(SessionEvent::ParticipantUpdated(link.peer_id().to_string()));
        }
    }

    // ---- local media ----

    async fn enable_media(self: &Arc<Self>, kind: MediaKind) -> bool {
        if self.media.is_enabled(kind).await {
            return true;
        }

        let track = match self.media.enable(kind).await {
            Ok(track) => track,
            Err(e) if e.is_media_denied() => {
                info!("{} capture was denied: {}", kind, e);
                return false;
            }
            Err(e) => {
                warn!("Could not enable {}: {}", kind, e);
                return false;
            }
        };

        for link in self.links_snapshot() {
            self.apply_track(&link, kind, Some(Arc::clone(&track))).await;
        }
        if kind == MediaKind::Screen {
            self.watch_screen_end(&track);
        }

        self.emit_media_changed().await;
        true
    }

    async fn disable_media(&self, kind: MediaKind) {
        let Some(track) = self.media.disable(kind).await else {
            debug!("{} already disabled", kind);
            return;
        };

        for link in self.links_snapshot() {
            self.apply_track(&link, kind, None).await;
        }
        debug!("Detached {} ({}) from all links", kind, track.id());

        self.emit_media_changed().await;
    }

    async fn attach_local_media(&self, link: &Arc<PeerLink>) {
        for kind in MediaKind::ALL {
            if let Some(track) = self.media.track(kind).await {
                self.apply_track(link, kind, Some(track)).await;
            }
        }
    }

    async fn apply_track(
        &self,
        link: &Arc<PeerLink>,
        kind: MediaKind,
        track: Option<Arc<LocalTrack>>,
    ) {
        let outcome = match ensure(link, kind, track).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Failed to update {} channel to {}: {}", kind, link.peer_id(), e);
                return;
            }
        };
        debug!(
            peer_id = %link.peer_id(),
            kind = %kind,
            outcome = outcome.name(),
            "Channel updated"
        );

        if let EnsureOutcome::Created(channel) | EnsureOutcome::Replaced(channel) = outcome {
            if let Some(source) = kind.video_source() {
                self.announce_media_type(Arc::clone(link), source, channel);
            }
        }
    }

    /// Resolve the channel's mid in the background, then declare its source
    fn announce_media_type(
        &self,
        link: Arc<PeerLink>,
        source: VideoSource,
        channel: Arc<dyn MediaChannel>,
    ) {
        let attempts = self.config.mid_resolution.attempts;
        let interval = self.config.mid_resolution.interval();

        tokio::spawn(async move {
            let Some(mid) = link.resolve_mid(&channel, attempts, interval).await else {
                if !link.is_closed() {
                    let err = Error::MidResolutionTimeout(format!(
                        "{:?} channel to {} after {} attempts",
                        source,
                        link.peer_id(),
                        attempts
                    ));
                    warn!("{}; it will show as undifferentiated video", err);
                }
                return;
            };

            let msg = ControlMessage::MediaType {
                mid: mid.clone(),
                kind: source,
            };
            match link.send_control(&msg).await {
                Ok(true) => debug!("Declared mid {} as {:?} to {}", mid, source, link.peer_id()),
                Ok(false) => debug!(
                    "Control channel to {} not open; mid {} is declared on open",
                    link.peer_id(),
                    mid
                ),
                Err(e) => warn!("Failed to declare mid {} to {}: {}", mid, link.peer_id(), e),
            }
        });
    }

    /// Disable screen sharing when the platform ends the capture
    fn watch_screen_end(self: &Arc<Self>, track: &Arc<LocalTrack>) {
        let session: Weak<Self> = Arc::downgrade(self);
        let mut ended = track.ended();
        let track_id = track.id().to_string();

        tokio::spawn(async move {
            if ended.wait_for(|ended| *ended).await.is_err() {
                return;
            }
            let Some(session) = session.upgrade() else {
                return;
            };

            let current = session.media.track(MediaKind::Screen).await;
            if current.map(|t| t.id() == track_id).unwrap_or(false) {
                info!("Screen capture ended by the platform");
                session.disable_media(MediaKind::Screen).await;
            }
        });
    }

    fn start_voice_activity(self: &Arc<Self>) {
        let session: Weak<Self> = Arc::downgrade(self);
        let config = self.config.voice_activity;

        let handle = tokio::spawn(async move {
            let mut detector = VoiceActivityDetector::new(&config);
            let mut ticker = tokio::time::interval(config.sample_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                let Some(session) = session.upgrade() else {
                    break;
                };

                let transition = match session.media.mic_level().await {
                    Some(level) => detector.push(level),
                    None => detector.reset(),
                };
                if let Some(speaking) = transition {
                    session.on_local_speaking(speaking).await;
                }
            }
        });

        let previous = self.vad_task.lock().replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    async fn on_local_speaking(&self, speaking: bool) {
        self.local.write().speaking = speaking;
        debug!("Local speaking: {}", speaking);
        self.emit(SessionEvent::LocalSpeaking(speaking));

        let msg = ControlMessage::Speaking { speaking };
        for link in self.links_snapshot() {
            if let Err(e) = link.send_control(&msg).await {
                debug!("Failed to send speaking state to {}: {}", link.peer_id(), e);
            }
        }
    }

    async fn emit_media_changed(&self) {
        let flags = self.media.flags().await;
        self.emit(SessionEvent::LocalMediaChanged(flags));
    }

    // ---- negotiation ----

    fn spawn_negotiation(&self, link: Arc<PeerLink>) {
        let signaling = self.signaling.read().clone();

        tokio::spawn(async move {
            let peer_id = link.peer_id().to_string();
            loop {
                let result = negotiate(&link, |sdp| match &signaling {
                    Some(client) => client.send(&ClientMessage::Offer {
                        to: peer_id.clone(),
                        sdp,
                    }),
                    None => Err(Error::SignalingError("signaling is closed".to_string())),
                })
                .await;

                match result {
                    Ok(NegotiationOutcome::Superseded) => {
                        debug!("Offer to {} was superseded by theirs", peer_id);
                        // Whoever sees the link stable first replays it
                        if link.connection().signaling_state() == SignalingState::Stable
                            && link.take_renegotiate_pending()
                        {
                            continue;
                        }
                    }
                    Ok(outcome) => debug!("Negotiation with {}: {:?}", peer_id, outcome),
                    Err(e) => warn!("Negotiation with {} failed: {}", peer_id, e),
                }
                break;
            }
        });
    }

    // ---- teardown ----

    async fn close_link(&self, peer_id: &str) {
        let link = self.links.write().remove(peer_id);
        if let Some(link) = link {
            if let Err(e) = link.close().await {
                debug!("Closing link to {} failed: {}", peer_id, e);
            }
        }
    }

    /// Close every link and forget every participant
    async fn close_all_links(&self) {
        let links: Vec<Arc<PeerLink>> = self.links.write().drain().map(|(_, l)| l).collect();
        for link in links {
            if let Err(e) = link.close().await {
                debug!("Closing link to {} failed: {}", link.peer_id(), e);
            }
        }

        let removed = self.registry.write().clear();
        for peer_id in removed {
            self.emit(SessionEvent::ParticipantLeft(peer_id));
        }
    }

    /// Drop what is left of a failed connection; local media is kept
    async fn reset_connection(&self) {
        let event_loop = self.event_loop.lock().take();
        if let Some(handle) = event_loop {
            handle.abort();
        }
        let client = self.signaling.write().take();
        if let Some(client) = client {
            client.close();
        }
        *self.link_events.lock() = None;
        self.close_all_links().await;
    }

    async fn teardown(&self, notify_server: bool) {
        info!("Leaving session");

        let signaling = self.signaling.write().take();
        if notify_server {
            if let Some(client) = &signaling {
                if let Err(e) = client.send(&ClientMessage::Leave) {
                    debug!("Failed to send leave: {}", e);
                }
            }
        }

        let stopped = self.media.stop_all().await;
        if stopped > 0 {
            debug!("Stopped {} local tracks", stopped);
        }

        let vad = self.vad_task.lock().take();
        if let Some(vad) = vad {
            vad.abort();
        }

        self.close_all_links().await;

        if let Some(client) = signaling {
            client.close();
        }
        *self.link_events.lock() = None;

        {
            let mut local = self.local.write();
            local.local_id = None;
            local.speaking = false;
            local.last_error = None;
        }
        self.set_meeting(MeetingState::Idle);
        if stopped > 0 {
            self.emit_media_changed().await;
        }
    }

    // ---- helpers ----

    fn link(&self, peer_id: &str) -> Option<Arc<PeerLink>> {
        self.links.read().get(peer_id).cloned()
    }

    fn links_snapshot(&self) -> Vec<Arc<PeerLink>> {
        self.links.read().values().cloned().collect()
    }

    fn local_id(&self) -> Option<String> {
        self.local.read().local_id.clone()
    }

    fn send_signal(&self, msg: &ClientMessage) {
        let client = self.signaling.read().clone();
        match client {
            Some(client) => {
                if let Err(e) = client.send(msg) {
                    warn!("Failed to send signaling message: {}", e);
                }
            }
            None => debug!("Signaling closed, dropping outbound message"),
        }
    }

    fn set_meeting(&self, state: MeetingState) {
        let changed = {
            let mut local = self.local.write();
            std::mem::replace(&mut local.meeting, state) != state
        };
        if changed {
            info!("Session state: {}", state);
            self.emit(SessionEvent::StateChanged(state));
        }
    }

    fn set_link_state(&self, peer_id: &str, state: LinkState) {
        let changed = self.registry.write().set_state(peer_id, state);
        if changed {
            self.emit(SessionEvent::ParticipantUpdated(peer_id.to_string()));
        }
    }

    fn fail(&self, reason: String) {
        self.local.write().last_error = Some(reason);
        self.set_meeting(MeetingState::Error);
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}
