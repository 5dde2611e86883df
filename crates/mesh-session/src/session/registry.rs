//! Participant registry and remote stream classification

use crate::media::{TrackKind, VideoSource};
use crate::peer::LinkState;
use crate::signaling::ParticipantInfo;
use crate::transport::RemoteTrack;
use std::collections::HashMap;
use std::sync::Arc;

/// A group of remote tracks presented together
///
/// A new stream object (with a new id) is created only when the set of
/// tracks changes, so consumers can compare by identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub id: String,
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    fn new(tracks: Vec<RemoteTrack>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tracks,
        }
    }

    pub fn track_ids(&self) -> Vec<&str> {
        self.tracks.iter().map(|t| t.id.as_str()).collect()
    }
}

/// Classified remote media of one participant
///
/// `combined` holds audio and any video whose source has not been declared.
#[derive(Debug, Clone, Default)]
pub struct RemoteStreams {
    pub combined: Option<Arc<RemoteStream>>,
    pub camera: Option<Arc<RemoteStream>>,
    pub screen: Option<Arc<RemoteStream>>,
}

#[derive(Debug, Clone)]
struct ReceivedTrack {
    track: RemoteTrack,
    receiving: bool,
}

#[derive(Debug, Clone)]
pub struct Participant {
    pub id: String,
    pub display_name: String,
    pub is_creator: bool,
    pub profile: Option<serde_json::Value>,
    pub state: LinkState,
    pub speaking: bool,
    pub streams: RemoteStreams,
    tracks: Vec<ReceivedTrack>,
}

impl Participant {
    pub fn from_info(info: ParticipantInfo) -> Self {
        Self {
            id: info.id,
            display_name: info.display_name,
            is_creator: info.is_creator,
            profile: info.profile,
            state: LinkState::New,
            speaking: false,
            streams: RemoteStreams::default(),
            tracks: Vec::new(),
        }
    }

    fn update_info(&mut self, info: ParticipantInfo) {
        if !info.display_name.is_empty() {
            self.display_name = info.display_name;
        }
        self.is_creator = info.is_creator;
        if info.profile.is_some() {
            self.profile = info.profile;
        }
    }

    /// What to render: screen, then camera, then the undifferentiated stream
    pub fn preferred_stream(&self) -> Option<&Arc<RemoteStream>> {
        self.streams
            .screen
            .as_ref()
            .or(self.streams.camera.as_ref())
            .or(self.streams.combined.as_ref())
    }

    /// Remote tracks currently being received
    pub fn remote_tracks(&self) -> Vec<&RemoteTrack> {
        self.tracks
            .iter()
            .filter(|t| t.receiving)
            .map(|t| &t.track)
            .collect()
    }

    /// Record a received track; returns `false` if it was already known
    pub fn add_track(&mut self, track: RemoteTrack) -> bool {
        if let Some(existing) = self.tracks.iter_mut().find(|t| t.track.id == track.id) {
            let changed = existing.track != track || !existing.receiving;
            existing.track = track;
            existing.receiving = true;
            return changed;
        }
        self.tracks.push(ReceivedTrack {
            track,
            receiving: true,
        });
        true
    }

    /// Update whether the remote is sending on `mid`; returns whether anything changed
    pub fn set_receiving(&mut self, mid: &str, receiving: bool) -> bool {
        let mut changed = false;
        for t in self
            .tracks
            .iter_mut()
            .filter(|t| t.track.mid.as_deref() == Some(mid))
        {
            if t.receiving != receiving {
                t.receiving = receiving;
                changed = true;
            }
        }
        changed
    }

    /// Partition live tracks into combined/camera/screen using sender-declared mids
    ///
    /// Returns whether any stream object was replaced.
    pub fn reclassify(&mut self, media: &HashMap<String, VideoSource>) -> bool {
        let mut combined = Vec::new();
        let mut camera = Vec::new();
        let mut screen = Vec::new();

        for t in self.tracks.iter().filter(|t| t.receiving) {
            let source = t.track.mid.as_ref().and_then(|mid| media.get(mid));
            match (t.track.kind, source) {
                (TrackKind::Video, Some(VideoSource::Camera)) => camera.push(t.track.clone()),
                (TrackKind::Video, Some(VideoSource::Screen)) => screen.push(t.track.clone()),
                _ => combined.push(t.track.clone()),
            }
        }

        let mut changed = update_slot(&mut self.streams.combined, combined);
        changed |= update_slot(&mut self.streams.camera, camera);
        changed |= update_slot(&mut self.streams.screen, screen);
        changed
    }

    fn clear_media(&mut self) {
        self.tracks.clear();
        self.streams = RemoteStreams::default();
        self.speaking = false;
    }
}

fn update_slot(slot: &mut Option<Arc<RemoteStream>>, tracks: Vec<RemoteTrack>) -> bool {
    let unchanged = {
        let current = slot.as_ref().map(|s| s.track_ids()).unwrap_or_default();
        let next: Vec<&str> = tracks.iter().map(|t| t.id.as_str()).collect();
        current == next
    };
    if unchanged {
        return false;
    }

    *slot = if tracks.is_empty() {
        None
    } else {
        Some(Arc::new(RemoteStream::new(tracks)))
    };
    true
}

/// Remote participants keyed by id
#[derive(Debug, Default)]
pub struct Registry {
    participants: HashMap<String, Participant>,
}

impl Registry {
    /// Insert or refresh a participant; returns `true` if it was new
    pub fn upsert(&mut self, info: ParticipantInfo) -> bool {
        match self.participants.get_mut(&info.id) {
            Some(existing) => {
                existing.update_info(info);
                false
            }
            None => {
                self.participants
                    .insert(info.id.clone(), Participant::from_info(info));
                true
            }
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<Participant> {
        self.participants.remove(id).map(|mut p| {
            p.state = LinkState::Closed;
            p.clear_media();
            p
        })
    }

    pub fn get(&self, id: &str) -> Option<&Participant> {
        self.participants.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Participant> {
        self.participants.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.participants.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Returns whether the state changed
    pub fn set_state(&mut self, id: &str, state: LinkState) -> bool {
        match self.participants.get_mut(id) {
            Some(p) if p.state != state => {
                p.state = state;
                true
            }
            _ => false,
        }
    }

    /// Remove everyone; returns the removed ids
    pub fn clear(&mut self) -> Vec<String> {
        let mut ids: Vec<String> = self.participants.drain().map(|(id, _)| id).collect();
        ids.sort();
        ids
    }

    /// Participants sorted by id
    pub fn snapshot(&self) -> Vec<Participant> {
        let mut participants: Vec<Participant> = self.participants.values().cloned().collect();
        participants.sort_by(|a, b| a.id.cmp(&b.id));
        participants
    }
}
