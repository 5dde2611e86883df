//! Channel reuse: at most one channel per (link, kind), ever
//!
//! A channel is created the first time a track is attached for its kind; that
//! creation is what makes the platform request renegotiation. Later attach and
//! detach calls only swap the outbound track and flip the direction.

use super::link::PeerLink;
use crate::media::{LocalTrack, MediaKind};
use crate::transport::{ChannelDirection, MediaChannel};
use crate::Result;
use std::sync::Arc;
use tracing::{debug, info};

pub enum EnsureOutcome {
    /// New channel; the platform will ask for renegotiation
    Created(Arc<dyn MediaChannel>),
    /// Existing channel now carries the given track
    Replaced(Arc<dyn MediaChannel>),
    /// Existing channel detached and marked inactive
    Detached(Arc<dyn MediaChannel>),
    /// Nothing to detach
    Unchanged,
}

impl EnsureOutcome {
    pub fn name(&self) -> &'static str {
        match self {
            EnsureOutcome::Created(_) => "created",
            EnsureOutcome::Replaced(_) => "replaced",
            EnsureOutcome::Detached(_) => "detached",
            EnsureOutcome::Unchanged => "unchanged",
        }
    }
}

/// Attach `track` to the `kind` channel of `link`, or detach with `None`
pub async fn ensure(
    link: &PeerLink,
    kind: MediaKind,
    track: Option<Arc<LocalTrack>>,
) -> Result<EnsureOutcome> {
    let mut channels = link.channels().lock().await;

    match (channels.get(&kind).cloned(), track) {
        (None, None) => Ok(EnsureOutcome::Unchanged),
        (None, Some(track)) => {
            let channel = link.connection().add_channel(kind, track).await?;
            channels.insert(kind, Arc::clone(&channel));
            link.record_channel_created();
            info!("Created {} channel to {}", kind, link.peer_id());
            Ok(EnsureOutcome::Created(channel))
        }
        (Some(channel), Some(track)) => {
            channel.replace_track(Some(track)).await?;
            if channel.direction() != ChannelDirection::SendRecv {
                channel.set_direction(ChannelDirection::SendRecv).await?;
            }
            debug!("Reattached {} channel to {}", kind, link.peer_id());
            Ok(EnsureOutcome::Replaced(channel))
        }
        (Some(channel), None) => {
            channel.replace_track(None).await?;
            channel.set_direction(ChannelDirection::Inactive).await?;
            debug!("Detached {} channel to {}", kind, link.peer_id());
            Ok(EnsureOutcome::Detached(channel))
        }
    }
}
