//! Offer initiation and per-link offer serialization

use super::link::PeerLink;
use crate::transport::SignalingState;
use crate::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// Deterministic glare avoidance: the lexicographically smaller id offers first
///
/// Both sides evaluate this independently with swapped arguments, so exactly
/// one of them initiates.
pub fn should_initiate(local_id: &str, remote_id: &str) -> bool {
    local_id < remote_id
}

/// Negotiation-in-progress flag for one link
#[derive(Debug, Default)]
pub struct NegotiationFlag {
    in_flight: AtomicBool,
}

/// Held while an offer is being produced; clears the flag on drop
#[derive(Debug)]
pub struct NegotiationTicket<'a> {
    flag: &'a AtomicBool,
}

impl NegotiationFlag {
    pub fn try_acquire(&self) -> Option<NegotiationTicket<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| NegotiationTicket {
                flag: &self.in_flight,
            })
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }
}

impl Drop for NegotiationTicket<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationOutcome {
    OfferSent,
    /// Another offer for this link is being produced
    SkippedInFlight,
    /// The connection is mid-exchange; retried when it returns to stable
    SkippedUnstable,
    /// The offer was rolled back before it could be sent; retried afterwards
    Superseded,
    LinkClosed,
}

/// Create and send an offer if it is safe to do so
///
/// Skips (without error) when an offer is already in flight or the signaling
/// state is not stable; the skip is remembered on the link so the session can
/// replay it once the link is stable again. A failed or rolled back offer is
/// remembered the same way. `send_offer` relays the SDP.
pub async fn negotiate<F>(link: &PeerLink, send_offer: F) -> Result<NegotiationOutcome>
where
    F: FnOnce(String) -> Result<()>,
{
    if link.is_closed() {
        return Ok(NegotiationOutcome::LinkClosed);
    }

    let Some(_ticket) = link.negotiation().try_acquire() else {
        debug!("Negotiation with {} already in flight, skipping", link.peer_id());
        link.mark_renegotiate_pending();
        return Ok(NegotiationOutcome::SkippedInFlight);
    };

    let state = link.connection().signaling_state();
    if state != SignalingState::Stable {
        debug!(
            "Signaling state with {} is {:?}, deferring negotiation",
            link.peer_id(),
            state
        );
        link.mark_renegotiate_pending();
        return Ok(NegotiationOutcome::SkippedUnstable);
    }

    let sdp = match link.connection().create_offer().await {
        Ok(sdp) => sdp,
        Err(e) => {
            link.mark_renegotiate_pending();
            return Err(e);
        }
    };
    link.notify_description_applied();

    if link.is_closed() {
        return Ok(NegotiationOutcome::LinkClosed);
    }

    // A colliding remote offer may have rolled this one back meanwhile
    if link.connection().signaling_state() != SignalingState::HaveLocalOffer {
        debug!("Offer to {} was rolled back before sending", link.peer_id());
        link.mark_renegotiate_pending();
        return Ok(NegotiationOutcome::Superseded);
    }

    send_offer(sdp)?;
    info!("Sent offer to {}", link.peer_id());

    Ok(NegotiationOutcome::OfferSent)
}
