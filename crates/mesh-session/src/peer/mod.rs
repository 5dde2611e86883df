//! Per-peer links: channel set, negotiation and control channel

pub mod link;
pub mod negotiation;
pub mod transceiver;

pub use link::{LinkStats, PeerLink};
pub use negotiation::{negotiate, should_initiate, NegotiationFlag, NegotiationOutcome};
pub use transceiver::{ensure, EnsureOutcome};

use serde::{Deserialize, Serialize};

/// Lifecycle of a peer link
///
/// `New` through `Failed` follow the platform connection; `Closed` is reached
/// only by explicit teardown. `Failed` is terminal: no ICE restart is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl LinkState {
    /// States a link does not leave on its own
    pub fn is_terminal(&self) -> bool {
        matches!(self, LinkState::Failed | LinkState::Closed)
    }
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LinkState::New => "new",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Disconnected => "disconnected",
            LinkState::Failed => "failed",
            LinkState::Closed => "closed",
        };
        f.write_str(s)
    }
}
