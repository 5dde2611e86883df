//! Session orchestration and participant registry

pub mod engine;
pub mod events;
pub mod registry;

pub use engine::MeshSession;
pub use events::{MeetingState, SessionEvent, SessionSnapshot};
pub use registry::{Participant, Registry, RemoteStream, RemoteStreams};
