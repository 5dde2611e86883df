//! Error types for the mesh session engine

/// Result type alias using the mesh session Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in session, signaling and peer operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Signaling connection error
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Room provisioning request failed
    #[error("Provisioning error: {0}")]
    ProvisioningError(String),

    /// Peer link already closed
    #[error("Peer link closed: {0}")]
    LinkClosed(String),

    /// WebRTC peer connection error
    #[error("Peer connection error: {0}")]
    PeerConnectionError(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// Data channel error
    #[error("Data channel error: {0}")]
    DataChannelError(String),

    /// Media track error
    #[error("Media track error: {0}")]
    MediaTrackError(String),

    /// Local capture was denied or cancelled
    #[error("Media acquisition denied: {0}")]
    MediaAcquisitionDenied(String),

    /// A channel never received a transport-assigned mid
    #[error("Mid resolution timeout: {0}")]
    MidResolutionTimeout(String),

    /// Invalid data format
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }

    /// Check if this error means the user declined (or the platform refused) capture
    pub fn is_media_denied(&self) -> bool {
        matches!(self, Error::MediaAcquisitionDenied(_))
    }
}
