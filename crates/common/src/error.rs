use thiserror::Error;

/// Common error types for veil
///
/// The variants follow the failure taxonomy of the relay core: transport,
/// protocol, policy, resource, timeout, internal. Wire-visible close codes
/// (DESTROY and stream END reasons) are separate enums in `veil-core`; these
/// errors are what the Rust API surfaces.
#[derive(Debug, Error)]
pub enum VeilError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Malformed cell: {0}")]
    MalformedCell(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Refused by exit policy")]
    ExitPolicyDenied,

    #[error("Resource limit: {0}")]
    ResourceLimit(String),

    #[error("Circuit id space on channel is saturated")]
    IdRangeFull,

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Channel is closed")]
    ChannelClosed,

    #[error("Circuit is closed")]
    CircuitClosed,

    #[error("Stream is closed")]
    StreamClosed,

    #[error("Resolve failed: {0}")]
    ResolveFailed(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type for veil operations
pub type Result<T> = std::result::Result<T, VeilError>;

impl VeilError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn malformed_cell(msg: impl Into<String>) -> Self {
        Self::MalformedCell(msg.into())
    }

    pub fn handshake(msg: impl Into<String>) -> Self {
        Self::HandshakeFailed(msg.into())
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        Self::ResourceLimit(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// True if this error should tear down the whole channel rather than a
    /// single circuit.
    pub fn is_channel_fatal(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::ChannelClosed | Self::Io(_))
    }
}
