//! Mesh error types.

use thiserror::Error;

/// Mesh error type.
///
/// Variants fall into a handful of categories: lifecycle misuse, routing
/// misses, transport failures, protocol mismatch, shutdown and packet
/// validation. Use [`MeshError::is_routing_miss`] and
/// [`MeshError::is_lifecycle`] to branch on category.
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("container already initialized")]
    AlreadyInitialized,

    #[error("already started")]
    AlreadyStarted,

    #[error("already closed")]
    AlreadyClosed,

    #[error("container not initialized")]
    NotInitialized,

    #[error("container not started")]
    NotStarted,

    #[error("naming is not configured")]
    NamingNotConfigured,

    #[error("dialer is not configured")]
    DialerNotConfigured,

    /// No client pool exists for the service name.
    #[error("service {0} not found")]
    ServiceNotFound(String),

    /// The pool exists but has no routable member.
    #[error("no available instance of service {0}")]
    NoAvailableInstance(String),

    /// The selected id has no live client.
    #[error("client {0} not found")]
    ClientNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("remote side closed the connection")]
    RemoteClosed,

    #[error("channel {0} is closed")]
    ChannelClosed(String),

    #[error("client is not connected")]
    NotConnected,

    #[error("client is already connected")]
    AlreadyConnected,

    #[error("frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("invalid address {0:?}")]
    InvalidAddress(String),

    #[error("service {id} speaks {protocol}, expected tcp")]
    ProtocolMismatch { id: String, protocol: String },

    #[error("handshake rejected: {0}")]
    Handshake(String),

    #[error("shutdown did not finish within {0:?}")]
    ShutdownTimeout(std::time::Duration),

    #[error("invalid packet: {0}")]
    InvalidPacket(&'static str),

    #[error("dest server {got:?} does not match local server {expected:?}")]
    DestServerMismatch { expected: String, got: String },

    #[error("missing meta key {0}")]
    MissingMeta(&'static str),

    #[error("channel {0} not found")]
    ChannelNotFound(String),

    #[error("channel {0} already exists")]
    DuplicateChannel(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Discovery backend failure.
    #[error("naming error: {0}")]
    Naming(String),

    /// Session storage backend failure.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("wire error: {0}")]
    Wire(#[from] wire::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MeshError {
    /// True when no destination could be resolved for a forward.
    pub fn is_routing_miss(&self) -> bool {
        matches!(
            self,
            MeshError::ServiceNotFound(_)
                | MeshError::NoAvailableInstance(_)
                | MeshError::ClientNotFound(_)
        )
    }

    /// True for invalid state transitions, which callers that only care
    /// about "already done" may ignore.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            MeshError::AlreadyInitialized
                | MeshError::AlreadyStarted
                | MeshError::AlreadyClosed
                | MeshError::NotInitialized
                | MeshError::NotStarted
                | MeshError::AlreadyConnected
        )
    }
}

/// Result type for mesh operations.
pub type Result<T> = std::result::Result<T, MeshError>;
