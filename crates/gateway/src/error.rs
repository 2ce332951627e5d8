//! Gateway error types.

use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Missing or malformed environment setting.
    #[error("Config error: {0}")]
    Config(String),

    #[error("Mesh error: {0}")]
    Mesh(#[from] mesh::MeshError),

    #[error("Packet error: {0}")]
    Wire(#[from] wire::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
