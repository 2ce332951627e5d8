//! Logic service error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LogicError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Mesh error: {0}")]
    Mesh(#[from] mesh::MeshError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::Error),
}

pub type Result<T> = std::result::Result<T, LogicError>;
