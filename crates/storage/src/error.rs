//! Error types for session storage.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid location: {0}")]
    Location(#[from] wire::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for mesh::MeshError {
    fn from(e: Error) -> Self {
        mesh::MeshError::Storage(e.to_string())
    }
}
