//! Error types for the Consul client.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Consul returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("{0} is already subscribed")]
    AlreadySubscribed(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for mesh::MeshError {
    fn from(e: Error) -> Self {
        mesh::MeshError::Naming(e.to_string())
    }
}
