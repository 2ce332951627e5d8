//! Wire error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid packet magic: {0:02x?}")]
    InvalidMagic([u8; 4]),

    #[error("Packet truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("Unknown protocol: {0}")]
    UnknownProtocol(String),

    #[error("Field too long: {0} bytes")]
    TooLong(usize),
}

pub type Result<T> = std::result::Result<T, Error>;
