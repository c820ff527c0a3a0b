//! Error types for message encoding.

use thiserror::Error;

/// Errors that can occur when encoding or decoding messages.
#[derive(Debug, Error, Clone)]
pub enum MessageError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid message payload: {0}")]
    InvalidPayload(String),
}

impl From<serde_json::Error> for MessageError {
    fn from(err: serde_json::Error) -> Self {
        MessageError::Serialization(err.to_string())
    }
}
