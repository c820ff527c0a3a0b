//! Messaging errors.

use fleet_messages::MessageError;
use thiserror::Error;

/// Errors raised by transports and the factory registry.
///
/// They never cross a [`crate::ReconfigurableClient`]: the client logs them
/// and keeps going.
#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("no transport factory registered under '{0}'")]
    UnknownBackend(String),

    #[error("transport '{backend}' is not connected")]
    NotConnected { backend: String },

    #[error("connection failed: {0}")]
    Connection(String),

    #[error(transparent)]
    Codec(#[from] MessageError),
}
