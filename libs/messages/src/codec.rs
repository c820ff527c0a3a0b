//! JSON wire codec.

use bytes::Bytes;

use crate::{MessageEnvelope, MessageError};

/// Encodes an envelope to its wire representation.
pub fn encode(envelope: &MessageEnvelope) -> Result<Bytes, MessageError> {
    Ok(Bytes::from(serde_json::to_vec(envelope)?))
}

/// Decodes an envelope from its wire representation.
pub fn decode(raw: &[u8]) -> Result<MessageEnvelope, MessageError> {
    if raw.is_empty() {
        return Err(MessageError::InvalidPayload("empty frame".to_string()));
    }
    Ok(serde_json::from_slice(raw)?)
}
