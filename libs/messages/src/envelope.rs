//! Message envelope: the unit a transport moves.

use chrono::{DateTime, Utc};
use fleet_id::MessageId;
use serde::{Deserialize, Serialize};

use crate::Message;

/// Envelope wrapping a message with its delivery metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Unique message identifier.
    pub id: MessageId,

    /// When the sender handed the message to its client.
    pub sent_at: DateTime<Utc>,

    pub message: Message,
}

impl MessageEnvelope {
    pub fn new(message: Message) -> Self {
        Self {
            id: MessageId::new(),
            sent_at: Utc::now(),
            message,
        }
    }
}

impl From<Message> for MessageEnvelope {
    fn from(message: Message) -> Self {
        Self::new(message)
    }
}
