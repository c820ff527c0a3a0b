//! Placeholder client used while no backend is available.

use async_trait::async_trait;
use fleet_messages::MessageEnvelope;
use tracing::debug;

use crate::{MessagingContext, MessagingError, TransportClient};

/// Backend name reported by [`DismissedClient`].
pub const DISMISSED: &str = "dismissed";

/// A client that accepts every call and does nothing.
#[derive(Debug, Default)]
pub struct DismissedClient;

impl DismissedClient {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportClient for DismissedClient {
    fn backend(&self) -> &str {
        DISMISSED
    }

    fn is_connected(&self) -> bool {
        false
    }

    async fn open_connection(&self) -> Result<(), MessagingError> {
        Ok(())
    }

    async fn close_connection(&self) -> Result<(), MessagingError> {
        Ok(())
    }

    async fn publish(
        &self,
        context: &MessagingContext,
        envelope: &MessageEnvelope,
    ) -> Result<(), MessagingError> {
        debug!(context = %context, kind = envelope.message.kind(), "Dropping message, no transport");
        Ok(())
    }

    async fn subscribe(&self, _context: &MessagingContext) -> Result<(), MessagingError> {
        Ok(())
    }

    async fn unsubscribe(&self, _context: &MessagingContext) -> Result<(), MessagingError> {
        Ok(())
    }
}
