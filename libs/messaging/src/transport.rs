//! Transport seam.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use fleet_messages::MessageEnvelope;
use tokio::sync::mpsc;

use crate::{MessagingContext, MessagingError};

/// Sender half of a client's inbound queue. Transports push every message
/// received on a subscribed context into it.
pub type InboundSender = mpsc::UnboundedSender<MessageEnvelope>;

/// Settings handed to a factory when it builds a client.
#[derive(Debug, Clone, Default)]
pub struct TransportConfig {
    /// Messaging domain, the first segment of every routing key.
    pub domain: String,

    /// Backend specific properties (broker URL, credentials...).
    pub properties: BTreeMap<String, String>,
}

impl TransportConfig {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            properties: BTreeMap::new(),
        }
    }
}

/// A connection to one messaging backend.
///
/// This is the only component touching the wire.
#[async_trait]
pub trait TransportClient: Send + Sync {
    /// Name of the factory that built this client.
    fn backend(&self) -> &str;

    fn is_connected(&self) -> bool;

    async fn open_connection(&self) -> Result<(), MessagingError>;

    /// Closes the connection and drops every subscription.
    async fn close_connection(&self) -> Result<(), MessagingError>;

    async fn publish(
        &self,
        context: &MessagingContext,
        envelope: &MessageEnvelope,
    ) -> Result<(), MessagingError>;

    /// Subscribing twice to the same context has no additional effect.
    async fn subscribe(&self, context: &MessagingContext) -> Result<(), MessagingError>;

    async fn unsubscribe(&self, context: &MessagingContext) -> Result<(), MessagingError>;
}

/// Builds transport clients for one backend.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Unique backend name the factory is registered under.
    fn name(&self) -> &str;

    async fn create(
        &self,
        config: &TransportConfig,
        inbound: InboundSender,
    ) -> Result<Arc<dyn TransportClient>, MessagingError>;
}
