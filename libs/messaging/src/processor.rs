//! Message processor: the consumer loop of a client's inbound queue.

use std::fmt::Display;
use std::sync::Arc;

use async_trait::async_trait;
use fleet_messages::MessageEnvelope;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Application-level handler of inbound messages.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    type Error: Display + Send;

    async fn handle(&self, envelope: MessageEnvelope) -> Result<(), Self::Error>;
}

/// Drains an inbound queue and dispatches each message to a handler, one at
/// a time, in arrival order.
pub struct MessageProcessor<H> {
    owner: String,
    inbound: mpsc::UnboundedReceiver<MessageEnvelope>,
    handler: Arc<H>,
}

impl<H: MessageHandler> MessageProcessor<H> {
    pub fn new(
        owner: impl Into<String>,
        inbound: mpsc::UnboundedReceiver<MessageEnvelope>,
        handler: Arc<H>,
    ) -> Self {
        Self {
            owner: owner.into(),
            inbound,
            handler,
        }
    }

    /// Runs until shutdown is signalled or the queue is closed.
    ///
    /// Handler failures are logged; they never stop the loop.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(owner = %self.owner, "Message processor started");

        loop {
            tokio::select! {
                next = self.inbound.recv() => {
                    let Some(envelope) = next else {
                        debug!(owner = %self.owner, "Inbound queue closed");
                        break;
                    };
                    let kind = envelope.message.kind();
                    let message_id = envelope.id;
                    if let Err(e) = self.handler.handle(envelope).await {
                        warn!(
                            owner = %self.owner,
                            message_id = %message_id,
                            kind,
                            error = %e,
                            "Message handling failed"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(owner = %self.owner, "Message processor stopped");
    }
}
