//! Dispatch of the messages agents send to the DM.

use std::sync::Arc;

use async_trait::async_trait;
use fleet_messages::{Message, MessageEnvelope};
use fleet_messaging::MessageHandler;
use tracing::{debug, warn};

use crate::lifecycle::InstancesManager;
use crate::notifications::AutonomicEvent;
use crate::DmError;

/// Handler plugged into the DM's message processor.
pub struct DmMessageHandler {
    manager: Arc<InstancesManager>,
}

impl DmMessageHandler {
    pub fn new(manager: Arc<InstancesManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl MessageHandler for DmMessageHandler {
    type Error = DmError;

    async fn handle(&self, envelope: MessageEnvelope) -> Result<(), DmError> {
        debug!(message_id = %envelope.id, kind = envelope.message.kind(), "Message from an agent");

        match envelope.message {
            Message::Heartbeat {
                application,
                scoped_path,
                ip_address,
                ..
            } => {
                self.manager
                    .handle_heartbeat(&application, &scoped_path, ip_address)
                    .await
            }
            Message::InstanceChanged {
                application,
                instance_path,
                new_status,
                imports,
            } => {
                self.manager
                    .handle_instance_changed(&application, &instance_path, new_status, imports)
                    .await
            }
            Message::InstanceRemoved {
                application,
                instance_path,
            } => {
                self.manager
                    .handle_instance_removed(&application, &instance_path)
                    .await
            }
            Message::MachineDown {
                application,
                scoped_path,
            } => self.manager.handle_machine_down(&application, &scoped_path).await,
            Message::Autonomic {
                application,
                scoped_path,
                event_name,
            } => {
                self.manager.handle_autonomic(AutonomicEvent {
                    application,
                    scoped_path,
                    event_name,
                });
                Ok(())
            }
            other => {
                warn!(
                    kind = other.kind(),
                    direction = ?other.direction(),
                    "Unexpected message for the DM"
                );
                Ok(())
            }
        }
    }
}
