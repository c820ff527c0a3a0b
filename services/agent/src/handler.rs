//! Dispatch of the messages an agent receives.

use std::sync::Arc;

use async_trait::async_trait;
use fleet_messages::{Message, MessageEnvelope};
use fleet_messaging::MessageHandler;
use tracing::{debug, warn};

use crate::imports::ReceivedExports;
use crate::lifecycle::AgentLifecycle;
use crate::AgentError;

pub struct AgentMessageHandler {
    lifecycle: Arc<AgentLifecycle>,
}

impl AgentMessageHandler {
    pub fn new(lifecycle: Arc<AgentLifecycle>) -> Self {
        Self { lifecycle }
    }
}

#[async_trait]
impl MessageHandler for AgentMessageHandler {
    type Error = AgentError;

    async fn handle(&self, envelope: MessageEnvelope) -> Result<(), AgentError> {
        debug!(id = %envelope.id, kind = envelope.message.kind(), "Agent message");
        let lifecycle = &self.lifecycle;

        match envelope.message {
            Message::SetScopedInstance {
                application,
                scoped_path,
                scoped_instance,
                external_exports,
            } => {
                lifecycle
                    .set_scoped_instance(&application, &scoped_path, scoped_instance, external_exports)
                    .await
            }
            Message::ChangeInstanceState {
                instance_path,
                new_status,
                resources,
            } => {
                lifecycle
                    .change_instance_state(&instance_path, new_status, resources)
                    .await
            }
            Message::AddInstance {
                parent_path,
                instance,
            } => lifecycle.add_instance(&parent_path, instance).await,
            Message::RemoveInstance { instance_path } => {
                lifecycle.remove_instance(&instance_path).await
            }
            Message::SendInstances => lifecycle.send_instances().await,
            Message::Resynchronize => lifecycle.resynchronize().await,

            Message::AddImport {
                application,
                prefix,
                exporter_path,
                component_name,
                exported_vars,
            } => {
                lifecycle
                    .add_import(ReceivedExports {
                        application,
                        prefix,
                        exporter_path,
                        component_name,
                        exported_vars,
                    })
                    .await
            }
            Message::RemoveImport {
                application,
                prefix,
                removed_path,
            } => {
                lifecycle
                    .remove_import(&application, &prefix, &removed_path)
                    .await
            }
            Message::RequestImport {
                application,
                prefix,
                requester_path,
            } => {
                lifecycle
                    .answer_request(&application, &prefix, &requester_path)
                    .await
            }

            other => {
                warn!(
                    kind = other.kind(),
                    direction = ?other.direction(),
                    "Unexpected message for an agent"
                );
                Ok(())
            }
        }
    }
}
