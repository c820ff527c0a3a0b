//! DM-side protocol facade.

use std::collections::BTreeMap;
use std::sync::Arc;

use fleet_messages::Message;
use fleet_model::Instance;
use tracing::debug;

use crate::{ListenerCommand, MessagingContext, ReconfigurableClient, ThoseThat};

/// Messaging operations of the deployment manager.
pub struct DmClient {
    client: Arc<ReconfigurableClient>,
}

impl DmClient {
    pub fn new(client: Arc<ReconfigurableClient>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Arc<ReconfigurableClient> {
        &self.client
    }

    fn domain(&self) -> &str {
        self.client.domain()
    }

    /// Sends a message to the agent managing `scoped_path`.
    pub async fn send_message_to_agent(&self, application: &str, scoped_path: &str, message: Message) {
        let context = MessagingContext::for_agent(self.domain(), application, scoped_path);
        self.client.publish(&context, message).await;
    }

    /// Listens (or stops listening) to the agents of an application.
    pub async fn listen_to_agent_messages(&self, application: &str, command: ListenerCommand) {
        let context = MessagingContext::for_dm(self.domain(), application);
        match command {
            ListenerCommand::Start => self.client.subscribe(&context).await,
            ListenerCommand::Stop => self.client.unsubscribe(&context).await,
        }
    }

    /// Announces on behalf of a dead agent that every instance it managed
    /// stopped exporting.
    ///
    /// The subtree of the scoped instance is walked deepest first and a
    /// remove-import is published on every export context of every
    /// instance.
    pub async fn propagate_agent_termination(
        &self,
        application: &str,
        external_exports: &BTreeMap<String, String>,
        scoped_path: &str,
        scoped_instance: &Instance,
    ) {
        let mut subtree = Vec::new();
        scoped_instance.walk(scoped_path, &mut subtree);
        subtree.sort_by_key(|(path, _)| std::cmp::Reverse(path.matches('/').count()));

        for (path, instance) in subtree {
            let contexts = MessagingContext::for_exported_variables(
                self.domain(),
                application,
                instance,
                external_exports,
                ThoseThat::Import,
            );
            for context in contexts {
                let Some(prefix) = context.subject() else {
                    continue;
                };
                let message = Message::RemoveImport {
                    application: application.to_string(),
                    prefix: prefix.to_string(),
                    removed_path: path.clone(),
                };
                self.client.publish(&context, message).await;
            }
        }

        debug!(
            application,
            scoped = %scoped_path,
            "Agent termination propagated"
        );
    }
}
