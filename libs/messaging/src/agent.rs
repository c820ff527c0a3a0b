//! Agent-side protocol facade.

use std::collections::BTreeMap;
use std::sync::Arc;

use fleet_messages::Message;
use fleet_model::{variables, Instance};
use tokio::sync::RwLock;
use tracing::debug;

use crate::{ListenerCommand, MessagingContext, ReconfigurableClient, RecipientKind, ThoseThat};

/// Messaging operations of the agent managing one scoped instance.
///
/// Instances are passed with their path since the model tree has no parent
/// links.
pub struct AgentClient {
    client: Arc<ReconfigurableClient>,
    application: String,
    scoped_path: String,
    /// External export aliases of the application, set with the model.
    external_exports: RwLock<BTreeMap<String, String>>,
}

impl AgentClient {
    pub fn new(
        client: Arc<ReconfigurableClient>,
        application: impl Into<String>,
        scoped_path: impl Into<String>,
    ) -> Self {
        Self {
            client,
            application: application.into(),
            scoped_path: scoped_path.into(),
            external_exports: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn client(&self) -> &Arc<ReconfigurableClient> {
        &self.client
    }

    pub fn application(&self) -> &str {
        &self.application
    }

    pub fn scoped_path(&self) -> &str {
        &self.scoped_path
    }

    fn domain(&self) -> &str {
        self.client.domain()
    }

    pub async fn set_external_exports(&self, aliases: BTreeMap<String, String>) {
        *self.external_exports.write().await = aliases;
    }

    async fn export_contexts(&self, instance: &Instance, those_that: ThoseThat) -> Vec<MessagingContext> {
        let aliases = self.external_exports.read().await;
        MessagingContext::for_exported_variables(
            self.domain(),
            &self.application,
            instance,
            &aliases,
            those_that,
        )
    }

    fn import_contexts(&self, instance: &Instance, those_that: ThoseThat) -> Vec<MessagingContext> {
        MessagingContext::for_imported_variables(
            self.domain(),
            &self.application,
            &instance.component,
            those_that,
        )
    }

    /// Publishes the exports of an instance to the importers of each of its
    /// prefixes. With `only_prefix`, publishes that prefix only.
    ///
    /// Internal contexts carry the variables under their own names; external
    /// contexts carry the aliased names.
    pub async fn publish_exports(&self, path: &str, instance: &Instance, only_prefix: Option<&str>) {
        let exported = instance.exported_variables();
        let aliased = {
            let aliases = self.external_exports.read().await;
            variables::apply_external_aliases(&exported, &aliases)
        };

        for context in self.export_contexts(instance, ThoseThat::Import).await {
            let Some(prefix) = context.subject() else {
                continue;
            };
            if only_prefix.is_some_and(|only| only != prefix) {
                continue;
            }

            let source = match context.kind() {
                RecipientKind::InterApp => &aliased,
                _ => &exported,
            };
            let vars = variables::filter_by_prefix(source, prefix);
            if vars.is_empty() {
                debug!(instance = %path, prefix, "Nothing resolved to export yet");
                continue;
            }

            let message = Message::AddImport {
                application: self.application.clone(),
                prefix: prefix.to_string(),
                exporter_path: path.to_string(),
                component_name: instance.component.name.clone(),
                exported_vars: vars,
            };
            self.client.publish(&context, message).await;
        }
    }

    /// Tells the importers of every exported prefix that the instance is
    /// gone.
    pub async fn unpublish_exports(&self, path: &str, instance: &Instance) {
        for context in self.export_contexts(instance, ThoseThat::Import).await {
            let Some(prefix) = context.subject() else {
                continue;
            };
            let message = Message::RemoveImport {
                application: self.application.clone(),
                prefix: prefix.to_string(),
                removed_path: path.to_string(),
            };
            self.client.publish(&context, message).await;
        }
    }

    /// Listens (or stops listening) to the exports of the prefixes the
    /// instance imports.
    pub async fn listen_to_exports_from_other_agents(&self, command: ListenerCommand, instance: &Instance) {
        for context in self.import_contexts(instance, ThoseThat::Import) {
            self.apply(command, &context).await;
        }
    }

    /// Asks the exporters of every imported prefix to publish their exports.
    pub async fn request_exports_from_other_agents(&self, path: &str, instance: &Instance) {
        for context in self.import_contexts(instance, ThoseThat::Export) {
            let Some(prefix) = context.subject() else {
                continue;
            };
            let message = Message::RequestImport {
                application: self.application.clone(),
                prefix: prefix.to_string(),
                requester_path: path.to_string(),
            };
            self.client.publish(&context, message).await;
        }
    }

    /// Listens (or stops listening) to export requests for the prefixes the
    /// instance exports.
    pub async fn listen_to_requests_from_other_agents(&self, command: ListenerCommand, instance: &Instance) {
        for context in self.export_contexts(instance, ThoseThat::Export).await {
            self.apply(command, &context).await;
        }
    }

    /// Listens (or stops listening) to the DM on this agent's topic.
    pub async fn listen_to_the_dm(&self, command: ListenerCommand) {
        let context = MessagingContext::for_agent(self.domain(), &self.application, &self.scoped_path);
        self.apply(command, &context).await;
    }

    pub async fn send_message_to_the_dm(&self, message: Message) {
        let context = MessagingContext::for_dm(self.domain(), &self.application);
        self.client.publish(&context, message).await;
    }

    async fn apply(&self, command: ListenerCommand, context: &MessagingContext) {
        match command {
            ListenerCommand::Start => self.client.subscribe(context).await,
            ListenerCommand::Stop => self.client.unsubscribe(context).await,
        }
    }
}
