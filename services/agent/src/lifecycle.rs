//! Local instance lifecycle.
//!
//! Runs the commands of the DM against the plugins and keeps the export/
//! import protocol going. Every local status change is reported to the DM.
//!
//! Starting an instance waits in `starting` until all its mandatory imports
//! are present; losing one of them sends a started instance back to
//! `starting`.

use std::collections::BTreeMap;
use std::sync::Arc;

use fleet_messages::Message;
use fleet_messaging::{AgentClient, ListenerCommand};
use fleet_model::{paths, variables, Instance, InstanceStatus};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::imports::{self, ReceivedExports};
use crate::model::LocalModel;
use crate::plugins::{PluginContext, PluginRegistry};
use crate::AgentError;

#[derive(Debug, Clone, Copy)]
enum Action {
    Deploy,
    Start,
    Update,
    Stop,
    Undeploy,
}

impl Action {
    fn as_str(self) -> &'static str {
        match self {
            Action::Deploy => "deploy",
            Action::Start => "start",
            Action::Update => "update",
            Action::Stop => "stop",
            Action::Undeploy => "undeploy",
        }
    }
}

pub struct AgentLifecycle {
    messaging: Arc<AgentClient>,
    plugins: PluginRegistry,
    ip_address: Option<String>,
    model: Mutex<Option<LocalModel>>,
}

impl AgentLifecycle {
    pub fn new(messaging: Arc<AgentClient>, plugins: PluginRegistry, ip_address: Option<String>) -> Self {
        Self {
            messaging,
            plugins,
            ip_address,
            model: Mutex::new(None),
        }
    }

    pub fn messaging(&self) -> &Arc<AgentClient> {
        &self.messaging
    }

    /// Copy of the current model, if the DM sent one.
    pub async fn snapshot(&self) -> Option<LocalModel> {
        self.model.lock().await.clone()
    }

    pub async fn instance_status(&self, path: &str) -> Option<InstanceStatus> {
        self.model
            .lock()
            .await
            .as_ref()
            .and_then(|model| model.find(path))
            .map(|instance| instance.status)
    }

    // ---------------------------------------------------------------------
    // DM commands
    // ---------------------------------------------------------------------

    /// Installs the model received from the DM and joins the export/import
    /// exchanges of every managed instance.
    #[instrument(skip(self, instance, external_exports))]
    pub async fn set_scoped_instance(
        &self,
        application: &str,
        scoped_path: &str,
        instance: Instance,
        external_exports: BTreeMap<String, String>,
    ) -> Result<(), AgentError> {
        if application != self.messaging.application() || scoped_path != self.messaging.scoped_path() {
            return Err(AgentError::WrongAgent {
                expected: format!("{}{}", self.messaging.application(), self.messaging.scoped_path()),
                got: format!("{application}{scoped_path}"),
            });
        }

        let mut guard = self.model.lock().await;
        if let Some(previous) = guard.take() {
            for (_, instance) in previous.instances() {
                self.listen(ListenerCommand::Stop, instance).await;
            }
        }

        let mut model = LocalModel::new(application, scoped_path, instance);
        if let Some(ip) = &self.ip_address {
            model.set_ip_address(ip);
        }
        self.messaging.set_external_exports(external_exports).await;

        for (_, instance) in model.instances() {
            self.listen(ListenerCommand::Start, instance).await;
        }
        self.messaging
            .publish_exports(scoped_path, model.root(), None)
            .await;
        for (path, instance) in model.instances() {
            self.messaging
                .request_exports_from_other_agents(&path, instance)
                .await;
        }

        info!(instances = model.instances().len(), "Model received");
        *guard = Some(model);
        Ok(())
    }

    /// Moves a local instance towards `new_status`.
    #[instrument(skip(self, resources))]
    pub async fn change_instance_state(
        &self,
        path: &str,
        new_status: InstanceStatus,
        resources: BTreeMap<String, String>,
    ) -> Result<(), AgentError> {
        let mut guard = self.model.lock().await;
        let model = guard.as_mut().ok_or(AgentError::NoModel)?;
        let instance = model.get(path)?;
        if instance.is_scoped() {
            warn!("Scoped instances are driven by their target, not by the agent");
            return Ok(());
        }

        use InstanceStatus::*;
        match (instance.status, new_status) {
            (from, to) if from == to => {
                debug!(status = %to, "Already there");
                Ok(())
            }
            (Starting, DeployedStarted) => {
                debug!("Still waiting for imports");
                Ok(())
            }
            (NotDeployed, DeployedStopped) => self.deploy(model, path, &resources).await,
            (NotDeployed, DeployedStarted) => {
                self.deploy(model, path, &resources).await?;
                self.start(model, path).await
            }
            (DeployedStopped, DeployedStarted) => self.start(model, path).await,
            (DeployedStarted | Starting, DeployedStopped) => self.stop_subtree(model, path).await,
            (_, NotDeployed) => self.undeploy_subtree(model, path).await,
            (from, to) => Err(AgentError::InvalidTransition {
                path: path.to_string(),
                from,
                to,
            }),
        }
    }

    /// Inserts an instance the DM added below one of ours.
    pub async fn add_instance(&self, parent_path: &str, instance: Instance) -> Result<(), AgentError> {
        let mut guard = self.model.lock().await;
        let model = guard.as_mut().ok_or(AgentError::NoModel)?;
        let path = model.insert(parent_path, instance)?;

        let mut added = Vec::new();
        if let Some(instance) = model.find(&path) {
            instance.walk(&path, &mut added);
        }
        for (_, instance) in added {
            self.listen(ListenerCommand::Start, instance).await;
        }
        info!(instance = %path, "Instance added");
        Ok(())
    }

    /// Removes a `not_deployed` subtree and tells the DM.
    pub async fn remove_instance(&self, path: &str) -> Result<(), AgentError> {
        let mut guard = self.model.lock().await;
        let model = guard.as_mut().ok_or(AgentError::NoModel)?;
        let removed = model.remove(path)?;

        let mut gone = Vec::new();
        removed.walk(path, &mut gone);
        for (_, instance) in gone {
            self.listen(ListenerCommand::Stop, instance).await;
        }
        // Contexts shared with the remaining instances.
        for (_, instance) in model.instances() {
            self.listen(ListenerCommand::Start, instance).await;
        }

        self.messaging
            .send_message_to_the_dm(Message::InstanceRemoved {
                application: model.application().to_string(),
                instance_path: path.to_string(),
            })
            .await;
        info!(instance = %path, "Instance removed");
        Ok(())
    }

    /// Reports the state of every managed instance below the scoped one.
    pub async fn send_instances(&self) -> Result<(), AgentError> {
        let guard = self.model.lock().await;
        let model = guard.as_ref().ok_or(AgentError::NoModel)?;
        for (path, instance) in model.instances().into_iter().skip(1) {
            self.report(model.application(), &path, instance).await;
        }
        Ok(())
    }

    /// Publishes the exports of every started instance again.
    pub async fn resynchronize(&self) -> Result<(), AgentError> {
        let guard = self.model.lock().await;
        let model = guard.as_ref().ok_or(AgentError::NoModel)?;
        for (path, instance) in model.instances() {
            if instance.status == InstanceStatus::DeployedStarted {
                self.messaging.publish_exports(&path, instance, None).await;
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Messages from other agents
    // ---------------------------------------------------------------------

    pub async fn add_import(&self, received: ReceivedExports) -> Result<(), AgentError> {
        let mut guard = self.model.lock().await;
        let model = guard.as_mut().ok_or(AgentError::NoModel)?;
        let changed = imports::add_import(model, &received);
        if !changed.is_empty() {
            debug!(
                prefix = %received.prefix,
                exporter = %received.exporter_path,
                importers = changed.len(),
                "Imports added"
            );
        }
        self.imports_changed(model, changed).await;
        Ok(())
    }

    pub async fn remove_import(&self, application: &str, prefix: &str, removed_path: &str) -> Result<(), AgentError> {
        let mut guard = self.model.lock().await;
        let model = guard.as_mut().ok_or(AgentError::NoModel)?;
        let changed = imports::remove_import(model, application, prefix, removed_path);
        self.imports_changed(model, changed).await;
        Ok(())
    }

    /// Answers an export request with the exports of the started instances.
    ///
    /// Requests sent by this agent are ignored: local importers are served
    /// directly.
    pub async fn answer_request(&self, application: &str, prefix: &str, requester_path: &str) -> Result<(), AgentError> {
        let guard = self.model.lock().await;
        let model = guard.as_ref().ok_or(AgentError::NoModel)?;
        if application == model.application() && paths::is_within(requester_path, model.scoped_path()) {
            debug!(prefix, requester = %requester_path, "Ignoring own export request");
            return Ok(());
        }

        for (path, instance) in model.instances() {
            if instance.status == InstanceStatus::DeployedStarted {
                self.messaging
                    .publish_exports(&path, instance, Some(prefix))
                    .await;
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Transitions
    // ---------------------------------------------------------------------

    async fn deploy(
        &self,
        model: &mut LocalModel,
        path: &str,
        resources: &BTreeMap<String, String>,
    ) -> Result<(), AgentError> {
        let parent_status = model.parent_status(path).unwrap_or(InstanceStatus::NotDeployed);
        if !matches!(
            parent_status,
            InstanceStatus::DeployedStopped | InstanceStatus::DeployedStarted | InstanceStatus::Starting
        ) {
            return Err(AgentError::ParentNotReady {
                path: path.to_string(),
                parent_status,
            });
        }

        self.transition(model, path, InstanceStatus::Deploying).await?;
        if let Err(e) = self.run_plugin(model, path, Action::Deploy, resources).await {
            self.transition(model, path, InstanceStatus::NotDeployed).await?;
            return Err(e);
        }
        self.transition(model, path, InstanceStatus::DeployedStopped).await?;

        let instance = model.get(path)?.clone();
        self.messaging
            .request_exports_from_other_agents(path, &instance)
            .await;
        self.import_local_exports(model, path).await;
        Ok(())
    }

    async fn start(&self, model: &mut LocalModel, path: &str) -> Result<(), AgentError> {
        let parent_status = model.parent_status(path).unwrap_or(InstanceStatus::NotDeployed);
        if parent_status != InstanceStatus::DeployedStarted {
            return Err(AgentError::ParentNotReady {
                path: path.to_string(),
                parent_status,
            });
        }

        self.transition(model, path, InstanceStatus::Starting).await?;
        if !variables::all_mandatory_imports_resolved(model.get(path)?) {
            info!(instance = %path, "Waiting for imports before starting");
            return Ok(());
        }
        self.start_now(model, path).await
    }

    async fn start_now(&self, model: &mut LocalModel, path: &str) -> Result<(), AgentError> {
        if let Err(e) = self.run_plugin(model, path, Action::Start, &BTreeMap::new()).await {
            self.transition(model, path, InstanceStatus::DeployedStopped).await?;
            return Err(e);
        }
        self.transition(model, path, InstanceStatus::DeployedStarted).await?;
        let instance = model.get(path)?.clone();
        self.messaging.publish_exports(path, &instance, None).await;
        Ok(())
    }

    async fn stop_one(&self, model: &mut LocalModel, path: &str) -> Result<(), AgentError> {
        let instance = model.get(path)?.clone();
        match instance.status {
            InstanceStatus::DeployedStarted => {
                self.transition(model, path, InstanceStatus::Stopping).await?;
                self.messaging.unpublish_exports(path, &instance).await;
                if let Err(e) = self.run_plugin(model, path, Action::Stop, &BTreeMap::new()).await {
                    self.transition(model, path, InstanceStatus::DeployedStarted).await?;
                    self.messaging.publish_exports(path, &instance, None).await;
                    return Err(e);
                }
                self.transition(model, path, InstanceStatus::DeployedStopped).await
            }
            InstanceStatus::Starting => {
                self.transition(model, path, InstanceStatus::DeployedStopped).await
            }
            _ => Ok(()),
        }
    }

    /// Stops an instance and everything started below it, children first.
    async fn stop_subtree(&self, model: &mut LocalModel, path: &str) -> Result<(), AgentError> {
        for p in model.subtree_deepest_first(path) {
            self.stop_one(model, &p).await?;
        }
        Ok(())
    }

    /// Undeploys an instance and everything below it, children first.
    async fn undeploy_subtree(&self, model: &mut LocalModel, path: &str) -> Result<(), AgentError> {
        for p in model.subtree_deepest_first(path) {
            if model.get(&p)?.status == InstanceStatus::NotDeployed {
                continue;
            }
            self.stop_one(model, &p).await?;

            self.transition(model, &p, InstanceStatus::Undeploying).await?;
            if let Err(e) = self.run_plugin(model, &p, Action::Undeploy, &BTreeMap::new()).await {
                self.transition(model, &p, InstanceStatus::DeployedStopped).await?;
                return Err(e);
            }
            self.transition(model, &p, InstanceStatus::NotDeployed).await?;
        }
        Ok(())
    }

    /// Starts the waiting importers that got what they needed, demotes the
    /// started ones that lost a mandatory import and lets the others'
    /// plugins know.
    async fn imports_changed(&self, model: &mut LocalModel, changed: Vec<String>) {
        for path in changed {
            let Some(instance) = model.find(&path) else {
                continue;
            };
            let resolved = variables::all_mandatory_imports_resolved(instance);
            let status = instance.status;

            let result = match status {
                InstanceStatus::Starting
                    if resolved && model.parent_status(&path) == Some(InstanceStatus::DeployedStarted) =>
                {
                    self.start_now(model, &path).await
                }
                InstanceStatus::DeployedStarted if !resolved => self.demote(model, &path).await,
                InstanceStatus::DeployedStarted => {
                    match self.run_plugin(model, &path, Action::Update, &BTreeMap::new()).await {
                        Ok(()) => self.transition(model, &path, status).await,
                        Err(e) => Err(e),
                    }
                }
                _ => {
                    self.report(model.application(), &path, instance).await;
                    Ok(())
                }
            };

            if let Err(e) = result {
                warn!(instance = %path, error = %e, "Import change not applied");
            }
        }
    }

    /// A started instance lost a mandatory import: back to `starting`.
    async fn demote(&self, model: &mut LocalModel, path: &str) -> Result<(), AgentError> {
        let instance = model.get(path)?.clone();
        info!(instance = %path, "Mandatory import lost, waiting again");
        self.messaging.unpublish_exports(path, &instance).await;
        if let Err(e) = self.run_plugin(model, path, Action::Stop, &BTreeMap::new()).await {
            warn!(instance = %path, error = %e, "Stop failed while demoting");
        }
        self.transition(model, path, InstanceStatus::Starting).await
    }

    /// Feeds a freshly deployed instance with the exports of the started
    /// instances of this agent.
    async fn import_local_exports(&self, model: &mut LocalModel, path: &str) {
        let Some(importer) = model.find(path) else {
            return;
        };
        let wanted = variables::imported_prefixes(&importer.component);

        let received: Vec<ReceivedExports> = model
            .instances()
            .into_iter()
            .filter(|(p, i)| p != path && i.status == InstanceStatus::DeployedStarted)
            .flat_map(|(p, exporter)| {
                let exported = exporter.exported_variables();
                let application = model.application().to_string();
                variables::exported_prefixes(&exporter.component)
                    .into_iter()
                    .filter(|prefix| wanted.contains(prefix))
                    .map(move |prefix| ReceivedExports {
                        application: application.clone(),
                        exported_vars: variables::filter_by_prefix(&exported, &prefix),
                        prefix,
                        exporter_path: p.clone(),
                        component_name: exporter.component.name.clone(),
                    })
                    .collect::<Vec<_>>()
            })
            .filter(|r| !r.exported_vars.is_empty())
            .collect();

        for exports in received {
            let changed = imports::add_import(model, &exports);
            self.imports_changed(model, changed).await;
        }
    }

    // ---------------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------------

    async fn run_plugin(
        &self,
        model: &LocalModel,
        path: &str,
        action: Action,
        resources: &BTreeMap<String, String>,
    ) -> Result<(), AgentError> {
        let instance = model.get(path)?;
        let plugin = self.plugins.resolve(&instance.component.installer);
        let ctx = PluginContext {
            application: model.application(),
            path,
            instance,
        };
        let result = match action {
            Action::Deploy => plugin.deploy(ctx, resources).await,
            Action::Start => plugin.start(ctx).await,
            Action::Update => plugin.update(ctx).await,
            Action::Stop => plugin.stop(ctx).await,
            Action::Undeploy => plugin.undeploy(ctx).await,
        };
        result.map_err(|e| AgentError::Plugin {
            plugin: plugin.name().to_string(),
            action: action.as_str(),
            path: path.to_string(),
            message: format!("{e:#}"),
        })
    }

    /// Sets a status and reports it. `not_deployed` clears the imports.
    async fn transition(&self, model: &mut LocalModel, path: &str, status: InstanceStatus) -> Result<(), AgentError> {
        let instance = model.get_mut(path)?;
        instance.set_status(status);
        if status == InstanceStatus::NotDeployed {
            instance.imports.clear();
        }
        let model = &*model;
        self.report(model.application(), path, model.get(path)?).await;
        Ok(())
    }

    async fn report(&self, application: &str, path: &str, instance: &Instance) {
        self.messaging
            .send_message_to_the_dm(Message::InstanceChanged {
                application: application.to_string(),
                instance_path: path.to_string(),
                new_status: instance.status,
                imports: instance.imports.clone(),
            })
            .await;
    }

    async fn listen(&self, command: ListenerCommand, instance: &Instance) {
        self.messaging
            .listen_to_exports_from_other_agents(command, instance)
            .await;
        self.messaging
            .listen_to_requests_from_other_agents(command, instance)
            .await;
    }
}
