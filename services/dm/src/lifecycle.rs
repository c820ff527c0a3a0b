//! Instance lifecycle manager.
//!
//! Drives instance state transitions. Scoped instances are provisioned
//! through a target handler; other instances change state by command to
//! their agent and only move once the agent acknowledges.
//!
//! Messages for an agent go through the awaiting-message store and leave
//! only while its scoped instance is `deployed_started`, that is once a
//! heartbeat confirmed the agent is reachable.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fleet_messages::Message;
use fleet_messaging::{DmClient, ListenerCommand};
use fleet_model::{data, paths, Application, Import, Instance, InstanceStatus};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::configurator::{PendingConfiguration, TargetConfigurator};
use crate::liveness::{HeartbeatOutcome, LivenessTracker};
use crate::managed::ManagedApplication;
use crate::notifications::{AutonomicEvent, Notifier};
use crate::resources::ResourceStore;
use crate::targets::{Configuration, TargetContext, TargetError, TargetResolver};
use crate::{Config, DmError};

/// Runtime data cleared when a machine goes away.
const MACHINE_DATA: [&str; 3] = [data::MACHINE_ID, data::TARGET_ACQUIRED, data::IP_ADDRESS];

type LockKey = (String, String);

pub struct InstancesManager {
    applications: RwLock<HashMap<String, Arc<ManagedApplication>>>,
    messaging: DmClient,
    targets: TargetResolver,
    configurator: TargetConfigurator,
    liveness: LivenessTracker,
    notifier: Notifier,
    resources: ResourceStore,

    /// Per scoped instance locks guarding the target-acquired marker.
    acquisition_locks: Mutex<HashMap<LockKey, Arc<Mutex<()>>>>,

    /// Source of target-acquired marker values, one per deployment attempt.
    deployments: AtomicU64,

    /// Handed to target handlers so agents can join the bus.
    messaging_settings: BTreeMap<String, String>,
}

impl InstancesManager {
    pub fn new(messaging: DmClient, targets: TargetResolver, config: &Config) -> Self {
        let messaging_settings = BTreeMap::from([
            ("domain".to_string(), config.domain.clone()),
            ("transport".to_string(), config.transport.clone()),
        ]);
        Self {
            applications: RwLock::new(HashMap::new()),
            messaging,
            targets,
            configurator: TargetConfigurator::new(),
            liveness: LivenessTracker::new(config.heartbeat_miss_threshold),
            notifier: Notifier::default(),
            resources: ResourceStore::new(config.resources_dir.clone()),
            acquisition_locks: Mutex::new(HashMap::new()),
            deployments: AtomicU64::new(1),
            messaging_settings,
        }
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn liveness(&self) -> &LivenessTracker {
        &self.liveness
    }

    pub fn configurator(&self) -> &TargetConfigurator {
        &self.configurator
    }

    // ---------------------------------------------------------------------
    // Applications
    // ---------------------------------------------------------------------

    /// Starts managing an application and listening to its agents.
    pub async fn add_application(&self, application: Application) -> Result<Arc<ManagedApplication>, DmError> {
        let name = application.name.clone();
        let managed = {
            let mut applications = self.applications.write().await;
            if applications.contains_key(&name) {
                return Err(DmError::InvalidArgument(format!(
                    "application {name} is already managed"
                )));
            }
            let managed = Arc::new(ManagedApplication::new(application));
            applications.insert(name.clone(), Arc::clone(&managed));
            managed
        };

        self.messaging
            .listen_to_agent_messages(&name, ListenerCommand::Start)
            .await;
        info!(application = %name, "Application managed");
        Ok(managed)
    }

    /// Stops managing an application. Every instance must be
    /// `not_deployed`; queued messages are dropped.
    pub async fn remove_application(&self, name: &str) -> Result<(), DmError> {
        let app = self.application(name).await?;
        {
            let model = app.model().read().await;
            if let Some((path, instance)) = model
                .all_instances()
                .into_iter()
                .find(|(_, i)| i.status != InstanceStatus::NotDeployed)
            {
                return Err(DmError::InvalidArgument(format!(
                    "{path} of application {name} is still {}",
                    instance.status
                )));
            }
        }

        self.applications.write().await.remove(name);
        self.acquisition_locks
            .lock()
            .await
            .retain(|(application, _), _| application != name);
        self.messaging
            .listen_to_agent_messages(name, ListenerCommand::Stop)
            .await;
        app.clear_awaiting_messages().await;
        self.liveness.forget_application(name).await;
        self.configurator.cancel_application(name).await;
        info!(application = %name, "Application removed");
        Ok(())
    }

    pub async fn application(&self, name: &str) -> Result<Arc<ManagedApplication>, DmError> {
        self.applications
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| DmError::InvalidArgument(format!("unknown application {name}")))
    }

    pub async fn applications(&self) -> Vec<Arc<ManagedApplication>> {
        self.applications.read().await.values().cloned().collect()
    }

    pub async fn instance_status(&self, application: &str, path: &str) -> Result<InstanceStatus, DmError> {
        let app = self.application(application).await?;
        let model = app.model().read().await;
        Ok(model.get(path)?.status)
    }

    /// Inserts an instance into the model and, when its machine is up,
    /// tells the agent.
    pub async fn add_instance(
        &self,
        application: &str,
        parent_path: Option<&str>,
        instance: Instance,
    ) -> Result<String, DmError> {
        let app = self.application(application).await?;
        let (path, notify_agent) = {
            let mut model = app.model().write().await;
            let path = model.insert_instance(parent_path, instance.clone())?;
            let notify_agent = parent_path
                .and_then(|parent| model.scoped_path_of(parent).ok().map(|s| (s, parent)))
                .filter(|(scoped, _)| {
                    model
                        .find(scoped)
                        .is_some_and(|i| i.status != InstanceStatus::NotDeployed)
                })
                .map(|(scoped, parent)| (scoped, parent.to_string()));
            (path, notify_agent)
        };

        if let Some((scoped_path, parent_path)) = notify_agent {
            let message = Message::AddInstance {
                parent_path,
                instance,
            };
            self.send_message_safely(&app, &scoped_path, message).await;
        }
        info!(application, instance = %path, "Instance added");
        Ok(path)
    }

    /// Removes an instance whose whole subtree is `not_deployed`.
    pub async fn remove_instance(&self, application: &str, path: &str) -> Result<(), DmError> {
        let app = self.application(application).await?;
        let notify_agent = {
            let mut model = app.model().write().await;
            let scoped_path = match paths::parent_path(path) {
                Some(parent) if !model.get(path)?.is_scoped() => model.scoped_path_of(parent).ok(),
                _ => None,
            };
            model.remove_instance(path)?;
            self.acquisition_locks
                .lock()
                .await
                .retain(|(app_name, locked), _| app_name != application || !paths::is_within(locked, path));
            scoped_path.filter(|scoped| {
                model
                    .find(scoped)
                    .is_some_and(|i| i.status != InstanceStatus::NotDeployed)
            })
        };

        if let Some(scoped_path) = notify_agent {
            let message = Message::RemoveInstance {
                instance_path: path.to_string(),
            };
            self.send_message_safely(&app, &scoped_path, message).await;
        }
        info!(application, instance = %path, "Instance removed");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // State changes
    // ---------------------------------------------------------------------

    /// Requests a new status for an instance.
    ///
    /// For scoped instances `not_deployed -> deployed_started` provisions the
    /// machine and `{deployed_started, deploying, starting, problem} ->
    /// not_deployed` terminates it; other transitions are ignored. Other
    /// instances get a change-state command sent to their agent.
    #[instrument(skip(self, application, path), fields(application = %application, instance = %path))]
    pub async fn change_instance_state(
        &self,
        application: &str,
        path: &str,
        new_status: InstanceStatus,
    ) -> Result<(), DmError> {
        let app = self.application(application).await?;
        let (current, scoped, component, scoped_path) = {
            let model = app.model().read().await;
            let instance = model.get(path)?;
            let scoped_path = model.scoped_path_of(path)?;
            (
                instance.status,
                instance.is_scoped(),
                instance.component.name.clone(),
                scoped_path,
            )
        };

        if scoped {
            return match (current, new_status) {
                (InstanceStatus::NotDeployed, InstanceStatus::DeployedStarted) => {
                    self.deploy_target(&app, path).await
                }
                (from, InstanceStatus::NotDeployed) if from.allows_target_undeploy() => {
                    self.undeploy_target(&app, path).await
                }
                (from, to) => {
                    info!(from = %from, to = %to, "Transition ignored for a scoped instance");
                    Ok(())
                }
            };
        }

        if !new_status.is_stable() || new_status == InstanceStatus::Problem {
            return Err(DmError::InvalidArgument(format!(
                "{new_status} cannot be requested for {path}"
            )));
        }

        let needs_files = current == InstanceStatus::NotDeployed
            && matches!(
                new_status,
                InstanceStatus::DeployedStopped | InstanceStatus::DeployedStarted
            );
        let resources = if needs_files {
            self.resources.bundle(&component).await?
        } else {
            BTreeMap::new()
        };

        let message = Message::ChangeInstanceState {
            instance_path: path.to_string(),
            new_status,
            resources,
        };
        self.send_message_safely(&app, &scoped_path, message).await;
        Ok(())
    }

    async fn acquisition_lock(&self, application: &str, path: &str) -> Arc<Mutex<()>> {
        let mut locks = self.acquisition_locks.lock().await;
        Arc::clone(
            locks
                .entry((application.to_string(), path.to_string()))
                .or_default(),
        )
    }

    /// Target properties merged with the scoped instance data.
    async fn target_context(&self, app: &ManagedApplication, path: &str, instance: &Instance) -> TargetContext {
        let mut properties = app.target_properties(path).await;
        properties.extend(instance.data.iter().map(|(k, v)| (k.clone(), v.clone())));
        TargetContext {
            application: app.name().to_string(),
            scoped_path: path.to_string(),
            properties,
            messaging: self.messaging_settings.clone(),
        }
    }

    async fn deploy_target(&self, app: &ManagedApplication, path: &str) -> Result<(), DmError> {
        let attempt = self.deployments.fetch_add(1, Ordering::Relaxed).to_string();
        let (snapshot, external_exports) = {
            let lock = self.acquisition_lock(app.name(), path).await;
            let _acquired = lock.lock().await;
            let mut model = app.model().write().await;
            let external_exports = model.external_exports.clone();
            let instance = model.get_mut(path)?;

            if instance.data.contains_key(data::TARGET_ACQUIRED) {
                debug!("Target already acquired, dropping duplicate request");
                return Ok(());
            }
            if instance.machine_id().is_some() {
                debug!("Machine already recorded");
                return Ok(());
            }

            instance
                .data
                .insert(data::TARGET_ACQUIRED.to_string(), attempt.clone());
            instance.set_status(InstanceStatus::Deploying);
            (instance.clone(), external_exports)
        };
        self.notifier
            .instance_changed(app.name(), path, InstanceStatus::Deploying);

        match self.provision(app, path, &attempt, &snapshot, external_exports).await {
            Ok(()) => Ok(()),
            Err(source) => {
                warn!(error = %source, "Provisioning failed, rolling back");
                self.roll_back_deployment(app, path, &attempt).await;
                Err(DmError::Provisioning {
                    path: path.to_string(),
                    source,
                })
            }
        }
    }

    async fn provision(
        &self,
        app: &ManagedApplication,
        path: &str,
        attempt: &str,
        snapshot: &Instance,
        external_exports: BTreeMap<String, String>,
    ) -> Result<(), TargetError> {
        let ctx = self.target_context(app, path, snapshot).await;
        let handler = self.targets.resolve(&ctx.properties)?;
        let machine_id = handler.create_machine(&ctx).await?;

        // An undeploy may have run while the machine was being created.
        let recorded = {
            let lock = self.acquisition_lock(app.name(), path).await;
            let _acquired = lock.lock().await;
            let mut model = app.model().write().await;
            match model.find_mut(path) {
                Some(instance) if holds_attempt(instance, attempt) => {
                    instance
                        .data
                        .insert(data::MACHINE_ID.to_string(), machine_id.clone());
                    true
                }
                _ => false,
            }
        };
        if !recorded {
            info!(machine_id = %machine_id, "Deployment cancelled during machine creation, terminating the machine");
            if let Err(e) = handler.terminate_machine(&ctx.properties, &machine_id).await {
                warn!(machine_id = %machine_id, error = %e, "Failed to terminate orphaned machine");
            }
            return Ok(());
        }

        // Delivered with the first heartbeat of the new agent.
        let message = Message::SetScopedInstance {
            application: app.name().to_string(),
            scoped_path: path.to_string(),
            scoped_instance: snapshot.clone(),
            external_exports,
        };
        self.send_message_safely(app, path, message).await;

        match handler.configure_machine(&ctx, &machine_id).await {
            Ok(Configuration::Done) => {
                info!(machine_id = %machine_id, "Machine created and configured");
            }
            Ok(Configuration::Pending) => {
                debug!(machine_id = %machine_id, "Machine configuration pending");
                self.configurator
                    .submit(PendingConfiguration {
                        machine_id,
                        context: ctx,
                        handler,
                    })
                    .await;
            }
            Err(e) => {
                if let Err(terminate) = handler.terminate_machine(&ctx.properties, &machine_id).await {
                    warn!(machine_id = %machine_id, error = %terminate, "Failed to terminate unconfigured machine");
                }
                return Err(e);
            }
        }
        Ok(())
    }

    async fn roll_back_deployment(&self, app: &ManagedApplication, path: &str, attempt: &str) {
        match app.model().write().await.find_mut(path) {
            Some(instance) if holds_attempt(instance, attempt) => {
                for key in MACHINE_DATA {
                    instance.data.remove(key);
                }
                instance.set_status(InstanceStatus::NotDeployed);
            }
            _ => {
                debug!("Deployment already undone");
                return;
            }
        }
        app.remove_awaiting_messages(path).await;
        self.notifier
            .instance_changed(app.name(), path, InstanceStatus::NotDeployed);
    }

    async fn undeploy_target(&self, app: &ManagedApplication, path: &str) -> Result<(), DmError> {
        let (snapshot, external_exports) = {
            let mut model = app.model().write().await;
            let external_exports = model.external_exports.clone();
            let instance = model.get_mut(path)?;
            let snapshot = instance.clone();
            instance.set_status(InstanceStatus::Undeploying);
            (snapshot, external_exports)
        };
        self.notifier
            .instance_changed(app.name(), path, InstanceStatus::Undeploying);

        if let Some(machine_id) = snapshot.machine_id() {
            let ctx = self.target_context(app, path, &snapshot).await;
            let terminated = match self.targets.resolve(&ctx.properties) {
                Ok(handler) => handler.terminate_machine(&ctx.properties, machine_id).await,
                Err(e) => Err(e),
            };
            if let Err(source) = terminated {
                warn!(error = %source, "Termination failed, restoring previous status");
                if let Some(instance) = app.model().write().await.find_mut(path) {
                    instance.status = snapshot.status;
                    if let Some(since) = snapshot.data.get(data::RUNNING_FROM) {
                        instance
                            .data
                            .insert(data::RUNNING_FROM.to_string(), since.clone());
                    }
                }
                self.notifier
                    .instance_changed(app.name(), path, snapshot.status);
                return Err(DmError::Provisioning {
                    path: path.to_string(),
                    source,
                });
            }
        }

        self.messaging
            .propagate_agent_termination(app.name(), &external_exports, path, &snapshot)
            .await;

        {
            let mut model = app.model().write().await;
            let instance = model.get_mut(path)?;
            for key in MACHINE_DATA {
                instance.data.remove(key);
            }
            instance.reset_subtree();
        }
        app.remove_awaiting_messages(path).await;
        self.liveness.forget(app.name(), path).await;
        self.configurator.cancel(app.name(), path).await;

        let mut previous = Vec::new();
        snapshot.walk(path, &mut previous);
        for (changed, _) in previous
            .into_iter()
            .filter(|(p, i)| p == path || i.status != InstanceStatus::NotDeployed)
        {
            self.notifier
                .instance_changed(app.name(), &changed, InstanceStatus::NotDeployed);
        }
        info!("Target undeployed");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Bulk operations
    // ---------------------------------------------------------------------

    /// Paths of the subtree at `path` (or of every root), pre-order.
    async fn selection(&self, app: &ManagedApplication, path: Option<&str>) -> Result<Vec<(String, Instance)>, DmError> {
        let model = app.model().read().await;
        let mut visited = Vec::new();
        match path {
            Some(path) => model.get(path)?.walk(path, &mut visited),
            None => {
                for root in &model.root_instances {
                    root.walk(&paths::child_path(None, &root.name), &mut visited);
                }
            }
        }
        Ok(visited
            .into_iter()
            .map(|(p, i)| (p, i.clone()))
            .collect())
    }

    async fn run_bulk(
        &self,
        application: &str,
        operations: Vec<(String, InstanceStatus)>,
    ) -> Result<(), DmError> {
        let total = operations.len();
        let mut failed = 0;
        for (path, status) in operations {
            if let Err(e) = self.change_instance_state(application, &path, status).await {
                warn!(application, instance = %path, error = %e, "Bulk operation member failed");
                failed += 1;
            }
        }

        if failed > 0 {
            return Err(DmError::Aggregate { failed, total });
        }
        Ok(())
    }

    /// Deploys and starts every instance of the subtree, parents first.
    pub async fn deploy_and_start_all(&self, application: &str, path: Option<&str>) -> Result<(), DmError> {
        let app = self.application(application).await?;
        let operations = self
            .selection(&app, path)
            .await?
            .into_iter()
            .map(|(p, _)| (p, InstanceStatus::DeployedStarted))
            .collect();
        self.run_bulk(application, operations).await
    }

    /// Stops every non-scoped instance of the subtree, children first.
    pub async fn stop_all(&self, application: &str, path: Option<&str>) -> Result<(), DmError> {
        let app = self.application(application).await?;
        let mut selection = self.selection(&app, path).await?;
        selection.retain(|(_, i)| !i.is_scoped() && i.status != InstanceStatus::NotDeployed);
        let operations = deepest_first(selection)
            .into_iter()
            .map(|p| (p, InstanceStatus::DeployedStopped))
            .collect();
        self.run_bulk(application, operations).await
    }

    /// Undeploys every instance of the subtree, children first. Instances
    /// whose machine is terminated by the same call are left to the
    /// machine termination.
    pub async fn undeploy_all(&self, application: &str, path: Option<&str>) -> Result<(), DmError> {
        let app = self.application(application).await?;
        let selection = self.selection(&app, path).await?;
        let terminated: Vec<String> = selection
            .iter()
            .filter(|(_, i)| i.is_scoped() && i.status.allows_target_undeploy())
            .map(|(p, _)| p.clone())
            .collect();

        let mut kept = Vec::new();
        for (p, instance) in selection {
            if instance.status == InstanceStatus::NotDeployed {
                continue;
            }
            let covered = !instance.is_scoped()
                && terminated.iter().any(|scoped| paths::is_within(&p, scoped));
            if !covered {
                kept.push((p, instance));
            }
        }

        let operations = deepest_first(kept)
            .into_iter()
            .map(|p| (p, InstanceStatus::NotDeployed))
            .collect();
        self.run_bulk(application, operations).await
    }

    // ---------------------------------------------------------------------
    // Messages to agents
    // ---------------------------------------------------------------------

    /// Queues a message for the agent of `scoped_path` and sends the queue if
    /// the agent is known to be reachable.
    pub async fn send_message_safely(&self, app: &ManagedApplication, scoped_path: &str, message: Message) {
        app.store_awaiting_message(scoped_path, message).await;
        self.flush_awaiting_messages(app, scoped_path).await;
    }

    /// Sends the queued messages of a scoped instance while it is
    /// `deployed_started`. Returns how many were sent.
    pub async fn flush_awaiting_messages(&self, app: &ManagedApplication, scoped_path: &str) -> usize {
        let _delivery = app.delivery_lock().lock().await;
        let started = app
            .model()
            .read()
            .await
            .find(scoped_path)
            .is_some_and(|i| i.status == InstanceStatus::DeployedStarted);
        if !started {
            return 0;
        }

        let messages = app.remove_awaiting_messages(scoped_path).await;
        let count = messages.len();
        for message in messages {
            self.messaging
                .send_message_to_agent(app.name(), scoped_path, message)
                .await;
        }
        if count > 0 {
            debug!(application = %app.name(), scoped = %scoped_path, count, "Awaiting messages sent");
        }
        count
    }

    /// Flushes the queues of every application.
    #[instrument(skip(self))]
    pub async fn flush_all_awaiting_messages(&self) -> usize {
        let mut sent = 0;
        for app in self.applications().await {
            for scoped_path in app.paths_with_awaiting_messages().await {
                sent += self.flush_awaiting_messages(&app, &scoped_path).await;
            }
        }
        sent
    }

    // ---------------------------------------------------------------------
    // Periodic tasks
    // ---------------------------------------------------------------------

    /// Runs one heartbeat check over every application.
    #[instrument(skip(self))]
    pub async fn check_heartbeats(&self) -> usize {
        let mut flipped = 0;
        for app in self.applications().await {
            flipped += self.liveness.check(&app, &self.notifier).await.len();
        }
        flipped
    }

    /// Polls the pending machine configurations once.
    #[instrument(skip(self))]
    pub async fn poll_configurations(&self) {
        for pending in self.configurator.take_all().await {
            let ctx = &pending.context;
            let Ok(app) = self.application(&ctx.application).await else {
                continue;
            };
            let still_current = app
                .model()
                .read()
                .await
                .find(&ctx.scoped_path)
                .and_then(Instance::machine_id)
                == Some(pending.machine_id.as_str());
            if !still_current {
                continue;
            }

            match pending.handler.configure_machine(ctx, &pending.machine_id).await {
                Ok(Configuration::Done) => {
                    info!(
                        application = %ctx.application,
                        scoped = %ctx.scoped_path,
                        machine_id = %pending.machine_id,
                        "Machine configured"
                    );
                }
                Ok(Configuration::Pending) => self.configurator.submit(pending).await,
                Err(e) => {
                    warn!(
                        application = %ctx.application,
                        scoped = %ctx.scoped_path,
                        error = %e,
                        "Machine configuration failed"
                    );
                    self.mark_problem(&app, &ctx.scoped_path).await;
                }
            }
        }
    }

    /// Reconciles the model with the machines after a DM restart.
    ///
    /// Running machines get their marker back and are asked to resend their
    /// instance states; machines that are gone have their subtree reset.
    #[instrument(skip(self))]
    pub async fn restore_instances(&self, application: &str) -> Result<(), DmError> {
        let app = self.application(application).await?;
        let candidates: Vec<(String, Instance)> = {
            let model = app.model().read().await;
            model
                .all_instances()
                .into_iter()
                .filter(|(_, i)| i.is_scoped() && i.machine_id().is_some())
                .map(|(p, i)| (p, i.clone()))
                .collect()
        };

        let total = candidates.len();
        let mut failed = 0;
        for (path, snapshot) in candidates {
            let Some(machine_id) = snapshot.machine_id() else {
                continue;
            };
            let ctx = self.target_context(&app, &path, &snapshot).await;
            let running = match self.targets.resolve(&ctx.properties) {
                Ok(handler) => handler.is_machine_running(&ctx.properties, machine_id).await,
                Err(e) => Err(e),
            };

            match running {
                Ok(true) => {
                    let attempt = self.deployments.fetch_add(1, Ordering::Relaxed).to_string();
                    {
                        let lock = self.acquisition_lock(app.name(), &path).await;
                        let _acquired = lock.lock().await;
                        if let Some(instance) = app.model().write().await.find_mut(&path) {
                            instance
                                .data
                                .insert(data::TARGET_ACQUIRED.to_string(), attempt);
                        }
                    }
                    self.send_message_safely(&app, &path, Message::SendInstances)
                        .await;
                    info!(scoped = %path, machine_id, "Machine still running, resynchronizing");
                }
                Ok(false) => {
                    let mut changed = Vec::new();
                    if let Some(instance) = app.model().write().await.find_mut(&path) {
                        let mut visited = Vec::new();
                        instance.walk(&path, &mut visited);
                        changed = visited
                            .into_iter()
                            .filter(|(_, i)| i.status != InstanceStatus::NotDeployed)
                            .map(|(p, _)| p)
                            .collect();
                        for key in MACHINE_DATA {
                            instance.data.remove(key);
                        }
                        instance.reset_subtree();
                    }
                    for p in changed {
                        self.notifier
                            .instance_changed(app.name(), &p, InstanceStatus::NotDeployed);
                    }
                    info!(scoped = %path, machine_id, "Machine is gone, instances reset");
                }
                Err(e) => {
                    warn!(scoped = %path, error = %e, "Could not check machine");
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            return Err(DmError::Aggregate { failed, total });
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Agent messages
    // ---------------------------------------------------------------------

    /// An agent is alive: acknowledge it and release its queued messages.
    pub async fn handle_heartbeat(
        &self,
        application: &str,
        scoped_path: &str,
        ip_address: Option<String>,
    ) -> Result<(), DmError> {
        let app = self.application(application).await?;
        let outcome = self
            .liveness
            .acknowledge(&app, scoped_path, &self.notifier)
            .await?;
        if outcome == HeartbeatOutcome::Ignored {
            return Ok(());
        }

        if let Some(ip) = ip_address {
            if let Some(instance) = app.model().write().await.find_mut(scoped_path) {
                instance.data.insert(data::IP_ADDRESS.to_string(), ip);
            }
        }

        if let HeartbeatOutcome::Recovered {
            previous: InstanceStatus::Problem,
        } = outcome
        {
            app.store_awaiting_message(scoped_path, Message::SendInstances)
                .await;
        }

        self.flush_awaiting_messages(&app, scoped_path).await;
        Ok(())
    }

    /// An agent reports the new status of one of its instances.
    pub async fn handle_instance_changed(
        &self,
        application: &str,
        path: &str,
        new_status: InstanceStatus,
        imports: BTreeMap<String, Vec<Import>>,
    ) -> Result<(), DmError> {
        let app = self.application(application).await?;
        let previous = {
            let mut model = app.model().write().await;
            let instance = model.get_mut(path)?;
            if instance.is_scoped() {
                debug!(application, instance = %path, "Scoped instance status is owned by the DM");
                return Ok(());
            }
            let previous = instance.status;
            if previous != new_status {
                instance.set_status(new_status);
            }
            instance.imports = imports;
            previous
        };
        if previous != new_status {
            self.notifier.instance_changed(application, path, new_status);
        }
        Ok(())
    }

    /// An agent removed an instance.
    pub async fn handle_instance_removed(&self, application: &str, path: &str) -> Result<(), DmError> {
        let app = self.application(application).await?;
        let mut model = app.model().write().await;
        if model.find(path).is_none() {
            debug!(application, instance = %path, "Removal already applied");
            return Ok(());
        }
        model.detach(path)?;
        info!(application, instance = %path, "Instance removed by its agent");
        Ok(())
    }

    /// An agent announced its machine is going down.
    pub async fn handle_machine_down(&self, application: &str, scoped_path: &str) -> Result<(), DmError> {
        let app = self.application(application).await?;
        self.mark_problem(&app, scoped_path).await;
        Ok(())
    }

    pub fn handle_autonomic(&self, event: AutonomicEvent) {
        info!(
            application = %event.application,
            scoped = %event.scoped_path,
            event = %event.event_name,
            "Autonomic event"
        );
        self.notifier.autonomic(event);
    }

    async fn mark_problem(&self, app: &ManagedApplication, scoped_path: &str) {
        let changed = match app.model().write().await.find_mut(scoped_path) {
            Some(instance) if instance.status.expects_heartbeats() && instance.status != InstanceStatus::Problem => {
                instance.set_status(InstanceStatus::Problem);
                true
            }
            _ => false,
        };
        if changed {
            self.notifier
                .instance_changed(app.name(), scoped_path, InstanceStatus::Problem);
        }
    }
}

/// True while the target of `instance` is held by deployment `attempt`.
/// Undeploying clears the marker.
fn holds_attempt(instance: &Instance, attempt: &str) -> bool {
    instance.data.get(data::TARGET_ACQUIRED).map(String::as_str) == Some(attempt)
}

fn deepest_first(selection: Vec<(String, Instance)>) -> Vec<String> {
    let mut paths: Vec<String> = selection.into_iter().map(|(p, _)| p).collect();
    paths.sort_by_key(|p| std::cmp::Reverse(p.matches('/').count()));
    paths
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_messaging::{FactoryRegistry, ReconfigurableClient, TransportConfig};
    use fleet_model::Component;

    use crate::targets::{InMemoryTargetHandler, IN_MEMORY_TARGET};

    fn manager() -> InstancesManager {
        let client = ReconfigurableClient::new(
            "dm",
            TransportConfig::new("test"),
            Arc::new(FactoryRegistry::new()),
        );
        let targets = TargetResolver::new(IN_MEMORY_TARGET)
            .with_handler(Arc::new(InMemoryTargetHandler::new()));
        InstancesManager::new(DmClient::new(client), targets, &Config::default())
    }

    fn vm(name: &str) -> Instance {
        Instance::new(name, Component::new("VM", "target"))
    }

    async fn lock_count(manager: &InstancesManager) -> usize {
        manager.acquisition_locks.lock().await.len()
    }

    #[tokio::test]
    async fn test_acquisition_locks_are_pruned() {
        let manager = manager();
        let application = Application::new("lamp", "Lamp")
            .with_root(vm("vm1"))
            .with_root(vm("vm2"));
        manager.add_application(application).await.unwrap();

        for path in ["/vm1", "/vm2"] {
            manager
                .change_instance_state("lamp", path, InstanceStatus::DeployedStarted)
                .await
                .unwrap();
        }
        assert_eq!(lock_count(&manager).await, 2);

        manager
            .change_instance_state("lamp", "/vm1", InstanceStatus::NotDeployed)
            .await
            .unwrap();
        manager.remove_instance("lamp", "/vm1").await.unwrap();
        assert_eq!(lock_count(&manager).await, 1);

        manager
            .change_instance_state("lamp", "/vm2", InstanceStatus::NotDeployed)
            .await
            .unwrap();
        manager.remove_application("lamp").await.unwrap();
        assert_eq!(lock_count(&manager).await, 0);
    }
}
