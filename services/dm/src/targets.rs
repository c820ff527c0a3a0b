//! Deployment targets.
//!
//! A target handler creates, configures and terminates the machine hosting
//! a scoped instance. Handlers are looked up by name through a
//! [`TargetResolver`]; the name comes from the `handler` target property.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_id::MachineId;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::managed::TargetProperties;

/// Target property naming the handler.
pub const HANDLER_PROPERTY: &str = "handler";

/// Name of the [`InMemoryTargetHandler`].
pub const IN_MEMORY_TARGET: &str = "in-memory";

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("no target handler named '{0}'")]
    UnknownHandler(String),

    #[error("machine creation failed: {0}")]
    Create(String),

    #[error("machine configuration failed: {0}")]
    Configure(String),

    #[error("machine termination failed: {0}")]
    Terminate(String),

    #[error("unknown machine {0}")]
    UnknownMachine(String),
}

/// Everything a handler needs to create or configure a machine.
#[derive(Debug, Clone)]
pub struct TargetContext {
    pub application: String,
    pub scoped_path: String,

    /// Target properties merged with the scoped instance data.
    pub properties: TargetProperties,

    /// What the agent on the machine needs to join the bus (domain,
    /// transport backend).
    pub messaging: BTreeMap<String, String>,
}

/// Outcome of one configuration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Configuration {
    Done,
    /// Not finished; ask again later.
    Pending,
}

#[async_trait]
pub trait TargetHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Creates the machine and returns its identifier.
    async fn create_machine(&self, ctx: &TargetContext) -> Result<String, TargetError>;

    /// Configures a created machine. May be called again while it reports
    /// [`Configuration::Pending`].
    async fn configure_machine(
        &self,
        ctx: &TargetContext,
        machine_id: &str,
    ) -> Result<Configuration, TargetError>;

    async fn terminate_machine(
        &self,
        properties: &TargetProperties,
        machine_id: &str,
    ) -> Result<(), TargetError>;

    async fn is_machine_running(
        &self,
        properties: &TargetProperties,
        machine_id: &str,
    ) -> Result<bool, TargetError>;
}

/// Resolves target handlers by name.
pub struct TargetResolver {
    handlers: HashMap<String, Arc<dyn TargetHandler>>,
    default_handler: String,
}

impl TargetResolver {
    pub fn new(default_handler: impl Into<String>) -> Self {
        Self {
            handlers: HashMap::new(),
            default_handler: default_handler.into(),
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn TargetHandler>) -> Self {
        self.handlers.insert(handler.name().to_string(), handler);
        self
    }

    /// Handler named by the `handler` property, or the default one.
    pub fn resolve(&self, properties: &TargetProperties) -> Result<Arc<dyn TargetHandler>, TargetError> {
        let name = properties
            .get(HANDLER_PROPERTY)
            .map(String::as_str)
            .unwrap_or(&self.default_handler);
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| TargetError::UnknownHandler(name.to_string()))
    }
}

#[derive(Debug, Clone)]
struct Machine {
    scoped_path: String,
    running: bool,
    pending_polls: u32,
}

/// Target handler keeping machines in memory. Used by the DM binary in
/// single-host mode and by tests.
pub struct InMemoryTargetHandler {
    machines: Mutex<HashMap<String, Machine>>,
    create_calls: AtomicUsize,
    terminate_calls: AtomicUsize,
    /// Configuration attempts answered `Pending` before `Done`.
    pending_polls: AtomicU32,
    create_delay: Duration,
    fail_creates: bool,
}

impl InMemoryTargetHandler {
    pub fn new() -> Self {
        Self {
            machines: Mutex::new(HashMap::new()),
            create_calls: AtomicUsize::new(0),
            terminate_calls: AtomicUsize::new(0),
            pending_polls: AtomicU32::new(0),
            create_delay: Duration::ZERO,
            fail_creates: false,
        }
    }

    /// A handler whose machine creations always fail.
    pub fn failing() -> Self {
        Self {
            fail_creates: true,
            ..Self::new()
        }
    }

    /// Slows machine creation down.
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    /// Makes every configuration report `Pending` `polls` times first.
    pub fn with_pending_polls(self, polls: u32) -> Self {
        self.pending_polls.store(polls, Ordering::SeqCst);
        self
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn terminate_calls(&self) -> usize {
        self.terminate_calls.load(Ordering::SeqCst)
    }

    pub async fn running_machines(&self) -> usize {
        self.machines.lock().await.values().filter(|m| m.running).count()
    }

    /// Simulates a machine dying behind the DM's back.
    pub async fn crash(&self, machine_id: &str) {
        if let Some(machine) = self.machines.lock().await.get_mut(machine_id) {
            machine.running = false;
        }
    }
}

impl Default for InMemoryTargetHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TargetHandler for InMemoryTargetHandler {
    fn name(&self) -> &str {
        IN_MEMORY_TARGET
    }

    async fn create_machine(&self, ctx: &TargetContext) -> Result<String, TargetError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }
        if self.fail_creates {
            return Err(TargetError::Create(format!(
                "no capacity left for {}",
                ctx.scoped_path
            )));
        }

        let machine_id = MachineId::new().to_string();
        self.machines.lock().await.insert(
            machine_id.clone(),
            Machine {
                scoped_path: ctx.scoped_path.clone(),
                running: true,
                pending_polls: self.pending_polls.load(Ordering::SeqCst),
            },
        );
        info!(
            application = %ctx.application,
            scoped = %ctx.scoped_path,
            machine_id = %machine_id,
            "Machine created"
        );
        Ok(machine_id)
    }

    async fn configure_machine(
        &self,
        _ctx: &TargetContext,
        machine_id: &str,
    ) -> Result<Configuration, TargetError> {
        let mut machines = self.machines.lock().await;
        let machine = machines
            .get_mut(machine_id)
            .ok_or_else(|| TargetError::UnknownMachine(machine_id.to_string()))?;
        if machine.pending_polls > 0 {
            machine.pending_polls -= 1;
            return Ok(Configuration::Pending);
        }
        Ok(Configuration::Done)
    }

    async fn terminate_machine(
        &self,
        _properties: &TargetProperties,
        machine_id: &str,
    ) -> Result<(), TargetError> {
        self.terminate_calls.fetch_add(1, Ordering::SeqCst);
        match self.machines.lock().await.remove(machine_id) {
            Some(machine) => {
                debug!(machine_id, scoped = %machine.scoped_path, "Machine terminated");
                Ok(())
            }
            None => Err(TargetError::UnknownMachine(machine_id.to_string())),
        }
    }

    async fn is_machine_running(
        &self,
        _properties: &TargetProperties,
        machine_id: &str,
    ) -> Result<bool, TargetError> {
        Ok(self
            .machines
            .lock()
            .await
            .get(machine_id)
            .is_some_and(|m| m.running))
    }
}
