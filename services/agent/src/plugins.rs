//! Plugin interface and registry.
//!
//! Plugins do the actual work on the machine (install packages, run
//! scripts...). They are selected by the component installer name.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use fleet_model::Instance;
use tracing::{debug, info};

/// What a plugin gets to act on one instance.
#[derive(Debug, Clone, Copy)]
pub struct PluginContext<'a> {
    pub application: &'a str,
    pub path: &'a str,
    pub instance: &'a Instance,
}

#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Installs the instance; `resources` holds the component bundle,
    /// base64 encoded by relative file name.
    async fn deploy(&self, ctx: PluginContext<'_>, resources: &BTreeMap<String, String>) -> Result<()>;

    async fn start(&self, ctx: PluginContext<'_>) -> Result<()>;

    /// Called when the imports of a started instance changed.
    async fn update(&self, ctx: PluginContext<'_>) -> Result<()>;

    async fn stop(&self, ctx: PluginContext<'_>) -> Result<()>;

    async fn undeploy(&self, ctx: PluginContext<'_>) -> Result<()>;
}

/// Plugin that only logs what it is asked to do.
#[derive(Debug, Default)]
pub struct LoggerPlugin;

pub const LOGGER_PLUGIN: &str = "logger";

#[async_trait]
impl Plugin for LoggerPlugin {
    fn name(&self) -> &str {
        LOGGER_PLUGIN
    }

    async fn deploy(&self, ctx: PluginContext<'_>, resources: &BTreeMap<String, String>) -> Result<()> {
        info!(instance = %ctx.path, files = resources.len(), "Deploying");
        Ok(())
    }

    async fn start(&self, ctx: PluginContext<'_>) -> Result<()> {
        info!(instance = %ctx.path, "Starting");
        Ok(())
    }

    async fn update(&self, ctx: PluginContext<'_>) -> Result<()> {
        info!(
            instance = %ctx.path,
            prefixes = ctx.instance.imports.len(),
            "Updating after an import change"
        );
        Ok(())
    }

    async fn stop(&self, ctx: PluginContext<'_>) -> Result<()> {
        info!(instance = %ctx.path, "Stopping");
        Ok(())
    }

    async fn undeploy(&self, ctx: PluginContext<'_>) -> Result<()> {
        info!(instance = %ctx.path, "Undeploying");
        Ok(())
    }
}

/// Plugins by installer name, with a fallback for unknown installers.
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn Plugin>>,
    fallback: Arc<dyn Plugin>,
}

impl PluginRegistry {
    pub fn new(fallback: Arc<dyn Plugin>) -> Self {
        Self {
            plugins: HashMap::new(),
            fallback,
        }
    }

    pub fn with_plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.insert(plugin.name().to_string(), plugin);
        self
    }

    pub fn resolve(&self, installer: &str) -> Arc<dyn Plugin> {
        match self.plugins.get(installer) {
            Some(plugin) => Arc::clone(plugin),
            None => {
                debug!(installer, fallback = self.fallback.name(), "No plugin for installer");
                Arc::clone(&self.fallback)
            }
        }
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new(Arc::new(LoggerPlugin))
    }
}
