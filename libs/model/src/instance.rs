//! Instance tree.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{paths, Component, InstanceStatus};

/// Well-known keys of the instance data bag.
pub mod data {
    /// Machine identifier returned by the target handler.
    pub const MACHINE_ID: &str = "machine.id";
    /// IP address of the machine, reported by the agent.
    pub const IP_ADDRESS: &str = "ip.address";
    /// Set while a deployment of the scoped instance is in flight or done.
    pub const TARGET_ACQUIRED: &str = "target.acquired";
    /// RFC 3339 timestamp of the last transition to `deployed_started`.
    pub const RUNNING_FROM: &str = "running.from";
}

/// Variables received from one exporting instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Import {
    /// Path of the exporting instance.
    pub instance_path: String,
    pub component_name: String,
    pub exported_vars: BTreeMap<String, String>,
}

/// A node of the instance tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub name: String,
    pub component: Component,
    #[serde(default)]
    pub status: InstanceStatus,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    #[serde(default)]
    pub overridden_exports: BTreeMap<String, String>,
    /// Imports keyed by variable prefix.
    #[serde(default)]
    pub imports: BTreeMap<String, Vec<Import>>,
    #[serde(default)]
    pub children: Vec<Instance>,
}

impl Instance {
    pub fn new(name: impl Into<String>, component: Component) -> Self {
        Self {
            name: name.into(),
            component,
            status: InstanceStatus::NotDeployed,
            data: BTreeMap::new(),
            overridden_exports: BTreeMap::new(),
            imports: BTreeMap::new(),
            children: Vec::new(),
        }
    }

    pub fn with_child(mut self, child: Instance) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_overridden_export(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.overridden_exports.insert(name.into(), value.into());
        self
    }

    /// A scoped instance owns a machine and an agent.
    pub fn is_scoped(&self) -> bool {
        self.component.is_target()
    }

    /// Updates the status, maintaining the running-since marker.
    pub fn set_status(&mut self, status: InstanceStatus) {
        if status == InstanceStatus::DeployedStarted {
            if self.status != InstanceStatus::DeployedStarted
                || !self.data.contains_key(data::RUNNING_FROM)
            {
                self.data
                    .insert(data::RUNNING_FROM.to_string(), Utc::now().to_rfc3339());
            }
        } else {
            self.data.remove(data::RUNNING_FROM);
        }
        self.status = status;
    }

    /// When the instance last entered `deployed_started`.
    pub fn running_since(&self) -> Option<DateTime<Utc>> {
        self.data
            .get(data::RUNNING_FROM)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|ts| ts.with_timezone(&Utc))
    }

    pub fn machine_id(&self) -> Option<&str> {
        self.data.get(data::MACHINE_ID).map(String::as_str)
    }

    /// Resolved exported variables.
    ///
    /// Overridden values win over component defaults; unset `*.ip` variables
    /// take the instance IP address; variables without a value are omitted.
    pub fn exported_variables(&self) -> BTreeMap<String, String> {
        let ip = self.data.get(data::IP_ADDRESS);
        self.component
            .exports
            .iter()
            .filter_map(|(name, default)| {
                let value = self
                    .overridden_exports
                    .get(name)
                    .or(default.as_ref())
                    .or_else(|| if name.ends_with(".ip") { ip } else { None })?;
                Some((name.clone(), value.clone()))
            })
            .collect()
    }

    /// Adds or replaces the import coming from `import.instance_path`.
    pub fn add_import(&mut self, prefix: &str, import: Import) {
        let imports = self.imports.entry(prefix.to_string()).or_default();
        imports.retain(|i| i.instance_path != import.instance_path);
        imports.push(import);
    }

    /// Removes the imports received from `exporter_path` under `prefix`.
    ///
    /// Returns true if something was removed.
    pub fn remove_import(&mut self, prefix: &str, exporter_path: &str) -> bool {
        let Some(imports) = self.imports.get_mut(prefix) else {
            return false;
        };
        let before = imports.len();
        imports.retain(|i| i.instance_path != exporter_path);
        let removed = imports.len() != before;
        if imports.is_empty() {
            self.imports.remove(prefix);
        }
        removed
    }

    /// Forces this instance and its whole subtree back to `not_deployed`.
    pub fn reset_subtree(&mut self) {
        self.set_status(InstanceStatus::NotDeployed);
        self.imports.clear();
        for child in &mut self.children {
            child.reset_subtree();
        }
    }

    /// True if every instance of the subtree is `not_deployed`.
    pub fn subtree_not_deployed(&self) -> bool {
        self.status == InstanceStatus::NotDeployed
            && self.children.iter().all(Instance::subtree_not_deployed)
    }

    /// Visits the subtree in pre-order with each instance's path.
    pub fn walk<'a>(&'a self, own_path: &str, out: &mut Vec<(String, &'a Instance)>) {
        out.push((own_path.to_string(), self));
        for child in &self.children {
            child.walk(&paths::child_path(Some(own_path), &child.name), out);
        }
    }

    /// Paths of the subtree, deepest first.
    pub fn paths_deepest_first(&self, own_path: &str) -> Vec<String> {
        let mut visited = Vec::new();
        self.walk(own_path, &mut visited);
        let mut paths: Vec<String> = visited.into_iter().map(|(p, _)| p).collect();
        paths.sort_by_key(|p| std::cmp::Reverse(p.matches('/').count()));
        paths
    }

    /// Finds a descendant through relative segment names.
    pub fn descend(&self, segments: &[&str]) -> Option<&Instance> {
        match segments.split_first() {
            None => Some(self),
            Some((head, rest)) => self
                .children
                .iter()
                .find(|c| c.name == *head)
                .and_then(|c| c.descend(rest)),
        }
    }

    pub fn descend_mut(&mut self, segments: &[&str]) -> Option<&mut Instance> {
        match segments.split_first() {
            None => Some(self),
            Some((head, rest)) => self
                .children
                .iter_mut()
                .find(|c| c.name == *head)
                .and_then(|c| c.descend_mut(rest)),
        }
    }
}
