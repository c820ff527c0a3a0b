//! The part of the application model an agent manages.
//!
//! An agent holds one scoped instance and the instances below it, down to
//! (and excluding) nested scoped instances, which have agents of their own.

use fleet_model::{data, paths, Instance, InstanceStatus, ModelError};

#[derive(Debug, Clone)]
pub struct LocalModel {
    application: String,
    scoped_path: String,
    root: Instance,
}

impl LocalModel {
    /// Wraps a scoped instance received from the DM.
    ///
    /// The scoped instance runs since the agent does; every instance below
    /// it starts over from `not_deployed`.
    pub fn new(application: impl Into<String>, scoped_path: impl Into<String>, mut root: Instance) -> Self {
        for child in &mut root.children {
            child.reset_subtree();
        }
        root.set_status(InstanceStatus::DeployedStarted);
        Self {
            application: application.into(),
            scoped_path: scoped_path.into(),
            root,
        }
    }

    pub fn application(&self) -> &str {
        &self.application
    }

    pub fn scoped_path(&self) -> &str {
        &self.scoped_path
    }

    pub fn root(&self) -> &Instance {
        &self.root
    }

    /// Segments of `path` relative to the scoped instance.
    fn relative<'p>(&self, path: &'p str) -> Option<Vec<&'p str>> {
        if path == self.scoped_path {
            return Some(Vec::new());
        }
        let rest = path.strip_prefix(self.scoped_path.as_str())?.strip_prefix('/')?;
        let segments: Vec<&str> = rest.split('/').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return None;
        }
        Some(segments)
    }

    pub fn find(&self, path: &str) -> Option<&Instance> {
        self.root.descend(&self.relative(path)?)
    }

    pub fn find_mut(&mut self, path: &str) -> Option<&mut Instance> {
        let segments = self.relative(path)?;
        self.root.descend_mut(&segments)
    }

    pub fn get(&self, path: &str) -> Result<&Instance, ModelError> {
        self.find(path)
            .ok_or_else(|| ModelError::InstanceNotFound(path.to_string()))
    }

    pub fn get_mut(&mut self, path: &str) -> Result<&mut Instance, ModelError> {
        self.find_mut(path)
            .ok_or_else(|| ModelError::InstanceNotFound(path.to_string()))
    }

    /// Every managed instance with its path, pre-order, scoped instance
    /// first.
    pub fn instances(&self) -> Vec<(String, &Instance)> {
        let mut out = Vec::new();
        collect_managed(&self.root, &self.scoped_path, true, &mut out);
        out
    }

    /// Managed paths of the subtree at `path`, deepest first.
    pub fn subtree_deepest_first(&self, path: &str) -> Vec<String> {
        let Some(instance) = self.find(path) else {
            return Vec::new();
        };
        let mut visited = Vec::new();
        collect_managed(instance, path, true, &mut visited);
        let mut paths: Vec<String> = visited.into_iter().map(|(p, _)| p).collect();
        paths.sort_by_key(|p| std::cmp::Reverse(p.matches('/').count()));
        paths
    }

    /// Status of the parent of `path`, if the parent is managed here.
    pub fn parent_status(&self, path: &str) -> Option<InstanceStatus> {
        paths::parent_path(path)
            .and_then(|parent| self.find(parent))
            .map(|parent| parent.status)
    }

    /// Records the machine IP address on every managed instance, so that
    /// unset `*.ip` exports resolve to it.
    pub fn set_ip_address(&mut self, ip: &str) {
        assign_ip(&mut self.root, ip, true);
    }

    /// Inserts a `not_deployed` instance below `parent_path`.
    pub fn insert(&mut self, parent_path: &str, mut instance: Instance) -> Result<String, ModelError> {
        let path = paths::child_path(Some(parent_path), &instance.name);
        if self.find(&path).is_some() {
            return Err(ModelError::DuplicateInstance(path));
        }
        instance.reset_subtree();
        if let Some(ip) = self.root.data.get(data::IP_ADDRESS).cloned() {
            assign_ip(&mut instance, &ip, true);
        }
        self.get_mut(parent_path)?.children.push(instance);
        Ok(path)
    }

    /// Removes an instance whose whole subtree is `not_deployed`.
    pub fn remove(&mut self, path: &str) -> Result<Instance, ModelError> {
        let instance = self.get(path)?;
        if !instance.subtree_not_deployed() {
            return Err(ModelError::StillDeployed {
                path: path.to_string(),
                status: instance.status.to_string(),
            });
        }
        let (Some(parent), Some(name)) = (paths::parent_path(path), path.rsplit('/').next()) else {
            return Err(ModelError::InvalidPath(path.to_string()));
        };
        if path == self.scoped_path {
            return Err(ModelError::InvalidPath(path.to_string()));
        }

        let siblings = &mut self.get_mut(parent)?.children;
        let idx = siblings
            .iter()
            .position(|i| i.name == name)
            .ok_or_else(|| ModelError::InstanceNotFound(path.to_string()))?;
        Ok(siblings.remove(idx))
    }
}

fn assign_ip(instance: &mut Instance, ip: &str, top: bool) {
    if !top && instance.is_scoped() {
        return;
    }
    instance
        .data
        .insert(data::IP_ADDRESS.to_string(), ip.to_string());
    for child in &mut instance.children {
        assign_ip(child, ip, false);
    }
}

fn collect_managed<'a>(instance: &'a Instance, path: &str, top: bool, out: &mut Vec<(String, &'a Instance)>) {
    if !top && instance.is_scoped() {
        return;
    }
    out.push((path.to_string(), instance));
    for child in &instance.children {
        collect_managed(child, &paths::child_path(Some(path), &child.name), false, out);
    }
}
