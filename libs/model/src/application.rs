//! Applications: named instance trees built from a template.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{paths, Instance, ModelError};

/// An application: a named instantiation of a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub name: String,
    pub template: String,
    #[serde(default)]
    pub root_instances: Vec<Instance>,
    /// External export aliases: internal variable name -> name visible to
    /// other applications (`MySQL.port -> Lamp.db_port`).
    #[serde(default)]
    pub external_exports: BTreeMap<String, String>,
}

impl Application {
    pub fn new(name: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            template: template.into(),
            root_instances: Vec::new(),
            external_exports: BTreeMap::new(),
        }
    }

    pub fn with_root(mut self, instance: Instance) -> Self {
        self.root_instances.push(instance);
        self
    }

    pub fn with_external_export(mut self, internal: impl Into<String>, alias: impl Into<String>) -> Self {
        self.external_exports.insert(internal.into(), alias.into());
        self
    }

    pub fn find(&self, path: &str) -> Option<&Instance> {
        let segments = paths::segments(path).ok()?;
        let (root, rest) = segments.split_first()?;
        self.root_instances
            .iter()
            .find(|i| i.name == *root)
            .and_then(|i| i.descend(rest))
    }

    pub fn find_mut(&mut self, path: &str) -> Option<&mut Instance> {
        let segments = paths::segments(path).ok()?;
        let (root, rest) = segments.split_first()?;
        self.root_instances
            .iter_mut()
            .find(|i| i.name == *root)
            .and_then(|i| i.descend_mut(rest))
    }

    /// Like [`Application::find`], failing on unknown paths.
    pub fn get(&self, path: &str) -> Result<&Instance, ModelError> {
        self.find(path)
            .ok_or_else(|| ModelError::InstanceNotFound(path.to_string()))
    }

    pub fn get_mut(&mut self, path: &str) -> Result<&mut Instance, ModelError> {
        self.find_mut(path)
            .ok_or_else(|| ModelError::InstanceNotFound(path.to_string()))
    }

    /// Every instance with its path, in pre-order.
    pub fn all_instances(&self) -> Vec<(String, &Instance)> {
        let mut out = Vec::new();
        for root in &self.root_instances {
            root.walk(&paths::child_path(None, &root.name), &mut out);
        }
        out
    }

    pub fn root_paths(&self) -> Vec<String> {
        self.root_instances
            .iter()
            .map(|i| paths::child_path(None, &i.name))
            .collect()
    }

    /// Paths of all scoped instances.
    pub fn scoped_paths(&self) -> Vec<String> {
        self.all_instances()
            .into_iter()
            .filter(|(_, i)| i.is_scoped())
            .map(|(p, _)| p)
            .collect()
    }

    /// Path of the scoped instance an instance is deployed with: the nearest
    /// scoped ancestor-or-self.
    pub fn scoped_path_of(&self, path: &str) -> Result<String, ModelError> {
        let mut current = Some(path);
        while let Some(candidate) = current {
            let instance = self.get(candidate)?;
            if instance.is_scoped() {
                return Ok(candidate.to_string());
            }
            current = paths::parent_path(candidate);
        }
        Err(ModelError::NotScoped(path.to_string()))
    }

    /// Inserts an instance under `parent` (or as a root).
    ///
    /// Returns the path of the inserted instance.
    pub fn insert_instance(
        &mut self,
        parent: Option<&str>,
        instance: Instance,
    ) -> Result<String, ModelError> {
        let path = paths::child_path(parent, &instance.name);
        if self.find(&path).is_some() {
            return Err(ModelError::DuplicateInstance(path));
        }

        match parent {
            None => self.root_instances.push(instance),
            Some(parent) => self.get_mut(parent)?.children.push(instance),
        }
        Ok(path)
    }

    /// Removes an instance whose whole subtree is `not_deployed`.
    pub fn remove_instance(&mut self, path: &str) -> Result<Instance, ModelError> {
        let instance = self.get(path)?;
        if !instance.subtree_not_deployed() {
            return Err(ModelError::StillDeployed {
                path: path.to_string(),
                status: instance.status.to_string(),
            });
        }
        self.detach(path)
    }

    /// Removes an instance regardless of its status (the agent reported it
    /// gone).
    pub fn detach(&mut self, path: &str) -> Result<Instance, ModelError> {
        let name = paths::segments(path)?
            .last()
            .map(|s| s.to_string())
            .ok_or_else(|| ModelError::InvalidPath(path.to_string()))?;

        let siblings = match paths::parent_path(path) {
            None => &mut self.root_instances,
            Some(parent) => &mut self.get_mut(parent)?.children,
        };

        let idx = siblings
            .iter()
            .position(|i| i.name == name)
            .ok_or_else(|| ModelError::InstanceNotFound(path.to_string()))?;
        Ok(siblings.remove(idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Component, InstanceStatus};

    fn app() -> Application {
        Application::new("lamp", "Lamp").with_root(
            Instance::new("vm", Component::new("VM", "target")).with_child(
                Instance::new("tomcat", Component::new("Tomcat", "logger"))
                    .with_child(Instance::new("app", Component::new("War", "logger"))),
            ),
        )
    }

    #[test]
    fn test_find() {
        let app = app();
        assert_eq!(app.find("/vm/tomcat/app").map(|i| i.name.as_str()), Some("app"));
        assert!(app.find("/vm/nope").is_none());
        assert!(app.find("vm").is_none());
    }

    #[test]
    fn test_scoped_path_of() {
        let app = app();
        assert_eq!(app.scoped_path_of("/vm/tomcat/app").unwrap(), "/vm");
        assert_eq!(app.scoped_path_of("/vm").unwrap(), "/vm");
        assert!(matches!(
            app.scoped_path_of("/ghost"),
            Err(ModelError::InstanceNotFound(_))
        ));
    }

    #[test]
    fn test_insert_and_remove() {
        let mut app = app();
        let path = app
            .insert_instance(Some("/vm"), Instance::new("mysql", Component::new("MySQL", "logger")))
            .unwrap();
        assert_eq!(path, "/vm/mysql");
        assert!(matches!(
            app.insert_instance(Some("/vm"), Instance::new("mysql", Component::new("MySQL", "logger"))),
            Err(ModelError::DuplicateInstance(_))
        ));

        let removed = app.remove_instance("/vm/mysql").unwrap();
        assert_eq!(removed.name, "mysql");
        assert!(app.find("/vm/mysql").is_none());
    }

    #[test]
    fn test_remove_refuses_deployed_subtree() {
        let mut app = app();
        app.find_mut("/vm/tomcat/app").unwrap().status = InstanceStatus::DeployedStarted;
        assert!(matches!(
            app.remove_instance("/vm/tomcat"),
            Err(ModelError::StillDeployed { .. })
        ));
    }

    #[test]
    fn test_scoped_paths() {
        let app = app().with_root(Instance::new("vm2", Component::new("VM", "target")));
        assert_eq!(app.scoped_paths(), vec!["/vm".to_string(), "/vm2".to_string()]);
    }
}
