//! Component types of the application graph.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Installer name marking components whose instances own a machine.
pub const TARGET_INSTALLER: &str = "target";

/// An imported variable declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportedVariable {
    /// Full dotted name, possibly a wildcard (`MySQL.*`).
    pub name: String,

    /// Optional imports do not block the start of an instance.
    #[serde(default)]
    pub optional: bool,

    /// External imports come from another application.
    #[serde(default)]
    pub external: bool,
}

/// A component type: the unit instances are created from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    pub name: String,

    /// Plugin handling the instances on the agent side.
    pub installer: String,

    /// Exported variables (`prefix.name`) with their default value. Facet
    /// exports are flattened in with the facet name as prefix.
    #[serde(default)]
    pub exports: BTreeMap<String, Option<String>>,

    /// Imported variables keyed by full name.
    #[serde(default)]
    pub imports: BTreeMap<String, ImportedVariable>,
}

impl Component {
    pub fn new(name: impl Into<String>, installer: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            installer: installer.into(),
            exports: BTreeMap::new(),
            imports: BTreeMap::new(),
        }
    }

    /// Adds an exported variable with an optional default value.
    pub fn with_export(mut self, name: impl Into<String>, default: Option<&str>) -> Self {
        self.exports.insert(name.into(), default.map(str::to_string));
        self
    }

    /// Adds an imported variable.
    pub fn with_import(mut self, name: impl Into<String>, optional: bool) -> Self {
        let name = name.into();
        self.imports.insert(
            name.clone(),
            ImportedVariable {
                name,
                optional,
                external: false,
            },
        );
        self
    }

    /// Adds an import resolved from another application.
    pub fn with_external_import(mut self, name: impl Into<String>, optional: bool) -> Self {
        let name = name.into();
        self.imports.insert(
            name.clone(),
            ImportedVariable {
                name,
                optional,
                external: true,
            },
        );
        self
    }

    pub fn is_target(&self) -> bool {
        self.installer == TARGET_INSTALLER
    }
}
