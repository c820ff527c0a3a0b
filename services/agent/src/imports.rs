//! Import bookkeeping.
//!
//! Exports published by other instances land in the import tables of the
//! local instances importing their prefix. Exports from the agent's own
//! application match internal imports; exports from another application
//! match external imports and are keyed by `<application>:<path>` so that
//! equal paths of different applications stay apart.

use std::collections::BTreeMap;

use fleet_model::{paths, variables, Import, Instance};

use crate::model::LocalModel;

/// Exports received from another instance.
#[derive(Debug, Clone)]
pub struct ReceivedExports {
    pub application: String,
    pub prefix: String,
    pub exporter_path: String,
    pub component_name: String,
    pub exported_vars: BTreeMap<String, String>,
}

/// True if `instance` imports `prefix` through an internal (or, with
/// `external`, an external) import.
pub fn imports_prefix(instance: &Instance, prefix: &str, external: bool) -> bool {
    instance
        .component
        .imports
        .iter()
        .any(|(name, var)| var.external == external && variables::prefix_of(name) == prefix)
}

fn source_key(model: &LocalModel, application: &str, path: &str) -> String {
    if application == model.application() {
        path.to_string()
    } else {
        format!("{application}:{path}")
    }
}

/// Local instances importing from an exporter, never the exporter itself.
fn importers(model: &LocalModel, application: &str, prefix: &str, exporter_path: &str) -> Vec<String> {
    let external = application != model.application();
    model
        .instances()
        .into_iter()
        .filter(|(path, instance)| {
            (external || path != exporter_path) && imports_prefix(instance, prefix, external)
        })
        .map(|(path, _)| path)
        .collect()
}

/// Records received exports. Returns the paths whose import table changed.
pub fn add_import(model: &mut LocalModel, received: &ReceivedExports) -> Vec<String> {
    let key = source_key(model, &received.application, &received.exporter_path);
    let targets = importers(model, &received.application, &received.prefix, &received.exporter_path);

    let mut changed = Vec::new();
    for path in targets {
        let Some(instance) = model.find_mut(&path) else {
            continue;
        };
        let import = Import {
            instance_path: key.clone(),
            component_name: received.component_name.clone(),
            exported_vars: received.exported_vars.clone(),
        };
        let unchanged = instance
            .imports
            .get(&received.prefix)
            .is_some_and(|imports| imports.contains(&import));
        if !unchanged {
            instance.add_import(&received.prefix, import);
            changed.push(path);
        }
    }
    changed
}

/// Forgets the exports of a removed instance (and of everything below it).
/// Returns the paths whose import table changed.
pub fn remove_import(model: &mut LocalModel, application: &str, prefix: &str, removed_path: &str) -> Vec<String> {
    let key = source_key(model, application, removed_path);
    let targets = importers(model, application, prefix, removed_path);

    let mut changed = Vec::new();
    for path in targets {
        let Some(instance) = model.find_mut(&path) else {
            continue;
        };
        let stale: Vec<String> = instance
            .imports
            .get(prefix)
            .into_iter()
            .flatten()
            .map(|i| i.instance_path.clone())
            .filter(|source| source == &key || paths::is_within(source, &key))
            .collect();
        let mut removed = false;
        for source in stale {
            removed |= instance.remove_import(prefix, &source);
        }
        if removed {
            changed.push(path);
        }
    }
    changed
}
