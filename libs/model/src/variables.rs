//! Variable name helpers.
//!
//! A variable prefix is the component-or-facet part of a dotted variable
//! name: everything before the first dot. Prefixes are the routing subjects
//! of the export/import protocol.

use std::collections::{BTreeMap, BTreeSet};

use crate::{Component, Instance};

/// Returns the prefix of a variable name (the whole name when undotted).
pub fn prefix_of(name: &str) -> &str {
    name.split_once('.').map_or(name, |(prefix, _)| prefix)
}

/// Distinct prefixes of the variables a component exports.
pub fn exported_prefixes(component: &Component) -> BTreeSet<String> {
    component
        .exports
        .keys()
        .map(|name| prefix_of(name).to_string())
        .collect()
}

/// Distinct prefixes of the variables a component imports.
pub fn imported_prefixes(component: &Component) -> BTreeSet<String> {
    component
        .imports
        .keys()
        .map(|name| prefix_of(name).to_string())
        .collect()
}

/// Prefixes whose imports are mandatory to start an instance.
pub fn mandatory_import_prefixes(component: &Component) -> BTreeSet<String> {
    let mut by_prefix: BTreeMap<&str, bool> = BTreeMap::new();
    for (name, var) in &component.imports {
        let optional = by_prefix.entry(prefix_of(name)).or_insert(true);
        *optional &= var.optional;
    }

    by_prefix
        .into_iter()
        .filter(|(_, optional)| !optional)
        .map(|(prefix, _)| prefix.to_string())
        .collect()
}

/// Exported variables restricted to one prefix.
pub fn filter_by_prefix(
    variables: &BTreeMap<String, String>,
    prefix: &str,
) -> BTreeMap<String, String> {
    variables
        .iter()
        .filter(|(name, _)| prefix_of(name) == prefix)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Renames exported variables through an external-export mapping.
///
/// Only mapped variables are kept: `MySQL.port -> Lamp.db_port`.
pub fn apply_external_aliases(
    variables: &BTreeMap<String, String>,
    aliases: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    variables
        .iter()
        .filter_map(|(name, value)| aliases.get(name).map(|alias| (alias.clone(), value.clone())))
        .collect()
}

/// True if every mandatory import prefix of the instance has at least one
/// import.
pub fn all_mandatory_imports_resolved(instance: &Instance) -> bool {
    mandatory_import_prefixes(&instance.component)
        .iter()
        .all(|prefix| {
            instance
                .imports
                .get(prefix)
                .is_some_and(|imports| !imports.is_empty())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mysql() -> Component {
        Component::new("MySQL", "puppet")
            .with_export("MySQL.port", Some("3306"))
            .with_export("MySQL.ip", None)
    }

    #[test]
    fn test_prefix_of() {
        assert_eq!(prefix_of("MySQL.port"), "MySQL");
        assert_eq!(prefix_of("MySQL.*"), "MySQL");
        assert_eq!(prefix_of("a.b.c"), "a");
        assert_eq!(prefix_of("plain"), "plain");
    }

    #[test]
    fn test_shared_prefix_collapses() {
        let prefixes = exported_prefixes(&mysql());
        assert_eq!(prefixes.len(), 1);
        assert!(prefixes.contains("MySQL"));
    }

    #[test]
    fn test_no_exports_no_prefixes() {
        let c = Component::new("Empty", "logger");
        assert!(exported_prefixes(&c).is_empty());
        assert!(imported_prefixes(&c).is_empty());
    }

    #[test]
    fn test_mandatory_prefixes() {
        let c = Component::new("Tomcat", "puppet")
            .with_import("MySQL.*", false)
            .with_import("Cache.port", true)
            .with_import("Lb.ip", true)
            .with_import("Lb.port", false);

        let mandatory = mandatory_import_prefixes(&c);
        assert!(mandatory.contains("MySQL"));
        assert!(mandatory.contains("Lb"));
        assert!(!mandatory.contains("Cache"));
    }

    #[test]
    fn test_external_aliases() {
        let vars = BTreeMap::from([
            ("MySQL.port".to_string(), "3306".to_string()),
            ("MySQL.ip".to_string(), "10.0.0.1".to_string()),
        ]);
        let aliases = BTreeMap::from([("MySQL.port".to_string(), "Lamp.db_port".to_string())]);

        let renamed = apply_external_aliases(&vars, &aliases);
        assert_eq!(renamed.len(), 1);
        assert_eq!(renamed.get("Lamp.db_port").map(String::as_str), Some("3306"));
    }
}
