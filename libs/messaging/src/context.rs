//! Routing model.
//!
//! A [`MessagingContext`] is the address a message is published to or a
//! subscription listens on. Contexts are recomputed from component metadata
//! each time they are needed.
//!
//! Routing keys have the form `<domain>.<kind>[.<application>].<topic>`:
//!
//! | context | topic |
//! |---------|-------|
//! | DM | `dm` |
//! | one agent | `machine.<scoped path with dots>` |
//! | export/import protocol | `those.that.export.<prefix>` or `those.that.import.<prefix>` |
//!
//! Cross-application contexts omit the application segment.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use fleet_model::{variables, Component, Instance};

/// Who receives messages published on a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RecipientKind {
    /// The deployment manager.
    Dm,
    /// Agents of one application.
    Agents,
    /// Agents of any application (external exports/imports).
    InterApp,
}

impl RecipientKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientKind::Dm => "dm",
            RecipientKind::Agents => "agents",
            RecipientKind::InterApp => "inter-app",
        }
    }
}

/// Export/import protocol qualifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ThoseThat {
    /// Addressed to the instances exporting the subject.
    Export,
    /// Addressed to the instances importing the subject.
    Import,
}

impl ThoseThat {
    fn as_str(&self) -> &'static str {
        match self {
            ThoseThat::Export => "those.that.export",
            ThoseThat::Import => "those.that.import",
        }
    }
}

/// Topic of the agent managing a scoped instance.
///
/// `/vm1/docker` becomes `machine.vm1.docker`.
pub fn topic_for(scoped_path: &str) -> String {
    format!("machine{}", scoped_path.replace('/', "."))
}

/// A routing address.
///
/// Two contexts are routing-equivalent iff they are equal. DM contexts never
/// carry a subject or a qualifier; the constructors enforce it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessagingContext {
    kind: RecipientKind,
    domain: String,
    application: Option<String>,
    subject: Option<String>,
    those_that: Option<ThoseThat>,
}

impl MessagingContext {
    /// Context the DM listens on for one application.
    pub fn for_dm(domain: &str, application: &str) -> Self {
        Self {
            kind: RecipientKind::Dm,
            domain: domain.to_string(),
            application: Some(application.to_string()),
            subject: None,
            those_that: None,
        }
    }

    /// Context of the agent managing `scoped_path`.
    pub fn for_agent(domain: &str, application: &str, scoped_path: &str) -> Self {
        Self {
            kind: RecipientKind::Agents,
            domain: domain.to_string(),
            application: Some(application.to_string()),
            subject: Some(topic_for(scoped_path)),
            those_that: None,
        }
    }

    /// Context of one variable prefix in the export/import protocol.
    pub fn for_prefix(
        domain: &str,
        application: Option<&str>,
        prefix: &str,
        those_that: ThoseThat,
    ) -> Self {
        let (kind, application) = match application {
            Some(app) => (RecipientKind::Agents, Some(app.to_string())),
            None => (RecipientKind::InterApp, None),
        };
        Self {
            kind,
            domain: domain.to_string(),
            application,
            subject: Some(prefix.to_string()),
            those_that: Some(those_that),
        }
    }

    /// One context per distinct prefix exported by `instance`, plus one
    /// cross-application context per prefix of the external aliases its
    /// variables map to.
    ///
    /// Publishing exports uses [`ThoseThat::Import`]; listening to export
    /// requests uses [`ThoseThat::Export`].
    pub fn for_exported_variables(
        domain: &str,
        application: &str,
        instance: &Instance,
        external_exports: &BTreeMap<String, String>,
        those_that: ThoseThat,
    ) -> Vec<Self> {
        let mut contexts: BTreeSet<Self> = variables::exported_prefixes(&instance.component)
            .iter()
            .map(|prefix| Self::for_prefix(domain, Some(application), prefix, those_that))
            .collect();

        contexts.extend(
            instance
                .component
                .exports
                .keys()
                .filter_map(|name| external_exports.get(name))
                .map(|alias| Self::for_prefix(domain, None, variables::prefix_of(alias), those_that)),
        );

        contexts.into_iter().collect()
    }

    /// One context per distinct prefix imported by `component`. External
    /// imports map to cross-application contexts.
    ///
    /// Requesting exports uses [`ThoseThat::Export`]; listening to exports
    /// uses [`ThoseThat::Import`].
    pub fn for_imported_variables(
        domain: &str,
        application: &str,
        component: &Component,
        those_that: ThoseThat,
    ) -> Vec<Self> {
        let contexts: BTreeSet<Self> = component
            .imports
            .values()
            .map(|var| {
                let app = (!var.external).then_some(application);
                Self::for_prefix(domain, app, variables::prefix_of(&var.name), those_that)
            })
            .collect();

        contexts.into_iter().collect()
    }

    pub fn kind(&self) -> RecipientKind {
        self.kind
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn application(&self) -> Option<&str> {
        self.application.as_deref()
    }

    /// Component, facet or agent topic.
    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    pub fn those_that(&self) -> Option<ThoseThat> {
        self.those_that
    }

    /// Full routing key.
    pub fn routing_key(&self) -> String {
        let mut key = format!("{}.{}", self.domain, self.kind.as_str());
        if let Some(app) = &self.application {
            key.push('.');
            key.push_str(app);
        }
        key.push('.');
        match (&self.subject, self.those_that) {
            (Some(subject), Some(those_that)) => {
                key.push_str(those_that.as_str());
                key.push('.');
                key.push_str(subject);
            }
            (Some(subject), None) => key.push_str(subject),
            (None, _) => key.push_str(RecipientKind::Dm.as_str()),
        }
        key
    }
}

impl fmt::Display for MessagingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.routing_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn tomcat() -> Instance {
        Instance::new(
            "tomcat",
            Component::new("Tomcat", "puppet")
                .with_export("Tomcat.ip", None)
                .with_export("Tomcat.port", Some("8080"))
                .with_export("web.url", Some("http://x"))
                .with_import("MySQL.ip", false)
                .with_import("MySQL.port", false)
                .with_external_import("Lamp.db", true),
        )
    }

    #[rstest]
    #[case("/vm", "machine.vm")]
    #[case("/vm1/docker", "machine.vm1.docker")]
    fn test_topic_for(#[case] path: &str, #[case] expected: &str) {
        assert_eq!(topic_for(path), expected);
    }

    #[test]
    fn test_routing_keys() {
        assert_eq!(MessagingContext::for_dm("d", "lamp").routing_key(), "d.dm.lamp.dm");
        assert_eq!(
            MessagingContext::for_agent("d", "lamp", "/vm").routing_key(),
            "d.agents.lamp.machine.vm"
        );
        assert_eq!(
            MessagingContext::for_prefix("d", Some("lamp"), "MySQL", ThoseThat::Import).to_string(),
            "d.agents.lamp.those.that.import.MySQL"
        );
        assert_eq!(
            MessagingContext::for_prefix("d", None, "Lamp", ThoseThat::Export).to_string(),
            "d.inter-app.those.that.export.Lamp"
        );
    }

    #[test]
    fn test_dm_context_has_no_subject() {
        let ctx = MessagingContext::for_dm("d", "lamp");
        assert_eq!(ctx.kind(), RecipientKind::Dm);
        assert_eq!(ctx.subject(), None);
        assert_eq!(ctx.those_that(), None);
    }

    #[test]
    fn test_exported_contexts_collapse_prefixes() {
        let contexts = MessagingContext::for_exported_variables(
            "d",
            "lamp",
            &tomcat(),
            &BTreeMap::new(),
            ThoseThat::Import,
        );
        let subjects: Vec<_> = contexts.iter().filter_map(|c| c.subject()).collect();
        assert_eq!(subjects, vec!["Tomcat", "web"]);
        assert!(contexts.iter().all(|c| c.those_that() == Some(ThoseThat::Import)));
    }

    #[test]
    fn test_exported_contexts_include_external_aliases() {
        let aliases = BTreeMap::from([("Tomcat.port".to_string(), "Front.port".to_string())]);
        let contexts = MessagingContext::for_exported_variables(
            "d",
            "lamp",
            &tomcat(),
            &aliases,
            ThoseThat::Import,
        );
        assert_eq!(contexts.len(), 3);
        let external: Vec<_> = contexts
            .iter()
            .filter(|c| c.kind() == RecipientKind::InterApp)
            .collect();
        assert_eq!(external.len(), 1);
        assert_eq!(external[0].subject(), Some("Front"));
        assert_eq!(external[0].application(), None);
    }

    #[test]
    fn test_imported_contexts() {
        let contexts = MessagingContext::for_imported_variables(
            "d",
            "lamp",
            &tomcat().component,
            ThoseThat::Export,
        );
        assert_eq!(contexts.len(), 2);
        assert!(contexts.contains(&MessagingContext::for_prefix(
            "d",
            Some("lamp"),
            "MySQL",
            ThoseThat::Export
        )));
        assert!(contexts.contains(&MessagingContext::for_prefix(
            "d",
            None,
            "Lamp",
            ThoseThat::Export
        )));
    }

    #[test]
    fn test_no_variables_no_contexts() {
        let bare = Instance::new("vm", Component::new("VM", "target"));
        assert!(MessagingContext::for_exported_variables(
            "d",
            "lamp",
            &bare,
            &BTreeMap::new(),
            ThoseThat::Import
        )
        .is_empty());
        assert!(
            MessagingContext::for_imported_variables("d", "lamp", &bare.component, ThoseThat::Export)
                .is_empty()
        );
    }

    fn variable_names() -> impl Strategy<Value = Vec<String>> {
        prop::collection::vec(("[A-C]", "[a-d]{1,3}"), 0..12).prop_map(|pairs| {
            pairs
                .into_iter()
                .map(|(prefix, name)| format!("{prefix}.{name}"))
                .collect()
        })
    }

    proptest! {
        #[test]
        fn exported_contexts_ignore_declaration_order(names in variable_names(), seed in any::<u64>()) {
            let mut shuffled = names.clone();
            let len = shuffled.len().max(1);
            shuffled.rotate_left((seed as usize) % len);
            shuffled.reverse();

            let build = |names: &[String]| {
                let component = names
                    .iter()
                    .fold(Component::new("C", "puppet"), |c, n| c.with_export(n.as_str(), Some("v")));
                MessagingContext::for_exported_variables(
                    "d",
                    "app",
                    &Instance::new("i", component),
                    &BTreeMap::new(),
                    ThoseThat::Import,
                )
            };

            let first = build(&names);
            let second = build(&shuffled);
            prop_assert_eq!(&first, &second);

            let distinct: BTreeSet<&str> = names.iter().map(|n| variables::prefix_of(n)).collect();
            prop_assert_eq!(first.len(), distinct.len());
        }
    }
}
