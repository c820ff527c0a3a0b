//! Message catalogue.
//!
//! Each variant is one command or notification. Variants are grouped by
//! direction; [`Message::direction`] is the authoritative mapping.

use std::collections::BTreeMap;

use fleet_id::AgentId;
use fleet_model::{Import, Instance, InstanceStatus};
use serde::{Deserialize, Serialize};

/// Message kind names as constants, used in logs.
pub mod message_kinds {
    pub const SET_SCOPED_INSTANCE: &str = "set_scoped_instance";
    pub const CHANGE_INSTANCE_STATE: &str = "change_instance_state";
    pub const ADD_INSTANCE: &str = "add_instance";
    pub const REMOVE_INSTANCE: &str = "remove_instance";
    pub const SEND_INSTANCES: &str = "send_instances";
    pub const RESYNCHRONIZE: &str = "resynchronize";

    pub const HEARTBEAT: &str = "heartbeat";
    pub const INSTANCE_CHANGED: &str = "instance_changed";
    pub const INSTANCE_REMOVED: &str = "instance_removed";
    pub const MACHINE_DOWN: &str = "machine_down";
    pub const AUTONOMIC: &str = "autonomic";

    pub const ADD_IMPORT: &str = "add_import";
    pub const REMOVE_IMPORT: &str = "remove_import";
    pub const REQUEST_IMPORT: &str = "request_import";
}

/// Who sends a message to whom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    DmToAgent,
    AgentToDm,
    AgentToAgent,
}

/// A command or notification on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    // ---------------------------------------------------------------------
    // DM -> agent
    // ---------------------------------------------------------------------
    /// Hands an agent the model of the scoped instance it manages.
    SetScopedInstance {
        application: String,
        scoped_path: String,
        scoped_instance: Instance,
        #[serde(default)]
        external_exports: BTreeMap<String, String>,
    },

    /// Asks the agent to move one of its instances to a new status.
    ChangeInstanceState {
        instance_path: String,
        new_status: InstanceStatus,
        /// Component resource files, base64 encoded, keyed by file name.
        #[serde(default)]
        resources: BTreeMap<String, String>,
    },

    AddInstance {
        parent_path: String,
        instance: Instance,
    },

    RemoveInstance {
        instance_path: String,
    },

    /// Asks the agent to report the status of all its instances.
    SendInstances,

    /// Asks the agent to republish all its exports.
    Resynchronize,

    // ---------------------------------------------------------------------
    // agent -> DM
    // ---------------------------------------------------------------------
    Heartbeat {
        application: String,
        scoped_path: String,
        agent_id: AgentId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ip_address: Option<String>,
    },

    InstanceChanged {
        application: String,
        instance_path: String,
        new_status: InstanceStatus,
        #[serde(default)]
        imports: BTreeMap<String, Vec<Import>>,
    },

    InstanceRemoved {
        application: String,
        instance_path: String,
    },

    /// The agent is shutting down its machine.
    MachineDown {
        application: String,
        scoped_path: String,
    },

    /// Autonomic event raised by a probe on the agent.
    Autonomic {
        application: String,
        scoped_path: String,
        event_name: String,
    },

    // ---------------------------------------------------------------------
    // agent <-> agent
    // ---------------------------------------------------------------------
    /// Variables exported under one prefix by an instance.
    AddImport {
        application: String,
        prefix: String,
        exporter_path: String,
        component_name: String,
        exported_vars: BTreeMap<String, String>,
    },

    /// The instance at `removed_path` no longer exports `prefix`.
    RemoveImport {
        application: String,
        prefix: String,
        removed_path: String,
    },

    /// Asks exporters of `prefix` to publish their variables again.
    RequestImport {
        application: String,
        prefix: String,
        requester_path: String,
    },
}

impl Message {
    pub fn direction(&self) -> Direction {
        match self {
            Message::SetScopedInstance { .. }
            | Message::ChangeInstanceState { .. }
            | Message::AddInstance { .. }
            | Message::RemoveInstance { .. }
            | Message::SendInstances
            | Message::Resynchronize => Direction::DmToAgent,

            Message::Heartbeat { .. }
            | Message::InstanceChanged { .. }
            | Message::InstanceRemoved { .. }
            | Message::MachineDown { .. }
            | Message::Autonomic { .. } => Direction::AgentToDm,

            Message::AddImport { .. }
            | Message::RemoveImport { .. }
            | Message::RequestImport { .. } => Direction::AgentToAgent,
        }
    }

    /// Kind name, matching the serialized `kind` tag.
    pub fn kind(&self) -> &'static str {
        use message_kinds::*;
        match self {
            Message::SetScopedInstance { .. } => SET_SCOPED_INSTANCE,
            Message::ChangeInstanceState { .. } => CHANGE_INSTANCE_STATE,
            Message::AddInstance { .. } => ADD_INSTANCE,
            Message::RemoveInstance { .. } => REMOVE_INSTANCE,
            Message::SendInstances => SEND_INSTANCES,
            Message::Resynchronize => RESYNCHRONIZE,
            Message::Heartbeat { .. } => HEARTBEAT,
            Message::InstanceChanged { .. } => INSTANCE_CHANGED,
            Message::InstanceRemoved { .. } => INSTANCE_REMOVED,
            Message::MachineDown { .. } => MACHINE_DOWN,
            Message::Autonomic { .. } => AUTONOMIC,
            Message::AddImport { .. } => ADD_IMPORT,
            Message::RemoveImport { .. } => REMOVE_IMPORT,
            Message::RequestImport { .. } => REQUEST_IMPORT,
        }
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{decode, encode, MessageEnvelope};
    use fleet_model::Component;
    use rstest::rstest;

    fn add_import() -> Message {
        Message::AddImport {
            application: "lamp".to_string(),
            prefix: "MySQL".to_string(),
            exporter_path: "/db/mysql".to_string(),
            component_name: "MySQL".to_string(),
            exported_vars: BTreeMap::from([
                ("MySQL.port".to_string(), "3306".to_string()),
                ("MySQL.ip".to_string(), "192.168.1.15".to_string()),
            ]),
        }
    }

    #[rstest]
    #[case(Message::SendInstances, Direction::DmToAgent)]
    #[case(Message::Resynchronize, Direction::DmToAgent)]
    #[case(
        Message::MachineDown { application: "a".into(), scoped_path: "/vm".into() },
        Direction::AgentToDm
    )]
    #[case(add_import(), Direction::AgentToAgent)]
    fn test_direction(#[case] message: Message, #[case] expected: Direction) {
        assert_eq!(message.direction(), expected);
    }

    #[test]
    fn test_kind_matches_serialized_tag() {
        let json = serde_json::to_value(add_import()).unwrap();
        assert_eq!(json["kind"], message_kinds::ADD_IMPORT);
        assert_eq!(json["exported_vars"]["MySQL.port"], "3306");
    }

    #[test]
    fn test_scoped_instance_survives_the_wire() {
        let instance = Instance::new("vm", Component::new("VM", "target"))
            .with_child(Instance::new("tomcat", Component::new("Tomcat", "logger")));
        let envelope = MessageEnvelope::new(Message::SetScopedInstance {
            application: "lamp".to_string(),
            scoped_path: "/vm".to_string(),
            scoped_instance: instance.clone(),
            external_exports: BTreeMap::new(),
        });

        let decoded = decode(&encode(&envelope).unwrap()).unwrap();
        match decoded.message {
            Message::SetScopedInstance { scoped_instance, .. } => {
                assert_eq!(scoped_instance, instance);
            }
            other => panic!("unexpected message: {other}"),
        }
    }

    #[test]
    fn test_heartbeat_omits_missing_ip() {
        let json = serde_json::to_string(&Message::Heartbeat {
            application: "lamp".to_string(),
            scoped_path: "/vm".to_string(),
            agent_id: AgentId::new(),
            ip_address: None,
        })
        .unwrap();
        assert!(json.contains("\"kind\":\"heartbeat\""));
        assert!(!json.contains("ip_address"));
    }
}
