//! Agent error types.

use fleet_model::{InstanceStatus, ModelError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    /// No scoped instance received from the DM yet.
    #[error("no model received from the DM yet")]
    NoModel,

    #[error("unknown instance {0}")]
    UnknownInstance(String),

    #[error("message for {got} ignored, this agent manages {expected}")]
    WrongAgent { expected: String, got: String },

    #[error("{path}: cannot go from {from} to {to}")]
    InvalidTransition {
        path: String,
        from: InstanceStatus,
        to: InstanceStatus,
    },

    #[error("{path}: parent is {parent_status}")]
    ParentNotReady {
        path: String,
        parent_status: InstanceStatus,
    },

    #[error("plugin {plugin} failed to {action} {path}: {message}")]
    Plugin {
        plugin: String,
        action: &'static str,
        path: String,
        message: String,
    },

    #[error(transparent)]
    Model(#[from] ModelError),
}
