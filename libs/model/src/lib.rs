//! # fleet-model
//!
//! In-memory application model consumed by the messaging core.
//!
//! The model is produced by an external loader (the graph/instance parser is
//! not part of this workspace). The core only relies on:
//!
//! - components with exported/imported variable tables
//! - an owned instance tree with stable `/root/child` paths
//! - the instance lifecycle status enumeration
//!
//! Instances are owned by their [`Application`]. A *scoped* instance is the
//! root of a deployable unit: one machine, one agent.

mod application;
mod component;
mod error;
mod instance;
pub mod paths;
mod status;
pub mod variables;

pub use application::Application;
pub use component::{Component, ImportedVariable, TARGET_INSTALLER};
pub use error::ModelError;
pub use instance::{data, Import, Instance};
pub use status::InstanceStatus;
