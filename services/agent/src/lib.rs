//! # fleet-agent
//!
//! Agent running on each machine of the fleet. It receives its part of the
//! model from the DM, runs the instance lifecycle through plugins, trades
//! exports and imports with the other agents and sends heartbeats.

pub mod config;
mod error;
pub mod handler;
pub mod heartbeat;
pub mod imports;
pub mod lifecycle;
pub mod model;
pub mod plugins;

pub use config::Config;
pub use error::AgentError;
pub use handler::AgentMessageHandler;
pub use lifecycle::AgentLifecycle;
pub use model::LocalModel;
pub use plugins::{LoggerPlugin, Plugin, PluginContext, PluginRegistry};
