//! # fleet-dm
//!
//! The deployment manager drives the instance lifecycle of every managed
//! application and talks to one agent per scoped instance over the bus.
//!
//! ## Architecture
//!
//! - **Instances Manager**: state transitions, target provisioning,
//!   awaiting-message store, bulk operations, restart reconciliation
//! - **Liveness Tracker**: missed-heartbeat counters per scoped instance
//! - **Message Handler**: applies what agents report
//! - **Timer Worker**: periodic flush, configuration polling and heartbeat
//!   checks

pub mod config;
pub mod configurator;
mod error;
pub mod handler;
pub mod lifecycle;
pub mod liveness;
pub mod managed;
pub mod notifications;
pub mod resources;
pub mod targets;
pub mod worker;

pub use config::Config;
pub use error::DmError;
pub use handler::DmMessageHandler;
pub use lifecycle::InstancesManager;
pub use managed::{ManagedApplication, TargetProperties};
pub use notifications::{AutonomicEvent, InstanceNotification, Notifier};
pub use targets::{InMemoryTargetHandler, TargetHandler, TargetResolver};
pub use worker::TimerWorker;
