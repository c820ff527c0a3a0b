//! # fleet-messaging
//!
//! Everything between the domain code and the wire:
//!
//! - [`MessagingContext`]: routing addresses computed from the model
//! - [`TransportClient`]: the pluggable backend, created through a
//!   [`FactoryRegistry`]
//! - [`ReconfigurableClient`]: a client slot whose backend can be replaced at
//!   runtime while its subscriptions and inbound queue survive
//! - [`MessageProcessor`]: the consumer loop dispatching inbound messages
//! - [`AgentClient`] / [`DmClient`]: role facades translating domain
//!   operations into (context, message) pairs
//!
//! An in-memory backend is registered under [`memory::IN_MEMORY`].

mod agent;
mod client;
pub mod context;
mod dismissed;
mod dm;
mod error;
pub mod memory;
mod processor;
mod registry;
mod transport;

pub use agent::AgentClient;
pub use client::ReconfigurableClient;
pub use context::{topic_for, MessagingContext, RecipientKind, ThoseThat};
pub use dismissed::DismissedClient;
pub use dm::DmClient;
pub use error::MessagingError;
pub use processor::{MessageHandler, MessageProcessor};
pub use registry::FactoryRegistry;
pub use transport::{InboundSender, TransportClient, TransportConfig, TransportFactory};

/// Start or stop listening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerCommand {
    Start,
    Stop,
}
