//! # fleet-messages
//!
//! Messages exchanged between the DM and its agents.
//!
//! ## Design Principles
//!
//! - Messages are immutable once built
//! - Every message has exactly one direction (DM to agent, agent to DM,
//!   agent to agent)
//! - Messages travel inside a [`MessageEnvelope`] carrying a unique id and
//!   the send time; the id is the only correlation handle, commands and
//!   notifications are never implicitly paired
//! - The wire format is JSON; transports move opaque bytes

mod codec;
mod envelope;
mod error;
mod types;

pub use codec::{decode, encode};
pub use envelope::MessageEnvelope;
pub use error::MessageError;
pub use types::*;
