//! # fleet-id
//!
//! Typed identifiers for the fleet DM and its agents.
//!
//! Identifiers use a prefixed format, `{prefix}_{ulid}`:
//!
//! - `msg_01HV4Z2WQXKJNM8GPQY6VBKC3D` for a message envelope
//! - `vm_01HV4Z3MXNKPQR9HSTZ7WCLD4E` for a machine created by a target handler
//! - `agent_01HV4Z4NYPLTRS0JTUA8XDME5F` for an agent process
//!
//! The prefix keeps the kinds apart when they are logged or sent over the
//! wire; the ULID keeps them sortable by creation time.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for the macro expansion.
pub use ulid::Ulid;
