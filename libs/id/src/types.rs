//! Identifier kinds used across the DM and the agents.

use crate::define_id;

define_id!(
    /// Identifies one message envelope on the bus.
    MessageId,
    "msg"
);

define_id!(
    /// Identifies a machine created by a target handler.
    MachineId,
    "vm"
);

define_id!(
    /// Identifies one agent process (regenerated on every agent start).
    AgentId,
    "agent"
);
