//! Configuration for the agent.

use anyhow::{Context, Result};
use fleet_id::AgentId;

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Identifier of this agent process, new on every start.
    pub agent_id: AgentId,

    /// Application the scoped instance belongs to.
    pub application: String,

    /// Path of the scoped instance this agent manages.
    pub scoped_path: String,

    /// IP address reported with heartbeats.
    pub ip_address: Option<String>,

    /// Messaging domain shared with the DM.
    pub domain: String,

    /// Transport backend name.
    pub transport: String,

    /// Heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let application =
            std::env::var("FLEET_APPLICATION").context("FLEET_APPLICATION must be set")?;
        let scoped_path =
            std::env::var("FLEET_SCOPED_PATH").context("FLEET_SCOPED_PATH must be set")?;
        let ip_address = std::env::var("FLEET_IP_ADDRESS").ok();

        let domain = std::env::var("FLEET_DOMAIN").unwrap_or_else(|_| "default".to_string());
        let transport =
            std::env::var("FLEET_TRANSPORT").unwrap_or_else(|_| "in-memory".to_string());

        let heartbeat_interval_secs = match std::env::var("FLEET_HEARTBEAT_INTERVAL") {
            Ok(raw) => raw
                .parse()
                .with_context(|| format!("invalid value for FLEET_HEARTBEAT_INTERVAL: {raw}"))?,
            Err(_) => 5,
        };

        let log_level = std::env::var("FLEET_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            agent_id: AgentId::new(),
            application,
            scoped_path,
            ip_address,
            domain,
            transport,
            heartbeat_interval_secs,
            log_level,
        })
    }

    /// Owner name of the agent's messaging client.
    pub fn owner(&self) -> String {
        format!("agent {}{}", self.application, self.scoped_path)
    }
}
