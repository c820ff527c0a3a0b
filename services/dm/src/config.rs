//! Configuration for the deployment manager.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// Deployment manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Messaging domain shared with the agents.
    pub domain: String,

    /// Transport backend name (`FLEET_TRANSPORT`, default `in-memory`).
    pub transport: String,

    /// Target handler used when a scoped instance names none.
    pub default_target: String,

    /// Period of the background timer in milliseconds.
    pub timer_interval_ms: u64,

    /// Seconds between two heartbeat checks.
    pub heartbeat_check_secs: u64,

    /// Missed heartbeat checks tolerated before an agent is in problem.
    pub heartbeat_miss_threshold: u32,

    /// Root of the component resource bundles (`<root>/<component>/...`).
    pub resources_dir: Option<PathBuf>,

    /// JSON file holding the applications to manage at startup.
    pub applications_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let domain = std::env::var("FLEET_DOMAIN").unwrap_or_else(|_| "default".to_string());

        let transport =
            std::env::var("FLEET_TRANSPORT").unwrap_or_else(|_| "in-memory".to_string());

        let default_target =
            std::env::var("FLEET_DEFAULT_TARGET").unwrap_or_else(|_| "in-memory".to_string());

        let timer_interval_ms = parse_var("FLEET_TIMER_INTERVAL_MS", 1000)?;
        let heartbeat_check_secs = parse_var("FLEET_HEARTBEAT_CHECK_SECS", 10)?;
        let heartbeat_miss_threshold = parse_var("FLEET_HEARTBEAT_MISS_THRESHOLD", 2)?;

        let resources_dir = std::env::var("FLEET_RESOURCES_DIR").ok().map(PathBuf::from);
        let applications_file = std::env::var("FLEET_APPLICATIONS_FILE")
            .ok()
            .map(PathBuf::from);

        let log_level = std::env::var("FLEET_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            domain,
            transport,
            default_target,
            timer_interval_ms,
            heartbeat_check_secs,
            heartbeat_miss_threshold,
            resources_dir,
            applications_file,
            log_level,
        })
    }

    pub fn timer_interval(&self) -> Duration {
        Duration::from_millis(self.timer_interval_ms)
    }

    pub fn heartbeat_check_period(&self) -> Duration {
        Duration::from_secs(self.heartbeat_check_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            domain: "default".to_string(),
            transport: "in-memory".to_string(),
            default_target: "in-memory".to_string(),
            timer_interval_ms: 1000,
            heartbeat_check_secs: 10,
            heartbeat_miss_threshold: 2,
            resources_dir: None,
            applications_file: None,
            log_level: "info".to_string(),
        }
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("invalid value for {name}: {raw}")),
        Err(_) => Ok(default),
    }
}
