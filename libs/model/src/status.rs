//! Instance lifecycle status.
//!
//! ```text
//! NOT_DEPLOYED -> DEPLOYING -> DEPLOYED_STOPPED <-> STARTING -> DEPLOYED_STARTED
//!      ^                                                             |
//!      +------------------ UNDEPLOYING <---- STOPPING <--------------+
//!
//! PROBLEM is reachable from any active state when heartbeats stop.
//! ```

use serde::{Deserialize, Serialize};

/// Lifecycle status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    #[default]
    NotDeployed,
    Deploying,
    DeployedStopped,
    /// Start requested; waiting for mandatory imports.
    Starting,
    DeployedStarted,
    Stopping,
    Undeploying,
    Problem,
}

impl InstanceStatus {
    /// Stable states are the ones an instance can rest in.
    pub fn is_stable(&self) -> bool {
        matches!(
            self,
            Self::NotDeployed | Self::DeployedStopped | Self::DeployedStarted
        )
    }

    /// States from which a scoped instance is undeployed by tearing down its
    /// machine.
    pub fn allows_target_undeploy(&self) -> bool {
        matches!(
            self,
            Self::DeployedStarted | Self::Deploying | Self::Starting | Self::Problem
        )
    }

    /// Agents are not expected to send heartbeats in these states.
    pub fn expects_heartbeats(&self) -> bool {
        !matches!(
            self,
            Self::NotDeployed | Self::Deploying | Self::Undeploying
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotDeployed => "not_deployed",
            Self::Deploying => "deploying",
            Self::DeployedStopped => "deployed_stopped",
            Self::Starting => "starting",
            Self::DeployedStarted => "deployed_started",
            Self::Stopping => "stopping",
            Self::Undeploying => "undeploying",
            Self::Problem => "problem",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s.to_ascii_lowercase().as_str() {
            "not_deployed" => Self::NotDeployed,
            "deploying" => Self::Deploying,
            "deployed_stopped" => Self::DeployedStopped,
            "starting" => Self::Starting,
            "deployed_started" => Self::DeployedStarted,
            "stopping" => Self::Stopping,
            "undeploying" => Self::Undeploying,
            "problem" => Self::Problem,
            other => return Err(format!("unknown instance status: {other}")),
        };
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(InstanceStatus::NotDeployed, false)]
    #[case(InstanceStatus::Deploying, false)]
    #[case(InstanceStatus::Undeploying, false)]
    #[case(InstanceStatus::DeployedStarted, true)]
    #[case(InstanceStatus::DeployedStopped, true)]
    #[case(InstanceStatus::Starting, true)]
    #[case(InstanceStatus::Problem, true)]
    fn test_expects_heartbeats(#[case] status: InstanceStatus, #[case] expected: bool) {
        assert_eq!(status.expects_heartbeats(), expected);
    }

    #[test]
    fn test_display_parse_roundtrip() {
        for status in [
            InstanceStatus::NotDeployed,
            InstanceStatus::Deploying,
            InstanceStatus::DeployedStopped,
            InstanceStatus::Starting,
            InstanceStatus::DeployedStarted,
            InstanceStatus::Stopping,
            InstanceStatus::Undeploying,
            InstanceStatus::Problem,
        ] {
            assert_eq!(status.to_string().parse::<InstanceStatus>(), Ok(status));
        }
    }

    #[test]
    fn test_serde_snake_case() {
        let json = serde_json::to_string(&InstanceStatus::DeployedStarted).unwrap();
        assert_eq!(json, "\"deployed_started\"");
    }

    #[test]
    fn test_target_undeploy_states() {
        assert!(InstanceStatus::Problem.allows_target_undeploy());
        assert!(!InstanceStatus::DeployedStopped.allows_target_undeploy());
        assert!(!InstanceStatus::NotDeployed.allows_target_undeploy());
    }
}
