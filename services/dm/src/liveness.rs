//! Heartbeat liveness tracking.
//!
//! Each scoped instance has a missed-heartbeat counter kept in a side table.
//! Every check increments the counters of instances expecting heartbeats;
//! once a counter exceeds the threshold the instance goes to `problem`.

use std::collections::HashMap;

use fleet_model::InstanceStatus;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::managed::ManagedApplication;
use crate::notifications::Notifier;
use crate::DmError;

/// Result of acknowledging a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// The instance is not supposed to have an agent (stale heartbeat).
    Ignored,
    /// Already `deployed_started`.
    Alive,
    /// Moved to `deployed_started` from another status.
    Recovered { previous: InstanceStatus },
}

pub struct LivenessTracker {
    threshold: u32,
    /// (application, scoped path) -> consecutive missed checks.
    misses: Mutex<HashMap<(String, String), u32>>,
}

impl LivenessTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            misses: Mutex::new(HashMap::new()),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub async fn missed(&self, application: &str, scoped_path: &str) -> u32 {
        self.misses
            .lock()
            .await
            .get(&(application.to_string(), scoped_path.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Records a heartbeat: resets the counter and restores
    /// `deployed_started`, keeping the running-since timestamp when the
    /// instance was already started.
    pub async fn acknowledge(
        &self,
        app: &ManagedApplication,
        scoped_path: &str,
        notifier: &Notifier,
    ) -> Result<HeartbeatOutcome, DmError> {
        let mut model = app.model().write().await;
        let instance = model.get_mut(scoped_path)?;
        if !instance.is_scoped() {
            return Err(DmError::InvalidArgument(format!(
                "{scoped_path} is not a scoped instance"
            )));
        }

        let previous = instance.status;
        if matches!(previous, InstanceStatus::NotDeployed | InstanceStatus::Undeploying) {
            warn!(
                application = %app.name(),
                scoped = %scoped_path,
                status = %previous,
                "Ignoring heartbeat from an agent that should not be running"
            );
            return Ok(HeartbeatOutcome::Ignored);
        }

        let missed = self
            .misses
            .lock()
            .await
            .remove(&(app.name().to_string(), scoped_path.to_string()))
            .unwrap_or(0);

        if previous == InstanceStatus::DeployedStarted {
            return Ok(HeartbeatOutcome::Alive);
        }

        instance.set_status(InstanceStatus::DeployedStarted);
        notifier.instance_changed(app.name(), scoped_path, InstanceStatus::DeployedStarted);
        if missed > self.threshold {
            info!(application = %app.name(), scoped = %scoped_path, "Agent is reachable again");
        }
        Ok(HeartbeatOutcome::Recovered { previous })
    }

    /// Runs one check over the scoped instances of an application.
    ///
    /// Returns the paths that went to `problem` during this check.
    #[instrument(skip(self, app, notifier), fields(application = %app.name()))]
    pub async fn check(&self, app: &ManagedApplication, notifier: &Notifier) -> Vec<String> {
        let mut model = app.model().write().await;
        let mut misses = self.misses.lock().await;
        let mut flipped = Vec::new();

        for scoped_path in model.scoped_paths() {
            let Some(instance) = model.find_mut(&scoped_path) else {
                continue;
            };
            let key = (app.name().to_string(), scoped_path.clone());

            if !instance.status.expects_heartbeats() {
                misses.remove(&key);
                continue;
            }

            let count = misses.entry(key).or_insert(0);
            *count += 1;

            if *count > self.threshold && instance.status != InstanceStatus::Problem {
                warn!(
                    scoped = %scoped_path,
                    missed = *count,
                    "Agent missed too many heartbeats"
                );
                instance.set_status(InstanceStatus::Problem);
                notifier.instance_changed(app.name(), &scoped_path, InstanceStatus::Problem);
                flipped.push(scoped_path);
            }
        }

        flipped
    }

    pub async fn forget(&self, application: &str, scoped_path: &str) {
        self.misses
            .lock()
            .await
            .remove(&(application.to_string(), scoped_path.to_string()));
    }

    pub async fn forget_application(&self, application: &str) {
        self.misses.lock().await.retain(|(app, _), _| app != application);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_model::{Application, Component, Instance};
    use rstest::rstest;
    use tokio::sync::broadcast::error::TryRecvError;

    fn app_with(status: InstanceStatus) -> ManagedApplication {
        let mut vm = Instance::new("vm", Component::new("VM", "target"));
        vm.set_status(status);
        ManagedApplication::new(Application::new("lamp", "Lamp").with_root(vm))
    }

    async fn status(app: &ManagedApplication) -> InstanceStatus {
        app.model().read().await.get("/vm").unwrap().status
    }

    #[tokio::test]
    async fn test_third_missed_check_flips_to_problem_once() {
        let app = app_with(InstanceStatus::DeployedStarted);
        let tracker = LivenessTracker::new(2);
        let notifier = Notifier::default();
        let mut notifications = notifier.subscribe();

        assert!(tracker.check(&app, &notifier).await.is_empty());
        assert!(tracker.check(&app, &notifier).await.is_empty());
        assert_eq!(status(&app).await, InstanceStatus::DeployedStarted);

        assert_eq!(tracker.check(&app, &notifier).await, vec!["/vm".to_string()]);
        assert_eq!(status(&app).await, InstanceStatus::Problem);

        tracker.check(&app, &notifier).await;
        tracker.check(&app, &notifier).await;

        let notification = notifications.try_recv().unwrap();
        assert_eq!(notification.path, "/vm");
        assert_eq!(notification.status, InstanceStatus::Problem);
        assert!(matches!(notifications.try_recv(), Err(TryRecvError::Empty)));
    }

    #[rstest]
    #[case(InstanceStatus::NotDeployed)]
    #[case(InstanceStatus::Deploying)]
    #[case(InstanceStatus::Undeploying)]
    #[tokio::test]
    async fn test_no_heartbeat_expected(#[case] initial: InstanceStatus) {
        let app = app_with(initial);
        let tracker = LivenessTracker::new(2);
        let notifier = Notifier::default();

        for _ in 0..5 {
            assert!(tracker.check(&app, &notifier).await.is_empty());
        }
        assert_eq!(status(&app).await, initial);
        assert_eq!(tracker.missed("lamp", "/vm").await, 0);
    }

    #[tokio::test]
    async fn test_heartbeat_resets_counter() {
        let app = app_with(InstanceStatus::DeployedStarted);
        let tracker = LivenessTracker::new(2);
        let notifier = Notifier::default();

        tracker.check(&app, &notifier).await;
        tracker.check(&app, &notifier).await;
        assert_eq!(
            tracker.acknowledge(&app, "/vm", &notifier).await.unwrap(),
            HeartbeatOutcome::Alive
        );
        assert_eq!(tracker.missed("lamp", "/vm").await, 0);

        tracker.check(&app, &notifier).await;
        tracker.check(&app, &notifier).await;
        assert_eq!(status(&app).await, InstanceStatus::DeployedStarted);
    }

    #[tokio::test]
    async fn test_heartbeat_recovers_problem() {
        let app = app_with(InstanceStatus::Problem);
        let tracker = LivenessTracker::new(2);
        let notifier = Notifier::default();

        let outcome = tracker.acknowledge(&app, "/vm", &notifier).await.unwrap();
        assert_eq!(
            outcome,
            HeartbeatOutcome::Recovered {
                previous: InstanceStatus::Problem
            }
        );
        assert_eq!(status(&app).await, InstanceStatus::DeployedStarted);
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_running_since() {
        let app = app_with(InstanceStatus::DeployedStarted);
        let since = app.model().read().await.get("/vm").unwrap().running_since();
        assert!(since.is_some());

        let tracker = LivenessTracker::new(2);
        tracker
            .acknowledge(&app, "/vm", &Notifier::default())
            .await
            .unwrap();
        let after = app.model().read().await.get("/vm").unwrap().running_since();
        assert_eq!(since, after);
    }

    #[tokio::test]
    async fn test_stale_heartbeat_is_ignored() {
        let app = app_with(InstanceStatus::NotDeployed);
        let tracker = LivenessTracker::new(2);
        let outcome = tracker
            .acknowledge(&app, "/vm", &Notifier::default())
            .await
            .unwrap();
        assert_eq!(outcome, HeartbeatOutcome::Ignored);
        assert_eq!(status(&app).await, InstanceStatus::NotDeployed);
    }
}
