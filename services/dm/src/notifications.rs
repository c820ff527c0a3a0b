//! Instance change notifications.

use fleet_model::InstanceStatus;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

/// One instance state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceNotification {
    pub application: String,
    pub path: String,
    pub status: InstanceStatus,
}

/// An autonomic event raised by an agent probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AutonomicEvent {
    pub application: String,
    pub scoped_path: String,
    pub event_name: String,
}

/// Fans notifications out to whoever listens. Sends never block and never
/// fail; without receivers notifications are dropped.
#[derive(Debug, Clone)]
pub struct Notifier {
    instances: broadcast::Sender<InstanceNotification>,
    autonomic: broadcast::Sender<AutonomicEvent>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (instances, _) = broadcast::channel(capacity);
        let (autonomic, _) = broadcast::channel(capacity);
        Self {
            instances,
            autonomic,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InstanceNotification> {
        self.instances.subscribe()
    }

    pub fn subscribe_autonomic(&self) -> broadcast::Receiver<AutonomicEvent> {
        self.autonomic.subscribe()
    }

    pub fn instance_changed(&self, application: &str, path: &str, status: InstanceStatus) {
        debug!(application, instance = %path, status = %status, "Instance changed");
        let _ = self.instances.send(InstanceNotification {
            application: application.to_string(),
            path: path.to_string(),
            status,
        });
    }

    pub fn autonomic(&self, event: AutonomicEvent) {
        let _ = self.autonomic.send(event);
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(256)
    }
}
