//! Machine configurations still in progress.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::targets::{TargetContext, TargetHandler};

/// A configuration the target handler reported as pending.
pub struct PendingConfiguration {
    pub machine_id: String,
    pub context: TargetContext,
    pub handler: Arc<dyn TargetHandler>,
}

/// Holds pending configurations until the timer polls them again.
#[derive(Default)]
pub struct TargetConfigurator {
    pending: Mutex<Vec<PendingConfiguration>>,
}

impl TargetConfigurator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn submit(&self, configuration: PendingConfiguration) {
        self.pending.lock().await.push(configuration);
    }

    /// Takes every pending configuration; the caller requeues those still
    /// pending after polling.
    pub async fn take_all(&self) -> Vec<PendingConfiguration> {
        std::mem::take(&mut *self.pending.lock().await)
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drops the configuration of one scoped instance.
    pub async fn cancel(&self, application: &str, scoped_path: &str) {
        self.pending.lock().await.retain(|p| {
            p.context.application != application || p.context.scoped_path != scoped_path
        });
    }

    pub async fn cancel_application(&self, application: &str) {
        self.pending
            .lock()
            .await
            .retain(|p| p.context.application != application);
    }
}
