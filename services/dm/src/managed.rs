//! Runtime state the DM keeps next to each application model.

use std::collections::{BTreeMap, HashMap};

use fleet_messages::Message;
use fleet_model::Application;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// Flat property bag describing where a scoped instance is deployed.
pub type TargetProperties = BTreeMap<String, String>;

/// Key of the target properties applied to scoped instances without their
/// own entry.
pub const DEFAULT_TARGET_KEY: &str = "default";

/// An application plus its runtime-only state. Nothing here is persisted.
pub struct ManagedApplication {
    name: String,
    model: RwLock<Application>,

    /// Scoped instance path -> messages waiting for the agent.
    awaiting: Mutex<HashMap<String, Vec<Message>>>,

    /// Scoped instance path (or [`DEFAULT_TARGET_KEY`]) -> target properties.
    targets: RwLock<BTreeMap<String, TargetProperties>>,

    /// Serializes flushes so queued messages leave in queue order.
    delivery: Mutex<()>,
}

impl ManagedApplication {
    pub fn new(application: Application) -> Self {
        Self {
            name: application.name.clone(),
            model: RwLock::new(application),
            awaiting: Mutex::new(HashMap::new()),
            targets: RwLock::new(BTreeMap::new()),
            delivery: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model(&self) -> &RwLock<Application> {
        &self.model
    }

    pub(crate) fn delivery_lock(&self) -> &Mutex<()> {
        &self.delivery
    }

    /// Associates target properties with a scoped instance path, or with
    /// [`DEFAULT_TARGET_KEY`].
    pub async fn set_target_properties(&self, key: impl Into<String>, properties: TargetProperties) {
        self.targets.write().await.insert(key.into(), properties);
    }

    /// Target properties of a scoped instance, falling back to the default
    /// entry.
    pub async fn target_properties(&self, scoped_path: &str) -> TargetProperties {
        let targets = self.targets.read().await;
        targets
            .get(scoped_path)
            .or_else(|| targets.get(DEFAULT_TARGET_KEY))
            .cloned()
            .unwrap_or_default()
    }

    /// Queues a message for the agent of a scoped instance.
    pub async fn store_awaiting_message(&self, scoped_path: &str, message: Message) {
        let mut awaiting = self.awaiting.lock().await;
        let queue = awaiting.entry(scoped_path.to_string()).or_default();
        queue.push(message);
        debug!(
            application = %self.name,
            scoped = %scoped_path,
            queued = queue.len(),
            "Message stored until the agent is reachable"
        );
    }

    /// Takes every message queued for a scoped instance, in queue order.
    pub async fn remove_awaiting_messages(&self, scoped_path: &str) -> Vec<Message> {
        self.awaiting
            .lock()
            .await
            .remove(scoped_path)
            .unwrap_or_default()
    }

    pub async fn awaiting_count(&self, scoped_path: &str) -> usize {
        self.awaiting
            .lock()
            .await
            .get(scoped_path)
            .map_or(0, Vec::len)
    }

    /// Scoped paths with at least one queued message.
    pub async fn paths_with_awaiting_messages(&self) -> Vec<String> {
        self.awaiting
            .lock()
            .await
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(path, _)| path.clone())
            .collect()
    }

    pub async fn clear_awaiting_messages(&self) {
        self.awaiting.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn managed() -> ManagedApplication {
        ManagedApplication::new(Application::new("lamp", "Lamp"))
    }

    #[tokio::test]
    async fn test_awaiting_messages_keep_order() {
        let app = managed();
        app.store_awaiting_message("/vm", Message::SendInstances).await;
        app.store_awaiting_message("/vm", Message::Resynchronize).await;
        app.store_awaiting_message("/other", Message::SendInstances).await;

        assert_eq!(app.awaiting_count("/vm").await, 2);
        assert_eq!(
            app.remove_awaiting_messages("/vm").await,
            vec![Message::SendInstances, Message::Resynchronize]
        );
        assert_eq!(app.awaiting_count("/vm").await, 0);
        assert_eq!(app.paths_with_awaiting_messages().await, vec!["/other".to_string()]);
    }

    #[tokio::test]
    async fn test_concurrent_producers_lose_nothing() {
        let app = Arc::new(managed());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let app = Arc::clone(&app);
            handles.push(tokio::spawn(async move {
                for _ in 0..25 {
                    app.store_awaiting_message("/vm", Message::SendInstances).await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(app.remove_awaiting_messages("/vm").await.len(), 200);
    }

    #[tokio::test]
    async fn test_target_properties_fall_back_to_default() {
        let app = managed();
        app.set_target_properties(
            DEFAULT_TARGET_KEY,
            TargetProperties::from([("handler".to_string(), "in-memory".to_string())]),
        )
        .await;
        app.set_target_properties(
            "/vm2",
            TargetProperties::from([("handler".to_string(), "docker".to_string())]),
        )
        .await;

        assert_eq!(app.target_properties("/vm1").await["handler"], "in-memory");
        assert_eq!(app.target_properties("/vm2").await["handler"], "docker");
    }
}
