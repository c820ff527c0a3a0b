//! Transport factory registry.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tracing::info;

use crate::{InboundSender, MessagingError, TransportClient, TransportConfig, TransportFactory};

/// Registry of transport factories keyed by backend name.
///
/// Registrations are announced on a broadcast channel so clients waiting for
/// a backend can retry their swap.
pub struct FactoryRegistry {
    factories: RwLock<HashMap<String, Arc<dyn TransportFactory>>>,
    registered: broadcast::Sender<String>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        let (registered, _) = broadcast::channel(16);
        Self {
            factories: RwLock::new(HashMap::new()),
            registered,
        }
    }

    /// Registers a factory, replacing any factory with the same name.
    pub async fn register(&self, factory: Arc<dyn TransportFactory>) {
        let name = factory.name().to_string();
        self.factories.write().await.insert(name.clone(), factory);
        info!(backend = %name, "Transport factory registered");
        // No receiver simply means nobody is waiting.
        let _ = self.registered.send(name);
    }

    pub async fn unregister(&self, name: &str) -> bool {
        self.factories.write().await.remove(name).is_some()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.factories.read().await.contains_key(name)
    }

    /// Names of the registered backends, sorted.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Receives the name of every factory registered from now on.
    pub fn subscribe_registrations(&self) -> broadcast::Receiver<String> {
        self.registered.subscribe()
    }

    /// Builds a client through the factory registered under `name`.
    pub async fn create(
        &self,
        name: &str,
        config: &TransportConfig,
        inbound: InboundSender,
    ) -> Result<Arc<dyn TransportClient>, MessagingError> {
        let factory = self
            .factories
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| MessagingError::UnknownBackend(name.to_string()))?;
        factory.create(config, inbound).await
    }
}

impl Default for FactoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryBroker, InMemoryFactory, IN_MEMORY};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_unknown_backend() {
        let registry = FactoryRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = registry
            .create("rabbitmq", &TransportConfig::new("d"), tx)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, MessagingError::UnknownBackend(name) if name == "rabbitmq"));
    }

    #[tokio::test]
    async fn test_register_announces_name() {
        let registry = FactoryRegistry::new();
        let mut announcements = registry.subscribe_registrations();
        registry
            .register(Arc::new(InMemoryFactory::new(InMemoryBroker::new())))
            .await;

        assert_eq!(announcements.recv().await.unwrap(), IN_MEMORY);
        assert_eq!(registry.names().await, vec![IN_MEMORY.to_string()]);
        assert!(registry.unregister(IN_MEMORY).await);
        assert!(!registry.contains(IN_MEMORY).await);
    }
}
