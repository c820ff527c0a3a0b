//! In-memory transport backend.
//!
//! A broker shared by every client of a process. Messages are encoded to
//! their wire form on publish and decoded once per subscriber, so the
//! backend exercises the same codec as a networked one.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use fleet_messages::{decode, encode, MessageEnvelope};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    InboundSender, MessagingContext, MessagingError, TransportClient, TransportConfig,
    TransportFactory,
};

/// Backend name of the in-memory transport.
pub const IN_MEMORY: &str = "in-memory";

type ClientKey = u64;

/// Routing table of the in-memory backend.
pub struct InMemoryBroker {
    next_client: AtomicU64,
    /// Routing key -> subscribed clients.
    routes: Mutex<HashMap<String, HashMap<ClientKey, InboundSender>>>,
}

impl InMemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_client: AtomicU64::new(1),
            routes: Mutex::new(HashMap::new()),
        })
    }

    /// The process-wide broker.
    pub fn shared() -> Arc<Self> {
        static SHARED: OnceLock<Arc<InMemoryBroker>> = OnceLock::new();
        Arc::clone(SHARED.get_or_init(InMemoryBroker::new))
    }

    fn next_key(&self) -> ClientKey {
        self.next_client.fetch_add(1, Ordering::SeqCst)
    }

    async fn subscribe(&self, key: ClientKey, routing_key: String, inbound: InboundSender) {
        self.routes
            .lock()
            .await
            .entry(routing_key)
            .or_default()
            .insert(key, inbound);
    }

    async fn unsubscribe(&self, key: ClientKey, routing_key: &str) {
        let mut routes = self.routes.lock().await;
        if let Some(subscribers) = routes.get_mut(routing_key) {
            subscribers.remove(&key);
            if subscribers.is_empty() {
                routes.remove(routing_key);
            }
        }
    }

    /// Delivers to every subscriber of the routing key.
    ///
    /// Returns the number of deliveries.
    async fn deliver(&self, routing_key: &str, frame: &[u8]) -> Result<usize, MessagingError> {
        // Held for the whole fan-out: deliveries on one key keep publish order.
        let routes = self.routes.lock().await;
        let Some(subscribers) = routes.get(routing_key) else {
            return Ok(0);
        };

        let mut delivered = 0;
        for inbound in subscribers.values() {
            let copy = decode(frame)?;
            if inbound.send(copy).is_ok() {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    /// Number of routing keys with at least one subscriber.
    pub async fn route_count(&self) -> usize {
        self.routes.lock().await.len()
    }
}

/// Factory registered as [`IN_MEMORY`].
pub struct InMemoryFactory {
    broker: Arc<InMemoryBroker>,
}

impl InMemoryFactory {
    pub fn new(broker: Arc<InMemoryBroker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl TransportFactory for InMemoryFactory {
    fn name(&self) -> &str {
        IN_MEMORY
    }

    async fn create(
        &self,
        _config: &TransportConfig,
        inbound: InboundSender,
    ) -> Result<Arc<dyn TransportClient>, MessagingError> {
        Ok(Arc::new(InMemoryClient {
            key: self.broker.next_key(),
            broker: Arc::clone(&self.broker),
            inbound,
            connected: AtomicBool::new(false),
            subscriptions: Mutex::new(BTreeSet::new()),
        }))
    }
}

/// One client of the in-memory broker.
pub struct InMemoryClient {
    key: ClientKey,
    broker: Arc<InMemoryBroker>,
    inbound: InboundSender,
    connected: AtomicBool,
    subscriptions: Mutex<BTreeSet<String>>,
}

impl InMemoryClient {
    fn ensure_connected(&self) -> Result<(), MessagingError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(MessagingError::NotConnected {
                backend: IN_MEMORY.to_string(),
            })
        }
    }
}

#[async_trait]
impl TransportClient for InMemoryClient {
    fn backend(&self) -> &str {
        IN_MEMORY
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn open_connection(&self) -> Result<(), MessagingError> {
        self.connected.store(true, Ordering::SeqCst);
        debug!(client = self.key, "In-memory client connected");
        Ok(())
    }

    async fn close_connection(&self) -> Result<(), MessagingError> {
        self.connected.store(false, Ordering::SeqCst);
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock().await);
        for routing_key in &subscriptions {
            self.broker.unsubscribe(self.key, routing_key).await;
        }
        debug!(
            client = self.key,
            dropped = subscriptions.len(),
            "In-memory client closed"
        );
        Ok(())
    }

    async fn publish(
        &self,
        context: &MessagingContext,
        envelope: &MessageEnvelope,
    ) -> Result<(), MessagingError> {
        self.ensure_connected()?;
        let frame = encode(envelope)?;
        let routing_key = context.routing_key();
        let delivered = self.broker.deliver(&routing_key, &frame).await?;
        if delivered == 0 {
            debug!(routing_key = %routing_key, kind = envelope.message.kind(), "No listener");
        }
        Ok(())
    }

    async fn subscribe(&self, context: &MessagingContext) -> Result<(), MessagingError> {
        self.ensure_connected()?;
        let routing_key = context.routing_key();
        if self.subscriptions.lock().await.insert(routing_key.clone()) {
            self.broker
                .subscribe(self.key, routing_key, self.inbound.clone())
                .await;
        }
        Ok(())
    }

    async fn unsubscribe(&self, context: &MessagingContext) -> Result<(), MessagingError> {
        let routing_key = context.routing_key();
        if self.subscriptions.lock().await.remove(&routing_key) {
            self.broker.unsubscribe(self.key, &routing_key).await;
        } else {
            debug!(routing_key = %routing_key, "Not subscribed, nothing to remove");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_messages::Message;
    use tokio::sync::mpsc;

    async fn client(
        broker: &Arc<InMemoryBroker>,
    ) -> (Arc<dyn TransportClient>, mpsc::UnboundedReceiver<MessageEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = InMemoryFactory::new(Arc::clone(broker))
            .create(&TransportConfig::new("d"), tx)
            .await
            .unwrap();
        client.open_connection().await.unwrap();
        (client, rx)
    }

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let broker = InMemoryBroker::new();
        let (client, _rx) = client(&broker).await;
        client.close_connection().await.unwrap();

        let ctx = MessagingContext::for_dm("d", "lamp");
        let err = client
            .publish(&ctx, &MessageEnvelope::new(Message::SendInstances))
            .await
            .unwrap_err();
        assert!(matches!(err, MessagingError::NotConnected { .. }));
    }

    #[tokio::test]
    async fn test_close_drops_subscriptions() {
        let broker = InMemoryBroker::new();
        let (client, _rx) = client(&broker).await;
        client
            .subscribe(&MessagingContext::for_dm("d", "lamp"))
            .await
            .unwrap();
        client
            .subscribe(&MessagingContext::for_agent("d", "lamp", "/vm"))
            .await
            .unwrap();
        assert_eq!(broker.route_count().await, 2);

        client.close_connection().await.unwrap();
        assert_eq!(broker.route_count().await, 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_decoded_copy() {
        let broker = InMemoryBroker::new();
        let (publisher, _) = client(&broker).await;
        let (listener, mut rx) = client(&broker).await;
        let ctx = MessagingContext::for_agent("d", "lamp", "/vm");
        listener.subscribe(&ctx).await.unwrap();

        let envelope = MessageEnvelope::new(Message::Resynchronize);
        publisher.publish(&ctx, &envelope).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), envelope);
    }
}
