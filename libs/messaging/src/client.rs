//! Reconfigurable client.
//!
//! Owns a transport slot that can be replaced while the process runs. The
//! inbound queue, the message processor and the subscriptions requested by
//! the owner all belong to this client, not to the transport, so they
//! survive a backend swap.

use std::collections::BTreeSet;
use std::sync::Arc;

use arc_swap::ArcSwap;
use fleet_messages::{Message, MessageEnvelope};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{
    DismissedClient, FactoryRegistry, MessageHandler, MessageProcessor, MessagingContext,
    TransportClient, TransportConfig,
};

type Slot = Arc<dyn TransportClient>;

/// A messaging client whose backend can be switched at runtime.
pub struct ReconfigurableClient {
    owner: String,
    config: TransportConfig,
    registry: Arc<FactoryRegistry>,

    /// Current transport. Readers see the client before or after a swap,
    /// never a half-swapped state.
    slot: ArcSwap<Slot>,

    /// Held for the whole duration of a swap.
    swap_lock: Mutex<()>,

    /// Backend requested by the last `switch_transport` call.
    requested: Mutex<Option<String>>,

    /// Contexts the owner subscribed to; replayed on every new transport.
    subscriptions: Mutex<BTreeSet<MessagingContext>>,

    inbound_tx: mpsc::UnboundedSender<MessageEnvelope>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<MessageEnvelope>>>,
}

impl ReconfigurableClient {
    /// Creates a client holding the dismissed placeholder.
    pub fn new(
        owner: impl Into<String>,
        config: TransportConfig,
        registry: Arc<FactoryRegistry>,
    ) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let placeholder: Slot = Arc::new(DismissedClient::new());
        Arc::new(Self {
            owner: owner.into(),
            config,
            registry,
            slot: ArcSwap::from_pointee(placeholder),
            swap_lock: Mutex::new(()),
            requested: Mutex::new(None),
            subscriptions: Mutex::new(BTreeSet::new()),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
        })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn domain(&self) -> &str {
        &self.config.domain
    }

    fn current(&self) -> Slot {
        Slot::clone(&self.slot.load_full())
    }

    /// Backend name of the current transport.
    pub fn backend(&self) -> String {
        self.current().backend().to_string()
    }

    /// False while the dismissed placeholder is active.
    pub fn has_valid_client(&self) -> bool {
        self.current().backend() != crate::dismissed::DISMISSED
    }

    pub fn is_connected(&self) -> bool {
        self.current().is_connected()
    }

    /// Starts the message processor draining this client's inbound queue.
    ///
    /// Returns `None` if a processor was already started.
    pub async fn start_processor<H>(
        &self,
        handler: Arc<H>,
        shutdown: watch::Receiver<bool>,
    ) -> Option<JoinHandle<()>>
    where
        H: MessageHandler + 'static,
    {
        let inbound = self.inbound_rx.lock().await.take()?;
        let processor = MessageProcessor::new(self.owner.clone(), inbound, handler);
        Some(tokio::spawn(processor.run(shutdown)))
    }

    /// Replaces the transport with a client of the `backend` factory.
    ///
    /// On failure the slot holds the dismissed placeholder and the swap is
    /// retried when a factory with that name registers (see
    /// [`ReconfigurableClient::watch_registrations`]). The previous
    /// transport is closed in every case. Errors never propagate.
    pub async fn switch_transport(&self, backend: &str) {
        let _guard = self.swap_lock.lock().await;
        *self.requested.lock().await = Some(backend.to_string());
        self.swap_locked(backend).await;
    }

    async fn swap_locked(&self, backend: &str) {
        // Held until the new transport is in the slot so that concurrent
        // subscribe calls land on one client or the other, never in between.
        let subscriptions = self.subscriptions.lock().await;

        let next: Slot = match self
            .registry
            .create(backend, &self.config, self.inbound_tx.clone())
            .await
        {
            Ok(client) => match Self::open(&client, &subscriptions).await {
                Ok(()) => client,
                Err(e) => {
                    self.banner(backend, &e.to_string());
                    if let Err(close) = client.close_connection().await {
                        warn!(
                            owner = %self.owner,
                            backend = %backend,
                            error = %close,
                            "Failed to close transport after a failed open"
                        );
                    }
                    Arc::new(DismissedClient::new())
                }
            },
            Err(e) => {
                self.banner(backend, &e.to_string());
                Arc::new(DismissedClient::new())
            }
        };

        let connected = next.is_connected();
        let previous = self.slot.swap(Arc::new(next));
        drop(subscriptions);

        if let Err(e) = previous.close_connection().await {
            warn!(
                owner = %self.owner,
                backend = previous.backend(),
                error = %e,
                "Failed to close previous transport"
            );
        }

        info!(
            owner = %self.owner,
            from = previous.backend(),
            to = %backend,
            connected,
            "Transport switched"
        );
    }

    /// Opens a new transport and replays the owner's subscriptions on it.
    async fn open(
        client: &Slot,
        subscriptions: &BTreeSet<MessagingContext>,
    ) -> Result<(), crate::MessagingError> {
        client.open_connection().await?;
        for context in subscriptions {
            client.subscribe(context).await?;
        }
        debug!(
            backend = client.backend(),
            replayed = subscriptions.len(),
            "Subscriptions re-established"
        );
        Ok(())
    }

    fn banner(&self, backend: &str, reason: &str) {
        error!(
            owner = %self.owner,
            backend = %backend,
            reason = %reason,
            "\n\n**********************************************************\n\
             Messaging is not available: the requested transport could\n\
             not be set up. Messages are dropped until it is registered.\n\
             **********************************************************\n"
        );
    }

    /// Retries a failed swap whenever the requested backend registers.
    pub fn watch_registrations(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let client = Arc::clone(self);
        let mut registrations = self.registry.subscribe_registrations();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    registered = registrations.recv() => {
                        let name = match registered {
                            Ok(name) => name,
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(_) => break,
                        };
                        client.retry_if_waiting_for(&name).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    async fn retry_if_waiting_for(&self, name: &str) {
        let _guard = self.swap_lock.lock().await;
        let waiting = self.requested.lock().await.as_deref() == Some(name);
        if waiting && !self.has_valid_client() {
            info!(owner = %self.owner, backend = %name, "Retrying transport switch");
            self.swap_locked(name).await;
        }
    }

    /// Publishes a message. Transport failures are logged.
    pub async fn publish(&self, context: &MessagingContext, message: Message) {
        let envelope = MessageEnvelope::new(message);
        let client = self.current();
        if let Err(e) = client.publish(context, &envelope).await {
            warn!(
                owner = %self.owner,
                backend = client.backend(),
                context = %context,
                kind = envelope.message.kind(),
                error = %e,
                "Publish failed"
            );
        }
    }

    /// Subscribes to a context. The subscription is kept across swaps.
    pub async fn subscribe(&self, context: &MessagingContext) {
        let mut subscriptions = self.subscriptions.lock().await;
        subscriptions.insert(context.clone());
        let client = self.current();
        if let Err(e) = client.subscribe(context).await {
            warn!(owner = %self.owner, context = %context, error = %e, "Subscribe failed");
        }
    }

    pub async fn unsubscribe(&self, context: &MessagingContext) {
        let mut subscriptions = self.subscriptions.lock().await;
        subscriptions.remove(context);
        let client = self.current();
        if let Err(e) = client.unsubscribe(context).await {
            warn!(owner = %self.owner, context = %context, error = %e, "Unsubscribe failed");
        }
    }

    /// Contexts currently requested by the owner.
    pub async fn subscriptions(&self) -> Vec<MessagingContext> {
        self.subscriptions.lock().await.iter().cloned().collect()
    }

    /// Closes the transport and falls back to the placeholder.
    pub async fn close(&self) {
        let _guard = self.swap_lock.lock().await;
        *self.requested.lock().await = None;
        self.subscriptions.lock().await.clear();
        let placeholder: Slot = Arc::new(DismissedClient::new());
        let previous = self.slot.swap(Arc::new(placeholder));
        if let Err(e) = previous.close_connection().await {
            warn!(owner = %self.owner, error = %e, "Failed to close transport");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryBroker, InMemoryFactory, IN_MEMORY};

    fn registry() -> Arc<FactoryRegistry> {
        Arc::new(FactoryRegistry::new())
    }

    #[tokio::test]
    async fn test_starts_dismissed() {
        let client = ReconfigurableClient::new("dm", TransportConfig::new("d"), registry());
        assert!(!client.has_valid_client());
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_unknown_backend_keeps_placeholder() {
        let client = ReconfigurableClient::new("dm", TransportConfig::new("d"), registry());
        client.switch_transport("rabbitmq").await;
        assert!(!client.has_valid_client());
        assert_eq!(client.backend(), crate::dismissed::DISMISSED);
    }

    #[tokio::test]
    async fn test_switch_to_registered_backend() {
        let registry = registry();
        registry
            .register(Arc::new(InMemoryFactory::new(InMemoryBroker::new())))
            .await;
        let client = ReconfigurableClient::new("dm", TransportConfig::new("d"), registry);

        client.switch_transport(IN_MEMORY).await;
        assert!(client.has_valid_client());
        assert!(client.is_connected());
        assert_eq!(client.backend(), IN_MEMORY);
    }

    #[tokio::test]
    async fn test_processor_starts_once() {
        struct Noop;
        #[async_trait::async_trait]
        impl MessageHandler for Noop {
            type Error = String;
            async fn handle(&self, _: MessageEnvelope) -> Result<(), String> {
                Ok(())
            }
        }

        let client = ReconfigurableClient::new("dm", TransportConfig::new("d"), registry());
        let (_tx, rx) = watch::channel(false);
        assert!(client.start_processor(Arc::new(Noop), rx.clone()).await.is_some());
        assert!(client.start_processor(Arc::new(Noop), rx).await.is_none());
    }

    #[tokio::test]
    async fn test_close_resets_to_placeholder() {
        let registry = registry();
        registry
            .register(Arc::new(InMemoryFactory::new(InMemoryBroker::new())))
            .await;
        let client = ReconfigurableClient::new("dm", TransportConfig::new("d"), registry);
        client.switch_transport(IN_MEMORY).await;
        client.subscribe(&MessagingContext::for_dm("d", "lamp")).await;

        client.close().await;
        assert!(!client.has_valid_client());
        assert!(client.subscriptions().await.is_empty());
    }

    const STUBBORN: &str = "stubborn";

    /// Transport that refuses to close.
    struct StubbornClient;

    #[async_trait::async_trait]
    impl TransportClient for StubbornClient {
        fn backend(&self) -> &str {
            STUBBORN
        }

        fn is_connected(&self) -> bool {
            true
        }

        async fn open_connection(&self) -> Result<(), crate::MessagingError> {
            Ok(())
        }

        async fn close_connection(&self) -> Result<(), crate::MessagingError> {
            Err(crate::MessagingError::Connection("socket stuck".to_string()))
        }

        async fn publish(&self, _: &MessagingContext, _: &MessageEnvelope) -> Result<(), crate::MessagingError> {
            Ok(())
        }

        async fn subscribe(&self, _: &MessagingContext) -> Result<(), crate::MessagingError> {
            Ok(())
        }

        async fn unsubscribe(&self, _: &MessagingContext) -> Result<(), crate::MessagingError> {
            Ok(())
        }
    }

    struct StubbornFactory;

    #[async_trait::async_trait]
    impl crate::TransportFactory for StubbornFactory {
        fn name(&self) -> &str {
            STUBBORN
        }

        async fn create(
            &self,
            _: &TransportConfig,
            _: crate::InboundSender,
        ) -> Result<Arc<dyn TransportClient>, crate::MessagingError> {
            Ok(Arc::new(StubbornClient))
        }
    }

    struct Recorder(mpsc::UnboundedSender<Message>);

    #[async_trait::async_trait]
    impl MessageHandler for Recorder {
        type Error = String;
        async fn handle(&self, envelope: MessageEnvelope) -> Result<(), String> {
            self.0.send(envelope.message).map_err(|e| e.to_string())
        }
    }

    #[tokio::test]
    async fn test_close_failure_does_not_stop_the_swap() {
        let registry = registry();
        registry.register(Arc::new(StubbornFactory)).await;
        registry
            .register(Arc::new(InMemoryFactory::new(InMemoryBroker::new())))
            .await;
        let client = ReconfigurableClient::new("dm", TransportConfig::new("d"), registry);

        client.switch_transport(STUBBORN).await;
        assert_eq!(client.backend(), STUBBORN);

        client.switch_transport(IN_MEMORY).await;
        assert!(client.has_valid_client());
        assert_eq!(client.backend(), IN_MEMORY);

        client.switch_transport(STUBBORN).await;
        client.close().await;
        assert!(!client.has_valid_client());
    }

    #[tokio::test]
    async fn test_queued_messages_survive_a_swap() {
        let registry = registry();
        registry
            .register(Arc::new(InMemoryFactory::new(InMemoryBroker::new())))
            .await;
        let client = ReconfigurableClient::new("dm", TransportConfig::new("d"), registry);
        let context = MessagingContext::for_dm("d", "lamp");
        client.switch_transport(IN_MEMORY).await;
        client.subscribe(&context).await;

        // Queued before the processor runs, then the transport is replaced.
        client.publish(&context, Message::SendInstances).await;
        client.switch_transport(IN_MEMORY).await;
        client.publish(&context, Message::Resynchronize).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown) = watch::channel(false);
        assert!(client.start_processor(Arc::new(Recorder(tx)), shutdown).await.is_some());

        let received = tokio::time::timeout(std::time::Duration::from_secs(1), async {
            vec![rx.recv().await, rx.recv().await]
        })
        .await
        .unwrap();
        assert_eq!(
            received,
            vec![Some(Message::SendInstances), Some(Message::Resynchronize)]
        );
    }
}
