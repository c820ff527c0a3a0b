//! Export/import protocol over the in-memory backend.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_messages::{Message, MessageEnvelope};
use fleet_messaging::memory::{InMemoryBroker, InMemoryFactory, IN_MEMORY};
use fleet_messaging::{
    AgentClient, DmClient, FactoryRegistry, ListenerCommand, MessageHandler, MessagingContext,
    ReconfigurableClient, TransportConfig,
};
use fleet_model::{data, Component, Instance};
use tokio::sync::{mpsc, watch};

const DOMAIN: &str = "test";

/// Forwards every handled message to a channel the test reads.
struct Probe(mpsc::UnboundedSender<Message>);

#[async_trait]
impl MessageHandler for Probe {
    type Error = String;

    async fn handle(&self, envelope: MessageEnvelope) -> Result<(), String> {
        self.0.send(envelope.message).map_err(|e| e.to_string())
    }
}

struct Bus {
    registry: Arc<FactoryRegistry>,
    shutdown: watch::Receiver<bool>,
    _shutdown_tx: watch::Sender<bool>,
}

impl Bus {
    async fn new() -> Self {
        let registry = Arc::new(FactoryRegistry::new());
        registry
            .register(Arc::new(InMemoryFactory::new(InMemoryBroker::new())))
            .await;
        let (tx, rx) = watch::channel(false);
        Self {
            registry,
            shutdown: rx,
            _shutdown_tx: tx,
        }
    }

    /// A connected client with a probe on its processor.
    async fn client(&self, owner: &str) -> (Arc<ReconfigurableClient>, mpsc::UnboundedReceiver<Message>) {
        let client = ReconfigurableClient::new(
            owner,
            TransportConfig::new(DOMAIN),
            Arc::clone(&self.registry),
        );
        client.switch_transport(IN_MEMORY).await;
        let (tx, rx) = mpsc::unbounded_channel();
        client
            .start_processor(Arc::new(Probe(tx)), self.shutdown.clone())
            .await
            .unwrap();
        (client, rx)
    }

    async fn agent(&self, app: &str, scoped_path: &str) -> (AgentClient, mpsc::UnboundedReceiver<Message>) {
        let (client, rx) = self.client(&format!("agent {app}{scoped_path}")).await;
        (AgentClient::new(client, app, scoped_path), rx)
    }
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("probe closed")
}

async fn assert_silent(rx: &mut mpsc::UnboundedReceiver<Message>) {
    let got = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(got.is_err(), "unexpected message: {got:?}");
}

fn mysql() -> Instance {
    let mut mysql = Instance::new(
        "mysql",
        Component::new("MySQL", "puppet")
            .with_export("MySQL.port", Some("3306"))
            .with_export("MySQL.ip", None),
    );
    mysql
        .data
        .insert(data::IP_ADDRESS.to_string(), "192.168.1.15".to_string());
    mysql
}

fn tomcat() -> Instance {
    Instance::new(
        "tomcat",
        Component::new("Tomcat", "puppet").with_import("MySQL.*", false),
    )
}

#[tokio::test]
async fn publish_without_listeners_delivers_nothing() {
    let bus = Bus::new().await;
    let (mysql_agent, mut mysql_rx) = bus.agent("app1", "/vm1").await;
    let (_tomcat_agent, mut tomcat_rx) = bus.agent("app1", "/vm2").await;

    mysql_agent.publish_exports("/vm1/mysql", &mysql(), None).await;

    assert_silent(&mut tomcat_rx).await;
    assert_silent(&mut mysql_rx).await;
}

#[tokio::test]
async fn double_listen_delivers_once() {
    let bus = Bus::new().await;
    let (mysql_agent, _) = bus.agent("app1", "/vm1").await;
    let (tomcat_agent, mut tomcat_rx) = bus.agent("app1", "/vm2").await;

    let tomcat = tomcat();
    tomcat_agent
        .listen_to_exports_from_other_agents(ListenerCommand::Start, &tomcat)
        .await;
    tomcat_agent
        .listen_to_exports_from_other_agents(ListenerCommand::Start, &tomcat)
        .await;
    assert_eq!(tomcat_agent.client().subscriptions().await.len(), 1);

    mysql_agent.publish_exports("/vm1/mysql", &mysql(), None).await;

    assert!(matches!(next(&mut tomcat_rx).await, Message::AddImport { .. }));
    assert_silent(&mut tomcat_rx).await;
}

#[tokio::test]
async fn messages_keep_publish_order() {
    let bus = Bus::new().await;
    let (dm_client, _) = bus.client("dm").await;
    let dm = DmClient::new(dm_client);
    let (agent, mut agent_rx) = bus.agent("app1", "/vm1").await;
    agent.listen_to_the_dm(ListenerCommand::Start).await;

    for i in 0..20 {
        dm.send_message_to_agent(
            "app1",
            "/vm1",
            Message::RemoveInstance {
                instance_path: format!("/vm1/i{i}"),
            },
        )
        .await;
    }

    for i in 0..20 {
        match next(&mut agent_rx).await {
            Message::RemoveInstance { instance_path } => {
                assert_eq!(instance_path, format!("/vm1/i{i}"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}

#[tokio::test]
async fn exports_fan_out_to_importers() {
    let bus = Bus::new().await;
    let (mysql_agent, mut mysql_rx) = bus.agent("app1", "/vm1").await;
    let (tomcat_agent, mut tomcat_rx) = bus.agent("app1", "/vm2").await;

    tomcat_agent
        .listen_to_exports_from_other_agents(ListenerCommand::Start, &tomcat())
        .await;
    mysql_agent.publish_exports("/vm1/mysql", &mysql(), None).await;

    match next(&mut tomcat_rx).await {
        Message::AddImport {
            prefix,
            exporter_path,
            component_name,
            exported_vars,
            ..
        } => {
            assert_eq!(prefix, "MySQL");
            assert_eq!(exporter_path, "/vm1/mysql");
            assert_eq!(component_name, "MySQL");
            assert_eq!(
                exported_vars,
                BTreeMap::from([
                    ("MySQL.ip".to_string(), "192.168.1.15".to_string()),
                    ("MySQL.port".to_string(), "3306".to_string()),
                ])
            );
        }
        other => panic!("unexpected message: {other:?}"),
    }
    assert_silent(&mut tomcat_rx).await;
    assert_silent(&mut mysql_rx).await;
}

#[tokio::test]
async fn exports_fan_out_then_unpublish() {
    let bus = Bus::new().await;
    let (mysql_agent, _) = bus.agent("app1", "/vm1").await;
    let (tomcat_agent, mut tomcat_rx) = bus.agent("app1", "/vm2").await;

    let mysql = mysql();
    tomcat_agent
        .listen_to_exports_from_other_agents(ListenerCommand::Start, &tomcat())
        .await;
    mysql_agent.publish_exports("/vm1/mysql", &mysql, None).await;
    assert!(matches!(next(&mut tomcat_rx).await, Message::AddImport { .. }));

    mysql_agent.unpublish_exports("/vm1/mysql", &mysql).await;
    match next(&mut tomcat_rx).await {
        Message::RemoveImport {
            prefix,
            removed_path,
            ..
        } => {
            assert_eq!(prefix, "MySQL");
            assert_eq!(removed_path, "/vm1/mysql");
        }
        other => panic!("unexpected message: {other:?}"),
    }
}

#[tokio::test]
async fn export_requests_reach_exporters() {
    let bus = Bus::new().await;
    let (mysql_agent, mut mysql_rx) = bus.agent("app1", "/vm1").await;
    let (tomcat_agent, _) = bus.agent("app1", "/vm2").await;

    mysql_agent
        .listen_to_requests_from_other_agents(ListenerCommand::Start, &mysql())
        .await;
    tomcat_agent
        .request_exports_from_other_agents("/vm2/tomcat", &tomcat())
        .await;

    match next(&mut mysql_rx).await {
        Message::RequestImport {
            prefix,
            requester_path,
            ..
        } => {
            assert_eq!(prefix, "MySQL");
            assert_eq!(requester_path, "/vm2/tomcat");
        }
        other => panic!("unexpected message: {other:?}"),
    }
}

#[tokio::test]
async fn applications_are_isolated() {
    let bus = Bus::new().await;
    let (mysql_agent, _) = bus.agent("app1", "/vm1").await;
    let (other_agent, mut other_rx) = bus.agent("app2", "/vm1").await;

    other_agent
        .listen_to_exports_from_other_agents(ListenerCommand::Start, &tomcat())
        .await;
    other_agent.listen_to_the_dm(ListenerCommand::Start).await;

    mysql_agent.publish_exports("/vm1/mysql", &mysql(), None).await;
    mysql_agent
        .send_message_to_the_dm(Message::MachineDown {
            application: "app1".to_string(),
            scoped_path: "/vm1".to_string(),
        })
        .await;

    assert_silent(&mut other_rx).await;
}

#[tokio::test]
async fn external_exports_cross_applications() {
    let bus = Bus::new().await;
    let (mysql_agent, _) = bus.agent("app1", "/vm1").await;
    let (front_agent, mut front_rx) = bus.agent("app2", "/vm1").await;

    mysql_agent
        .set_external_exports(BTreeMap::from([(
            "MySQL.port".to_string(),
            "Database.port".to_string(),
        )]))
        .await;
    let front = Instance::new(
        "front",
        Component::new("Front", "puppet").with_external_import("Database.port", false),
    );
    front_agent
        .listen_to_exports_from_other_agents(ListenerCommand::Start, &front)
        .await;

    mysql_agent.publish_exports("/vm1/mysql", &mysql(), None).await;

    match next(&mut front_rx).await {
        Message::AddImport {
            prefix,
            exported_vars,
            application,
            ..
        } => {
            assert_eq!(prefix, "Database");
            assert_eq!(application, "app1");
            assert_eq!(
                exported_vars,
                BTreeMap::from([("Database.port".to_string(), "3306".to_string())])
            );
        }
        other => panic!("unexpected message: {other:?}"),
    }
}

#[tokio::test]
async fn agent_termination_removes_every_export() {
    let bus = Bus::new().await;
    let (dm_client, _) = bus.client("dm").await;
    let dm = DmClient::new(dm_client);
    let (tomcat_agent, mut tomcat_rx) = bus.agent("app1", "/vm2").await;
    tomcat_agent
        .listen_to_exports_from_other_agents(ListenerCommand::Start, &tomcat())
        .await;

    let vm = Instance::new("vm1", Component::new("VM", "target")).with_child(mysql());
    dm.propagate_agent_termination("app1", &BTreeMap::new(), "/vm1", &vm)
        .await;

    match next(&mut tomcat_rx).await {
        Message::RemoveImport { removed_path, .. } => assert_eq!(removed_path, "/vm1/mysql"),
        other => panic!("unexpected message: {other:?}"),
    }
    assert_silent(&mut tomcat_rx).await;
}

#[tokio::test]
async fn dm_hears_agents_of_its_applications() {
    let bus = Bus::new().await;
    let (dm_client, mut dm_rx) = bus.client("dm").await;
    let dm = DmClient::new(dm_client);
    dm.listen_to_agent_messages("app1", ListenerCommand::Start).await;
    let (agent, _) = bus.agent("app1", "/vm1").await;

    agent
        .send_message_to_the_dm(Message::MachineDown {
            application: "app1".to_string(),
            scoped_path: "/vm1".to_string(),
        })
        .await;
    assert!(matches!(next(&mut dm_rx).await, Message::MachineDown { .. }));

    dm.listen_to_agent_messages("app1", ListenerCommand::Stop).await;
    agent
        .send_message_to_the_dm(Message::MachineDown {
            application: "app1".to_string(),
            scoped_path: "/vm1".to_string(),
        })
        .await;
    assert_silent(&mut dm_rx).await;
}

#[tokio::test]
async fn switching_backend_keeps_subscriptions() {
    let bus = Bus::new().await;
    let (dm_client, _) = bus.client("dm").await;
    let dm = DmClient::new(dm_client);
    let (agent, mut agent_rx) = bus.agent("app1", "/vm1").await;
    agent.listen_to_the_dm(ListenerCommand::Start).await;

    agent.client().switch_transport(IN_MEMORY).await;
    assert!(agent.client().has_valid_client());

    dm.send_message_to_agent("app1", "/vm1", Message::SendInstances)
        .await;
    assert_eq!(next(&mut agent_rx).await, Message::SendInstances);
    assert_silent(&mut agent_rx).await;
}

#[tokio::test]
async fn failed_switch_retries_when_factory_registers() {
    let registry = Arc::new(FactoryRegistry::new());
    let (_tx, shutdown) = watch::channel(false);
    let client = ReconfigurableClient::new("agent", TransportConfig::new(DOMAIN), Arc::clone(&registry));
    let watcher = client.watch_registrations(shutdown);
    client
        .subscribe(&MessagingContext::for_agent(DOMAIN, "app1", "/vm1"))
        .await;

    client.switch_transport(IN_MEMORY).await;
    assert!(!client.has_valid_client());

    registry
        .register(Arc::new(InMemoryFactory::new(InMemoryBroker::new())))
        .await;

    tokio::time::timeout(Duration::from_secs(2), async {
        while !client.has_valid_client() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("client never picked up the new factory");
    assert!(client.is_connected());
    assert_eq!(client.subscriptions().await.len(), 1);

    watcher.abort();
}
