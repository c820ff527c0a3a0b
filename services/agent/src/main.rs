//! fleet agent
//!
//! Runs on the machine of one scoped instance. It listens to the DM on its
//! topic, runs the instance lifecycle through plugins, trades exports with
//! the other agents and sends heartbeats until shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fleet_agent::heartbeat::run_heartbeat_loop;
use fleet_agent::{AgentLifecycle, AgentMessageHandler, Config, PluginRegistry};
use fleet_messages::Message;
use fleet_messaging::memory::{InMemoryBroker, InMemoryFactory};
use fleet_messaging::{AgentClient, FactoryRegistry, ListenerCommand, ReconfigurableClient, TransportConfig};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        agent_id = %config.agent_id,
        application = %config.application,
        scoped = %config.scoped_path,
        transport = %config.transport,
        "Starting fleet agent"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let registry = Arc::new(FactoryRegistry::new());
    registry
        .register(Arc::new(InMemoryFactory::new(InMemoryBroker::shared())))
        .await;
    let client = ReconfigurableClient::new(
        config.owner(),
        TransportConfig::new(config.domain.clone()),
        Arc::clone(&registry),
    );
    let registrations = client.watch_registrations(shutdown_rx.clone());
    client.switch_transport(&config.transport).await;

    let messaging = Arc::new(AgentClient::new(
        Arc::clone(&client),
        config.application.clone(),
        config.scoped_path.clone(),
    ));
    let lifecycle = Arc::new(AgentLifecycle::new(
        Arc::clone(&messaging),
        PluginRegistry::default(),
        config.ip_address.clone(),
    ));

    let processor = client
        .start_processor(
            Arc::new(AgentMessageHandler::new(Arc::clone(&lifecycle))),
            shutdown_rx.clone(),
        )
        .await
        .context("message processor already started")?;
    messaging.listen_to_the_dm(ListenerCommand::Start).await;

    let heartbeat_handle = tokio::spawn(run_heartbeat_loop(
        Arc::clone(&messaging),
        config.agent_id,
        config.ip_address.clone(),
        Duration::from_secs(config.heartbeat_interval_secs),
        shutdown_rx.clone(),
    ));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = processor => {
            if let Err(e) = result {
                error!(error = %e, "Message processor panicked");
            }
        }
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = heartbeat_handle.await {
        error!(error = %e, "Heartbeat task panicked");
    }

    messaging
        .send_message_to_the_dm(Message::MachineDown {
            application: config.application.clone(),
            scoped_path: config.scoped_path.clone(),
        })
        .await;
    registrations.abort();
    client.close().await;

    info!("Agent shutdown complete");
    Ok(())
}
