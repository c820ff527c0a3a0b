//! fleet deployment manager
//!
//! Loads the applications to manage, reconciles them with the machines that
//! survived a restart, then processes agent messages until shutdown.

use std::sync::Arc;

use anyhow::{Context, Result};
use fleet_dm::{
    Config, DmMessageHandler, InMemoryTargetHandler, InstancesManager, TargetResolver, TimerWorker,
};
use fleet_messaging::memory::{InMemoryBroker, InMemoryFactory};
use fleet_messaging::{DmClient, FactoryRegistry, ReconfigurableClient, TransportConfig};
use fleet_model::Application;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        domain = %config.domain,
        transport = %config.transport,
        heartbeat_miss_threshold = config.heartbeat_miss_threshold,
        "Starting fleet deployment manager"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Messaging
    let registry = Arc::new(FactoryRegistry::new());
    registry
        .register(Arc::new(InMemoryFactory::new(InMemoryBroker::shared())))
        .await;
    let client = ReconfigurableClient::new(
        "dm",
        TransportConfig::new(config.domain.clone()),
        Arc::clone(&registry),
    );
    let registrations = client.watch_registrations(shutdown_rx.clone());
    client.switch_transport(&config.transport).await;

    // Targets
    let targets = TargetResolver::new(config.default_target.clone())
        .with_handler(Arc::new(InMemoryTargetHandler::new()));

    let manager = Arc::new(InstancesManager::new(
        DmClient::new(Arc::clone(&client)),
        targets,
        &config,
    ));

    let processor = client
        .start_processor(
            Arc::new(DmMessageHandler::new(Arc::clone(&manager))),
            shutdown_rx.clone(),
        )
        .await
        .context("message processor already started")?;

    for application in load_applications(&config).await? {
        let name = application.name.clone();
        manager.add_application(application).await?;
        if let Err(e) = manager.restore_instances(&name).await {
            warn!(application = %name, error = %e, "Restore incomplete");
        }
    }

    let worker = TimerWorker::new(
        Arc::clone(&manager),
        config.timer_interval(),
        config.heartbeat_check_period(),
    );
    let worker_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { worker.run(shutdown_rx).await }
    });

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
    if let Err(e) = worker_handle.await {
        error!(error = %e, "Timer task panicked");
    }
    registrations.abort();
    client.close().await;

    info!("Deployment manager shutdown complete");
    Ok(())
}

async fn load_applications(config: &Config) -> Result<Vec<Application>> {
    let Some(path) = &config.applications_file else {
        info!("No applications file configured");
        return Ok(Vec::new());
    };

    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let applications: Vec<Application> = serde_json::from_slice(&raw)
        .with_context(|| format!("parsing {}", path.display()))?;
    info!(count = applications.len(), file = %path.display(), "Applications loaded");
    Ok(applications)
}
