//! Heartbeat loop telling the DM this agent is alive.

use std::sync::Arc;
use std::time::Duration;

use fleet_id::AgentId;
use fleet_messages::Message;
use fleet_messaging::AgentClient;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Builds the heartbeat of an agent.
pub fn heartbeat(messaging: &AgentClient, agent_id: &AgentId, ip_address: Option<&str>) -> Message {
    Message::Heartbeat {
        application: messaging.application().to_string(),
        scoped_path: messaging.scoped_path().to_string(),
        agent_id: *agent_id,
        ip_address: ip_address.map(str::to_string),
    }
}

/// Run the heartbeat loop until shutdown.
///
/// The first heartbeat leaves immediately; it is what releases the messages
/// the DM queued for this agent.
pub async fn run_heartbeat_loop(
    messaging: Arc<AgentClient>,
    agent_id: AgentId,
    ip_address: Option<String>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        agent_id = %agent_id,
        interval_secs = interval.as_secs(),
        "Starting heartbeat loop"
    );

    let mut interval_timer = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = interval_timer.tick() => {
                if !messaging.client().is_connected() {
                    warn!("Not connected, heartbeat skipped");
                    continue;
                }
                let message = heartbeat(&messaging, &agent_id, ip_address.as_deref());
                messaging.send_message_to_the_dm(message).await;
                debug!("Heartbeat sent");
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Heartbeat loop shutting down");
                    break;
                }
            }
        }
    }
}
