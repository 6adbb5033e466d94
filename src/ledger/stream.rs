//! Ledger notification stream
//!
//! Single responsibility: keep a WebSocket subscription to the ledger node
//! open and rebroadcast `RoleAssigned` notifications locally.
//!
//! Wire format: after connecting we send a JSON-RPC `subscribe` request for
//! `RoleAssigned`; the node then pushes notifications shaped as
//! `{"method": "RoleAssigned", "params": {"address": "0x..", "role": 1}}`.
//! Anything else is ignored.
//!
//! On disconnect we wait `reconnect_delay` and connect again. Notifications
//! emitted while disconnected are lost; the gate's direct-write path covers
//! assignments made through this process.

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, info, warn};

use super::RoleAssigned;

/// Configuration for the notification subscription.
#[derive(Debug, Clone)]
pub struct EventStreamConfig {
    /// WebSocket URL of the ledger node
    pub url: String,
    /// Delay between reconnection attempts
    pub reconnect_delay: Duration,
}

impl Default for EventStreamConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8546".to_string(),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Deserialize)]
struct Notification {
    method: String,
    #[serde(default)]
    params: serde_json::Value,
}

/// Parse one text frame into a role notification, if it is one.
pub(crate) fn parse_notification(text: &str) -> Option<RoleAssigned> {
    let notification: Notification = serde_json::from_str(text).ok()?;
    if notification.method != "RoleAssigned" {
        return None;
    }
    match serde_json::from_value(notification.params) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(error = %e, "Malformed RoleAssigned notification");
            None
        }
    }
}

/// Run one connection until it closes or errors.
async fn run_once(
    url: &str,
    tx: &broadcast::Sender<RoleAssigned>,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let (ws, _) = connect_async(url).await?;
    let (mut sink, mut stream) = ws.split();

    let subscribe = serde_json::json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "subscribe",
        "params": ["RoleAssigned"],
    });
    sink.send(Message::Text(subscribe.to_string())).await?;
    info!(url = %url, "Subscribed to ledger role notifications");

    while let Some(message) = stream.next().await {
        match message? {
            Message::Text(text) => {
                if let Some(event) = parse_notification(&text) {
                    debug!(address = %event.address, role = %event.role, "RoleAssigned notification");
                    let _ = tx.send(event);
                }
            }
            Message::Close(_) => break,
            _ => continue,
        }
    }
    Ok(())
}

/// Spawn the subscription loop. Stops when `shutdown` fires.
pub(crate) fn spawn(
    config: EventStreamConfig,
    tx: broadcast::Sender<RoleAssigned>,
    mut shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                result = run_once(&config.url, &tx) => {
                    match result {
                        Ok(()) => warn!(url = %config.url, "Ledger notification stream closed"),
                        Err(e) => warn!(url = %config.url, error = %e, "Ledger notification stream failed"),
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Notification stream shutting down");
                    return;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(config.reconnect_delay) => {}
                _ = shutdown.recv() => return,
            }
        }
    })
}
