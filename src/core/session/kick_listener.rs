// src/core/session/kick_listener.rs

//! A background task acting on kick notifications addressed to this node.

use crate::core::GatewayError;
use crate::core::metrics;
use crate::core::protocol::kick::parse_kick_notification;
use crate::core::registry::ConnectionRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

pub struct KickListenerTask {
    registry: Arc<ConnectionRegistry>,
}

impl KickListenerTask {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Subscribes to this node's kick channel and logs out each named user.
    /// A dropped subscription is re-established until shutdown.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            "Kick listener started for node '{}'.",
            self.registry.node_id()
        );
        loop {
            let mut notifications = match self.registry.coordinator().subscribe_kick_notifications().await {
                Ok(rx) => rx,
                Err(e) => {
                    warn!("Could not subscribe to kick notifications: {}. Retrying.", e);
                    tokio::select! {
                        _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => continue,
                        _ = shutdown_rx.recv() => break,
                    }
                }
            };

            loop {
                tokio::select! {
                    msg = notifications.recv() => match msg {
                        Some(body) => self.handle(&body).await,
                        None => {
                            warn!("Kick subscription closed; resubscribing.");
                            break;
                        }
                    },
                    _ = shutdown_rx.recv() => {
                        info!("Kick listener shutting down.");
                        return;
                    }
                }
            }
        }
        info!("Kick listener shutting down.");
    }

    async fn handle(&self, body: &[u8]) {
        let Some(user_id) = parse_kick_notification(body) else {
            warn!(
                "Ignoring malformed kick notification: {:?}",
                String::from_utf8_lossy(body)
            );
            return;
        };
        metrics::KICKS_TOTAL.with_label_values(&["received"]).inc();
        match self.registry.force_logout(&user_id).await {
            Ok(()) => info!("User '{}' logged in elsewhere; local session closed.", user_id),
            Err(GatewayError::SessionNotFound(_)) => {
                debug!("Kick for user '{}' found no local session.", user_id)
            }
            Err(e) => warn!("Kick for user '{}' failed: {}", user_id, e),
        }
    }
}
