// src/core/session/reaper.rs

//! A background task to periodically log out idle sessions.

use crate::core::registry::ConnectionRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

pub struct SessionReaperTask {
    registry: Arc<ConnectionRegistry>,
    idle_timeout: Duration,
    interval: Duration,
}

impl SessionReaperTask {
    pub fn new(registry: Arc<ConnectionRegistry>, idle_timeout: Duration, interval: Duration) -> Self {
        Self {
            registry,
            idle_timeout,
            interval,
        }
    }

    /// The main run loop for the reaper task.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            "Session reaper started (idle timeout {:?}).",
            self.idle_timeout
        );
        let mut interval = tokio::time::interval(self.interval);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.registry
                        .sessions()
                        .cleanup_inactive(self.idle_timeout, &self.registry)
                        .await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Session reaper shutting down.");
                    return;
                }
            }
        }
    }
}
