// src/server/spawner.rs

//! Spawns all of the gateway's long-running background tasks.

use super::context::ServerContext;
use super::metrics_server;
use crate::core::routing::InboundDispatcherTask;
use crate::core::session::{KickListenerTask, SessionReaperTask};
use anyhow::Result;
use tracing::info;

/// Spawns all critical background tasks into the provided JoinSet.
pub async fn spawn_all(ctx: &mut ServerContext) -> Result<()> {
    let state = &ctx.state;
    let shutdown_tx = &ctx.shutdown_tx;
    let background_tasks = &mut ctx.background_tasks;
    let config = state.config.clone();

    // --- Metrics Server ---
    if config.metrics.enabled {
        let metrics_state = state.clone();
        let shutdown_rx_metrics = shutdown_tx.subscribe();
        background_tasks.spawn(async move {
            metrics_server::run_metrics_server(metrics_state, shutdown_rx_metrics).await;
            Ok(())
        });
    } else {
        info!("Prometheus metrics server is disabled in the configuration.");
    }

    // --- Session Coordination ---
    let kick_listener = KickListenerTask::new(state.registry.clone());
    let shutdown_rx_kick = shutdown_tx.subscribe();
    background_tasks.spawn(async move {
        kick_listener.run(shutdown_rx_kick).await;
        Ok(())
    });

    if !config.session.idle_timeout.is_zero() {
        let reaper = SessionReaperTask::new(
            state.registry.clone(),
            config.session.idle_timeout,
            config.session.reaper_interval,
        );
        let shutdown_rx_reaper = shutdown_tx.subscribe();
        background_tasks.spawn(async move {
            reaper.run(shutdown_rx_reaper).await;
            Ok(())
        });
    }

    // --- Inbound Broker Dispatch ---
    let dispatcher_task = InboundDispatcherTask::new(
        state.dispatcher.clone(),
        state.broker.clone(),
        state.inbound_topics(),
        config.broker.dispatcher_workers,
    );
    let dispatcher_shutdown = shutdown_tx.clone();
    background_tasks.spawn(async move {
        dispatcher_task.run(dispatcher_shutdown).await;
        Ok(())
    });

    info!("All background tasks have been spawned.");
    Ok(())
}
