// src/server/connection_loop.rs

//! Contains the main gateway loop for accepting connections and handling graceful shutdown.

use super::context::ServerContext;
use super::stream::AnyStream;
use crate::connection::ConnectionHandler;
use crate::core::GatewayError;
use crate::core::metrics;
use crate::core::state::GatewayState;
use anyhow::{Result, anyhow};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, error, info, warn};

/// The main loop that accepts connections and handles graceful shutdown.
pub async fn run(mut ctx: ServerContext) -> Result<()> {
    let mut client_tasks = JoinSet::new();

    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow!("Failed to register SIGINT handler: {}", e))?;
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow!("Failed to register SIGTERM handler: {}", e))?;

    loop {
        tokio::select! {
            biased;

            _ = sigint.recv() => {
                info!("SIGINT received, initiating graceful shutdown.");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, initiating graceful shutdown.");
                break;
            }

            Some(res) = ctx.background_tasks.join_next() => {
                match res {
                    Ok(Ok(())) => warn!("A background task finished unexpectedly without an error."),
                    Ok(Err(e)) => { error!("CRITICAL: Background task failed: {}. Shutting down.", e); break; }
                    Err(e) => { error!("CRITICAL: Background task panicked: {e:?}. Shutting down."); break; }
                }
            },

            res = ctx.listener.accept() => {
                let (socket, addr) = match res {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                };
                let Ok(permit) = ctx.connection_permits.clone().try_acquire_owned() else {
                    warn!("Rejecting connection from {}: max_clients reached.", addr);
                    continue;
                };
                info!("Accepted new connection from: {}", addr);
                ctx.state.stats.increment_total_connections();
                metrics::CONNECTIONS_RECEIVED_TOTAL.inc();

                let state_clone = ctx.state.clone();
                let shutdown_rx = ctx.shutdown_tx.subscribe();
                let acceptor = ctx.acceptor.clone();

                client_tasks.spawn(async move {
                    let _permit = permit;
                    let any_stream = match AnyStream::accept(socket, acceptor.as_ref()).await {
                        Ok(stream) => {
                            debug!("Transport for {addr} ready ({}).", stream.scheme());
                            stream
                        }
                        Err(e) => {
                            warn!("TLS handshake error for {addr}: {e}");
                            return;
                        }
                    };
                    if let Err(e) = serve_connection(any_stream, addr, state_clone, shutdown_rx).await {
                        warn!("Connection from {} terminated unexpectedly: {}", addr, e);
                    }
                });
            },

            Some(res) = client_tasks.join_next() => {
                if let Err(e) = res
                    && e.is_panic()
                {
                    error!("A client handler panicked: {e:?}");
                }
            },
        }
    }

    info!("Shutting down. Sending signal to all tasks.");
    if ctx.shutdown_tx.send(()).is_err() {
        error!("Failed to send shutdown signal. Some tasks may not terminate gracefully.");
    }

    client_tasks.shutdown().await;
    // Handlers aborted mid-flight leave their bindings behind; clear them all.
    ctx.state.registry.remove_all().await;
    info!(
        "All client connections closed. Served {} connection(s), {} frame(s), {} login(s).",
        ctx.state.stats.get_total_connections(),
        ctx.state.stats.get_total_frames(),
        ctx.state.stats.get_total_logins()
    );

    info!("Waiting for background tasks to finish...");
    if tokio::time::timeout(Duration::from_secs(10), async {
        while ctx.background_tasks.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!("Timed out waiting for background tasks to finish cleanly.");
    };
    info!("Gateway shutdown complete.");
    Ok(())
}

/// Performs the WebSocket upgrade on `stream` and runs a connection handler on it.
///
/// Upgrades requested on any path other than the configured `ws_path` are
/// answered with `404 Not Found`.
pub async fn serve_connection<S>(
    stream: S,
    addr: SocketAddr,
    state: Arc<GatewayState>,
    shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), GatewayError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ws_path = state.config.ws_path.clone();
    let check_path = |req: &Request, res: Response| -> Result<Response, ErrorResponse> {
        if req.uri().path() == ws_path {
            Ok(res)
        } else {
            let mut err = ErrorResponse::new(Some("not found".to_string()));
            *err.status_mut() = StatusCode::NOT_FOUND;
            Err(err)
        }
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, check_path).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("WebSocket upgrade from {} refused: {}", addr, e);
            return Ok(());
        }
    };

    let handler = ConnectionHandler::new(state, addr, shutdown_rx);
    debug!("Connection {} upgraded to WebSocket.", handler.connection_id());
    handler.run(ws).await
}
