// src/connection/guard.rs

//! Defines `ConnectionGuard`, an RAII guard for connection resource management.

use crate::core::state::GatewayState;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

/// Makes sure a connection leaves the registry even if its handler exits
/// early or panics.
pub struct ConnectionGuard {
    state: Arc<GatewayState>,
    connection_id: String,
    addr: SocketAddr,
    released: bool,
}

impl ConnectionGuard {
    pub(crate) fn new(state: Arc<GatewayState>, connection_id: String, addr: SocketAddr) -> Self {
        Self {
            state,
            connection_id,
            addr,
            released: false,
        }
    }

    /// Marks the connection as cleaned up by the handler itself.
    pub(crate) fn set_released(&mut self) {
        self.released = true;
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        debug!(
            "ConnectionGuard dropping, cleaning up resources for connection {}",
            self.addr
        );
        // Removal is async and idempotent; hand it to the runtime if one is still around.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let state = self.state.clone();
            let connection_id = std::mem::take(&mut self.connection_id);
            handle.spawn(async move {
                state.registry.remove_connection(&connection_id).await;
            });
        }
    }
}
