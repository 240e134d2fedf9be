// src/server/mod.rs

use crate::config::Config;
use crate::core::state::LogReloadHandle;
use anyhow::Result;

mod connection_loop;
mod context;
mod initialization;
mod metrics_server;
mod spawner;
mod stream;

pub use connection_loop::serve_connection;
pub use stream::AnyStream;

/// The main gateway startup function, orchestrating all setup phases.
pub async fn run(config: Config, log_reload_handle: Option<LogReloadHandle>) -> Result<()> {
    // 1. Connect the store and broker, build the gateway state, bind the listener.
    let mut server_context = initialization::setup(config, log_reload_handle).await?;

    // 2. Spawn all background tasks.
    spawner::spawn_all(&mut server_context).await?;

    // 3. Start the main connection acceptance loop. This function will run until shutdown.
    connection_loop::run(server_context).await
}
