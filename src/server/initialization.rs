// src/server/initialization.rs

//! Handles the complete gateway initialization process, from connecting the
//! shared store and broker to binding the listener.

use super::context::ServerContext;
use crate::config::Config;
use crate::core::auth::HttpAuthClient;
use crate::core::state::{GatewayState, LogReloadHandle};
use crate::core::{broker, store};
use anyhow::{Result, anyhow};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinSet;
use tokio_rustls::{TlsAcceptor, rustls};
use tracing::{info, warn};

/// Initializes all gateway components before starting the main loop.
pub async fn setup(
    config: Config,
    log_reload_handle: Option<LogReloadHandle>,
) -> Result<ServerContext> {
    log_startup_info(&config);
    let (shutdown_tx, _) = broadcast::channel(1);

    let acceptor = setup_tls(&config).await?;

    let shared_store = store::connect(&config.store)
        .await
        .map_err(|e| anyhow!("Failed to connect to the shared store: {}", e))?;
    info!("Shared store ready ({:?} mode).", config.store.mode);

    let message_broker = broker::connect(&config.broker, &config.store)
        .await
        .map_err(|e| anyhow!("Failed to connect to the message broker: {}", e))?;
    info!("Message broker ready ({:?} mode).", config.broker.mode);

    let auth = Arc::new(HttpAuthClient::new(&config.auth)?);

    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    info!(
        "SpinelGate node '{}' listening on ws://{}:{}{}",
        config.node_id, config.host, config.port, config.ws_path
    );
    let connection_permits = Arc::new(Semaphore::new(config.max_clients));

    let state = GatewayState::new(config, shared_store, message_broker, auth, log_reload_handle);
    info!("Gateway state initialized.");

    Ok(ServerContext {
        state,
        listener,
        shutdown_tx,
        background_tasks: JoinSet::new(),
        acceptor,
        connection_permits,
    })
}

/// Sets up the TLS acceptor if TLS is enabled in the configuration.
async fn setup_tls(config: &Config) -> Result<Option<TlsAcceptor>> {
    if config.tls.enabled {
        info!("TLS is enabled. Loading certificate and key.");
        let certs = load_certs(&config.tls.cert_path)?;
        let key = load_key(&config.tls.key_path)?;
        let server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        Ok(Some(TlsAcceptor::from(Arc::new(server_config))))
    } else {
        Ok(None)
    }
}

/// Loads TLS certificates from a PEM file.
fn load_certs(path: &str) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let cert_file = File::open(path)
        .map_err(|e| anyhow!("Failed to open certificate file '{}': {}", path, e))?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs = rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(anyhow!("No certificates found in '{}'", path));
    }
    Ok(certs)
}

/// Loads a private key from a PEM file.
fn load_key(path: &str) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let key_file = File::open(path)
        .map_err(|e| anyhow!("Failed to open private key file '{}': {}", path, e))?;
    let mut key_reader = BufReader::new(key_file);
    rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| anyhow!("No private key found in key file '{}'", path))
}

/// Logs key configuration parameters at startup.
fn log_startup_info(config: &Config) {
    info!(
        "Session lease TTL {:?}, record TTL {:?}, {} verification attempt(s).",
        config.session.lock_ttl, config.session.record_ttl, config.session.verify_retries
    );
    if config.session.idle_timeout.is_zero() {
        info!("Idle session reaping is disabled.");
    } else {
        info!(
            "Idle sessions are logged out after {:?}.",
            config.session.idle_timeout
        );
    }
    if config.broker.dispatcher_workers == 1 {
        info!("Inbound dispatch runs on a single worker; per-topic order is preserved.");
    }
    if matches!(config.store.mode, crate::config::StoreMode::Memory) {
        warn!("--------------------------------------------------------------------------------");
        warn!("The shared store is running in MEMORY mode. Session state is local to this");
        warn!("process and cannot be shared with other gateway nodes.");
        warn!("--------------------------------------------------------------------------------");
    }
}
