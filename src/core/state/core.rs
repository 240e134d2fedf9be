// src/core/state/core.rs

//! Defines the central `GatewayState` struct, holding all shared gateway-wide state.

use super::stats::StatsState;
use crate::config::Config;
use crate::core::auth::AuthService;
use crate::core::broker::Broker;
use crate::core::registry::ConnectionRegistry;
use crate::core::routing::{InboundDispatcher, MessageRouter};
use crate::core::session::SessionCoordinator;
use crate::core::storage_bridge::StorageBridge;
use crate::core::store::SharedStore;
use std::sync::Arc;
use tracing_subscriber::{filter::EnvFilter, reload};

pub type LogReloadHandle = Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>;

/// The shared state of one gateway node.
///
/// Built once at startup and handed by `Arc` to every task and connection
/// handler. Tests build several of these over one in-memory store and broker
/// to stand up a multi-node cluster in a single process.
pub struct GatewayState {
    pub config: Arc<Config>,
    pub store: Arc<dyn SharedStore>,
    pub broker: Arc<dyn Broker>,
    pub coordinator: Arc<SessionCoordinator>,
    pub registry: Arc<ConnectionRegistry>,
    pub router: Arc<MessageRouter>,
    pub dispatcher: Arc<InboundDispatcher>,
    pub storage: StorageBridge,
    pub auth: Arc<dyn AuthService>,
    /// A handle to the logging filter, absent when logging was not set up here.
    pub log_reload_handle: Option<LogReloadHandle>,
    pub stats: StatsState,
}

impl GatewayState {
    /// Wires every component from the configuration and the connected backends.
    pub fn new(
        config: Config,
        store: Arc<dyn SharedStore>,
        broker: Arc<dyn Broker>,
        auth: Arc<dyn AuthService>,
        log_reload_handle: Option<LogReloadHandle>,
    ) -> Arc<Self> {
        let coordinator = Arc::new(SessionCoordinator::new(
            store.clone(),
            broker.clone(),
            config.node_id.clone(),
            config.broker.kick_topic.clone(),
            config.session.clone(),
        ));
        let registry = Arc::new(ConnectionRegistry::new(coordinator.clone()));
        let router = Arc::new(MessageRouter::new(
            registry.clone(),
            broker.clone(),
            config.broker.storage_topic.clone(),
        ));
        let dispatcher = Arc::new(InboundDispatcher::new(registry.clone(), router.clone()));
        let storage = StorageBridge::new(
            broker.clone(),
            config.broker.storage_topic.clone(),
            config.node_topic().to_string(),
        );

        Arc::new(Self {
            config: Arc::new(config),
            store,
            broker,
            coordinator,
            registry,
            router,
            dispatcher,
            storage,
            auth,
            log_reload_handle,
            stats: StatsState::new(),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// The broker topics this node consumes: its own and the cluster kick topic.
    pub fn inbound_topics(&self) -> Vec<String> {
        vec![
            self.config.node_topic().to_string(),
            self.config.broker.kick_topic.clone(),
        ]
    }
}
