// src/core/broker/mod.rs

//! The topic-addressed durable message log used for cross-node and
//! cross-service delivery.

use crate::config::{BrokerConfig, BrokerMode, StoreConfig};
use crate::core::GatewayError;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

pub mod memory;
pub mod stream;

pub use memory::MemoryBroker;
pub use stream::StreamBroker;

/// Capacity of the channel handed out by `subscribe`.
pub const CONSUMER_CAPACITY: usize = 1024;

/// A message read from a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Appends `payload` to `topic`.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), GatewayError>;

    /// Consumes `topic` starting from its newest entry.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<BrokerMessage>, GatewayError>;
}

/// Builds the configured broker.
pub async fn connect(
    config: &BrokerConfig,
    store: &StoreConfig,
) -> Result<Arc<dyn Broker>, GatewayError> {
    match config.mode {
        BrokerMode::Memory => Ok(Arc::new(MemoryBroker::with_retention(config.memory_retention))),
        BrokerMode::Stream => Ok(Arc::new(StreamBroker::connect(config.clone(), store).await?)),
    }
}
