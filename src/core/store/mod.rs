// src/core/store/mod.rs

//! The shared key-value store used for cross-node coordination.
//!
//! Every node talks to the same store. It provides atomic conditional set with
//! TTL, multi-operation transactions, and publish/subscribe. Two backends exist:
//! an in-process [`MemoryStore`] and a RESP client, [`RespStore`], for any
//! Redis-protocol server.

use crate::config::{StoreConfig, StoreMode};
use crate::core::GatewayError;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub mod memory;
pub mod resp;
pub mod resp_client;

pub use memory::MemoryStore;
pub use resp::RespStore;

/// Capacity of the channel handed out by `subscribe`.
pub const SUBSCRIPTION_CAPACITY: usize = 128;

/// One write inside an atomic transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    HSet {
        key: String,
        field: String,
        value: String,
    },
    HDel {
        key: String,
        field: String,
    },
    SAdd {
        key: String,
        member: String,
    },
    SRem {
        key: String,
        member: String,
    },
    Del {
        key: String,
    },
}

/// A guard checked atomically before a conditional transaction runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCondition {
    HashFieldEquals {
        key: String,
        field: String,
        value: String,
    },
}

#[async_trait]
pub trait SharedStore: Send + Sync + 'static {
    async fn ping(&self) -> Result<(), GatewayError>;

    /// Sets `key` only if it does not exist. Returns whether the value was written.
    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration)
    -> Result<bool, GatewayError>;

    /// Unconditionally sets `key` with a TTL.
    async fn set_px(&self, key: &str, value: &str, ttl: Duration) -> Result<(), GatewayError>;

    async fn get(&self, key: &str) -> Result<Option<String>, GatewayError>;

    /// Deletes `key`, returning whether it existed.
    async fn del(&self, key: &str) -> Result<bool, GatewayError>;

    /// Deletes `key` only if it currently holds `expected`.
    async fn del_if_eq(&self, key: &str, expected: &str) -> Result<bool, GatewayError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, GatewayError>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>, GatewayError>;

    /// Applies all operations atomically.
    async fn exec_transaction(&self, ops: Vec<StoreOp>) -> Result<(), GatewayError>;

    /// Applies all operations atomically if `condition` holds. Returns whether they ran.
    async fn exec_if(
        &self,
        condition: StoreCondition,
        ops: Vec<StoreOp>,
    ) -> Result<bool, GatewayError>;

    /// Publishes on a pub/sub channel. Returns the number of receivers.
    async fn publish(&self, channel: &str, message: Bytes) -> Result<usize, GatewayError>;

    /// Subscribes to a pub/sub channel. Delivery is best-effort.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Bytes>, GatewayError>;
}

/// Builds the configured store, retrying the initial connection with backoff.
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn SharedStore>, GatewayError> {
    match config.mode {
        StoreMode::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreMode::Resp => Ok(Arc::new(RespStore::connect(config.clone()).await?)),
    }
}
