// src/core/store/resp.rs

//! [`SharedStore`] over the RESP protocol, for Redis-compatible servers.

use super::resp_client::{RespConnection, connect_with_retry, frame_to_string};
use super::{SUBSCRIPTION_CAPACITY, SharedStore, StoreCondition, StoreOp};
use crate::config::StoreConfig;
use crate::core::GatewayError;
use crate::core::protocol::RespFrame;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, info, warn};

/// Deletes a key only if it still holds the expected value.
const DEL_IF_EQ_SCRIPT: &str = "if redis.call('GET', KEYS[1]) == ARGV[1] then return redis.call('DEL', KEYS[1]) else return 0 end";

/// Attempts at a WATCH-guarded transaction before reporting the condition as failed.
const CONDITIONAL_TX_ATTEMPTS: usize = 3;

/// A pooled RESP client.
pub struct RespStore {
    config: StoreConfig,
    idle: Mutex<Vec<RespConnection>>,
    permits: Semaphore,
}

impl RespStore {
    /// Connects to the configured address, retrying with backoff until the
    /// server answers `PING`.
    pub async fn connect(config: StoreConfig) -> Result<Self, GatewayError> {
        let first = connect_with_retry(
            &config.addr,
            config.connect_timeout,
            config.command_timeout,
            config.startup_retries,
            config.startup_backoff,
        )
        .await?;
        info!("Connected to shared store at {}.", config.addr);
        Ok(Self {
            permits: Semaphore::new(config.pool_size),
            idle: Mutex::new(vec![first]),
            config,
        })
    }

    async fn checkout(&self) -> Result<RespConnection, GatewayError> {
        if let Some(conn) = self.idle.lock().pop() {
            return Ok(conn);
        }
        RespConnection::connect(
            &self.config.addr,
            self.config.connect_timeout,
            self.config.command_timeout,
        )
        .await
    }

    /// Runs `f` on a pooled connection. The connection is discarded on error.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, GatewayError>
    where
        F: for<'c> FnOnce(
            &'c mut RespConnection,
        ) -> futures::future::BoxFuture<'c, Result<T, GatewayError>>,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| GatewayError::Store("connection pool closed".to_string()))?;
        let mut conn = self.checkout().await?;
        let result = f(&mut conn).await;
        if is_broken(&result) {
            debug!("Discarding broken store connection.");
        } else {
            self.idle.lock().push(conn);
        }
        result
    }

    async fn call(&self, frame: RespFrame) -> Result<RespFrame, GatewayError> {
        self.with_conn(move |conn| Box::pin(conn.call(frame))).await
    }
}

/// Server `-ERR` replies leave the connection usable; anything else does not.
fn is_broken<T>(result: &Result<T, GatewayError>) -> bool {
    match result {
        Ok(_) => false,
        Err(GatewayError::Store(msg)) => msg.contains("timed out") || msg.contains("closed by peer"),
        Err(_) => true,
    }
}

fn op_frame(op: StoreOp) -> RespFrame {
    match op {
        StoreOp::HSet { key, field, value } => RespFrame::command(["HSET".to_string(), key, field, value]),
        StoreOp::HDel { key, field } => RespFrame::command(["HDEL".to_string(), key, field]),
        StoreOp::SAdd { key, member } => RespFrame::command(["SADD".to_string(), key, member]),
        StoreOp::SRem { key, member } => RespFrame::command(["SREM".to_string(), key, member]),
        StoreOp::Del { key } => RespFrame::command(["DEL".to_string(), key]),
    }
}

/// Queues `ops` inside MULTI/EXEC on `conn`. Returns `false` if EXEC was aborted.
async fn run_multi(conn: &mut RespConnection, ops: Vec<StoreOp>) -> Result<bool, GatewayError> {
    let mut frames = Vec::with_capacity(ops.len() + 2);
    frames.push(RespFrame::command(["MULTI"]));
    frames.extend(ops.into_iter().map(op_frame));
    frames.push(RespFrame::command(["EXEC"]));

    let replies = conn.pipeline(frames).await?;
    for reply in &replies[..replies.len() - 1] {
        if let RespFrame::Error(e) = reply {
            return Err(GatewayError::Store(format!("transaction rejected: {e}")));
        }
    }
    match replies.last() {
        Some(RespFrame::NullArray) | Some(RespFrame::Null) => Ok(false),
        Some(RespFrame::Array(results)) => {
            if let Some(RespFrame::Error(e)) = results.iter().find(|r| matches!(r, RespFrame::Error(_))) {
                return Err(GatewayError::Store(format!("transaction step failed: {e}")));
            }
            Ok(true)
        }
        Some(RespFrame::Error(e)) => Err(GatewayError::Store(e.clone())),
        other => Err(GatewayError::Store(format!("unexpected EXEC reply: {other:?}"))),
    }
}

fn millis(ttl: Duration) -> String {
    ttl.as_millis().max(1).to_string()
}

#[async_trait]
impl SharedStore for RespStore {
    async fn ping(&self) -> Result<(), GatewayError> {
        self.call(RespFrame::command(["PING"])).await.map(|_| ())
    }

    async fn set_nx_px(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, GatewayError> {
        let frame = RespFrame::command([
            "SET".to_string(),
            key.to_string(),
            value.to_string(),
            "NX".to_string(),
            "PX".to_string(),
            millis(ttl),
        ]);
        Ok(!self.call(frame).await?.is_null())
    }

    async fn set_px(&self, key: &str, value: &str, ttl: Duration) -> Result<(), GatewayError> {
        let frame = RespFrame::command([
            "SET".to_string(),
            key.to_string(),
            value.to_string(),
            "PX".to_string(),
            millis(ttl),
        ]);
        self.call(frame).await.map(|_| ())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, GatewayError> {
        let reply = self
            .call(RespFrame::command(["GET".to_string(), key.to_string()]))
            .await?;
        frame_to_string(&reply)
    }

    async fn del(&self, key: &str) -> Result<bool, GatewayError> {
        let reply = self
            .call(RespFrame::command(["DEL".to_string(), key.to_string()]))
            .await?;
        Ok(reply.as_integer().unwrap_or(0) > 0)
    }

    async fn del_if_eq(&self, key: &str, expected: &str) -> Result<bool, GatewayError> {
        let frame = RespFrame::command([
            "EVAL".to_string(),
            DEL_IF_EQ_SCRIPT.to_string(),
            "1".to_string(),
            key.to_string(),
            expected.to_string(),
        ]);
        Ok(self.call(frame).await?.as_integer().unwrap_or(0) > 0)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, GatewayError> {
        let reply = self
            .call(RespFrame::command([
                "HGET".to_string(),
                key.to_string(),
                field.to_string(),
            ]))
            .await?;
        frame_to_string(&reply)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, GatewayError> {
        let reply = self
            .call(RespFrame::command(["SMEMBERS".to_string(), key.to_string()]))
            .await?;
        match reply {
            RespFrame::Array(items) => {
                let mut members = Vec::with_capacity(items.len());
                for item in &items {
                    if let Some(member) = frame_to_string(item)? {
                        members.push(member);
                    }
                }
                members.sort();
                Ok(members)
            }
            other => Err(GatewayError::Store(format!(
                "unexpected SMEMBERS reply: {other:?}"
            ))),
        }
    }

    async fn exec_transaction(&self, ops: Vec<StoreOp>) -> Result<(), GatewayError> {
        let committed = self
            .with_conn(move |conn| Box::pin(run_multi(conn, ops)))
            .await?;
        if committed {
            Ok(())
        } else {
            Err(GatewayError::Store("transaction aborted".to_string()))
        }
    }

    async fn exec_if(
        &self,
        condition: StoreCondition,
        ops: Vec<StoreOp>,
    ) -> Result<bool, GatewayError> {
        self.with_conn(move |conn| {
            Box::pin(async move {
                let StoreCondition::HashFieldEquals { key, field, value } = condition;
                for attempt in 1..=CONDITIONAL_TX_ATTEMPTS {
                    conn.call(RespFrame::command(["WATCH".to_string(), key.clone()]))
                        .await?;
                    let current = conn
                        .call(RespFrame::command([
                            "HGET".to_string(),
                            key.clone(),
                            field.clone(),
                        ]))
                        .await?;
                    if frame_to_string(&current)?.as_deref() != Some(value.as_str()) {
                        conn.call(RespFrame::command(["UNWATCH"])).await?;
                        return Ok(false);
                    }
                    if run_multi(conn, ops.clone()).await? {
                        return Ok(true);
                    }
                    debug!(
                        "Conditional transaction on '{}' raced a concurrent write (attempt {}).",
                        key, attempt
                    );
                }
                warn!(
                    "Conditional transaction on '{}' kept racing concurrent writes; giving up.",
                    key
                );
                Ok(false)
            })
        })
        .await
    }

    async fn publish(&self, channel: &str, message: Bytes) -> Result<usize, GatewayError> {
        let frame = RespFrame::Array(vec![
            RespFrame::BulkString(Bytes::from_static(b"PUBLISH")),
            RespFrame::BulkString(Bytes::from(channel.to_string())),
            RespFrame::BulkString(message),
        ]);
        let receivers = self.call(frame).await?.as_integer().unwrap_or(0);
        Ok(receivers.max(0) as usize)
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Bytes>, GatewayError> {
        let mut conn = subscribe_on(&self.config, channel).await?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let channel = channel.to_string();
        let config = self.config.clone();
        tokio::spawn(async move {
            let mut backoff = config.startup_backoff;
            loop {
                match forward_messages(&mut conn, &tx).await {
                    Ok(()) => break,
                    Err(e) => warn!("Subscription to '{}' lost: {}. Reconnecting.", channel, e),
                }
                loop {
                    if tx.is_closed() {
                        return;
                    }
                    tokio::time::sleep(backoff).await;
                    match subscribe_on(&config, &channel).await {
                        Ok(new_conn) => {
                            info!("Resubscribed to '{}'.", channel);
                            conn = new_conn;
                            backoff = config.startup_backoff;
                            break;
                        }
                        Err(e) => {
                            debug!("Resubscribe to '{}' failed: {}", channel, e);
                            backoff = (backoff * 2).min(Duration::from_secs(10));
                        }
                    }
                }
            }
            debug!("Subscription to '{}' closed by its consumer.", channel);
        });
        Ok(rx)
    }
}

/// Opens a dedicated connection and issues `SUBSCRIBE`.
async fn subscribe_on(config: &StoreConfig, channel: &str) -> Result<RespConnection, GatewayError> {
    let mut conn =
        RespConnection::connect(&config.addr, config.connect_timeout, config.command_timeout)
            .await?;
    // The confirmation is an array, not an error, so `call` passes it through.
    conn.call(RespFrame::command(["SUBSCRIBE".to_string(), channel.to_string()]))
        .await?;
    Ok(conn)
}

/// Forwards `message` pushes until the consumer goes away (`Ok`) or the link fails.
async fn forward_messages(
    conn: &mut RespConnection,
    tx: &mpsc::Sender<Bytes>,
) -> Result<(), GatewayError> {
    loop {
        let frame = tokio::select! {
            frame = conn.read() => frame?,
            _ = tx.closed() => return Ok(()),
        };
        if let RespFrame::Array(parts) = frame
            && parts.len() == 3
            && parts[0].as_bytes().as_deref() == Some(b"message".as_slice())
            && let Some(payload) = parts[2].as_bytes()
            && tx.send(payload).await.is_err()
        {
            return Ok(());
        }
    }
}
