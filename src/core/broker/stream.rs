// src/core/broker/stream.rs

//! A [`Broker`] built on RESP streams (`XADD` / `XREAD BLOCK`).
//!
//! Each topic is one stream. A consumer pins the id of the newest entry when
//! it subscribes and only ever advances past ids it has received, so entries
//! appended between two reads or across a reconnect are still delivered.

use super::{Broker, BrokerMessage, CONSUMER_CAPACITY};
use crate::config::{BrokerConfig, StoreConfig};
use crate::core::GatewayError;
use crate::core::protocol::RespFrame;
use crate::core::store::resp_client::{RespConnection, connect_with_retry};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// The id below every real stream entry id.
pub const STREAM_START_ID: &str = "0-0";
/// The single field every stream entry carries.
const PAYLOAD_FIELD: &str = "payload";
/// Upper bound on retained entries per topic.
const MAX_STREAM_LEN: &str = "100000";
const READ_BATCH: &str = "128";

pub struct StreamBroker {
    config: BrokerConfig,
    connect_timeout: Duration,
    command_timeout: Duration,
    publisher: Mutex<Option<RespConnection>>,
    publish_lock: tokio::sync::Mutex<()>,
}

impl StreamBroker {
    /// Connects to the broker address, reusing the store's timeouts and startup policy.
    pub async fn connect(config: BrokerConfig, store: &StoreConfig) -> Result<Self, GatewayError> {
        let conn = connect_with_retry(
            &config.addr,
            store.connect_timeout,
            store.command_timeout,
            store.startup_retries,
            store.startup_backoff,
        )
        .await
        .map_err(|e| GatewayError::Broker(e.to_string()))?;
        info!("Connected to stream broker at {}.", config.addr);
        Ok(Self {
            connect_timeout: store.connect_timeout,
            command_timeout: store.command_timeout,
            publisher: Mutex::new(Some(conn)),
            publish_lock: tokio::sync::Mutex::new(()),
            config,
        })
    }

    async fn open(&self) -> Result<RespConnection, GatewayError> {
        RespConnection::connect(&self.config.addr, self.connect_timeout, self.command_timeout)
            .await
            .map_err(|e| GatewayError::Broker(e.to_string()))
    }
}

#[async_trait]
impl Broker for StreamBroker {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), GatewayError> {
        let _serial = self.publish_lock.lock().await;
        let existing = self.publisher.lock().take();
        let mut conn = match existing {
            Some(conn) => conn,
            None => self.open().await?,
        };
        let frame = RespFrame::Array(vec![
            RespFrame::BulkString(Bytes::from_static(b"XADD")),
            RespFrame::BulkString(Bytes::from(topic.to_string())),
            RespFrame::BulkString(Bytes::from_static(b"MAXLEN")),
            RespFrame::BulkString(Bytes::from_static(b"~")),
            RespFrame::BulkString(Bytes::from_static(MAX_STREAM_LEN.as_bytes())),
            RespFrame::BulkString(Bytes::from_static(b"*")),
            RespFrame::BulkString(Bytes::from_static(PAYLOAD_FIELD.as_bytes())),
            RespFrame::BulkString(payload),
        ]);
        match conn.call(frame).await {
            Ok(_) => {
                *self.publisher.lock() = Some(conn);
                Ok(())
            }
            Err(e) => Err(GatewayError::Broker(format!("XADD to '{topic}' failed: {e}"))),
        }
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<BrokerMessage>, GatewayError> {
        let mut conn = self.open().await?;
        let start_id = newest_entry_id(&mut conn, topic).await?;
        debug!("Consumer on '{}' starts after entry {}.", topic, start_id);
        let (tx, rx) = mpsc::channel(CONSUMER_CAPACITY);
        let topic = topic.to_string();
        let block = self.config.block_timeout;
        let addr = self.config.addr.clone();
        let (connect_timeout, command_timeout) = (self.connect_timeout, self.command_timeout);

        tokio::spawn(async move {
            let mut last_id = start_id;
            let mut backoff = Duration::from_millis(200);
            loop {
                if tx.is_closed() {
                    break;
                }
                let read = tokio::select! {
                    read = read_batch(&mut conn, &topic, &last_id, block, command_timeout) => read,
                    _ = tx.closed() => break,
                };
                match read {
                    Ok(entries) => {
                        backoff = Duration::from_millis(200);
                        for (id, payload) in entries {
                            last_id = id;
                            let Some(payload) = payload else {
                                debug!("Skipping stream entry {} without a payload field.", last_id);
                                continue;
                            };
                            let msg = BrokerMessage {
                                topic: topic.clone(),
                                payload,
                            };
                            if tx.send(msg).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        warn!("Consumer on '{}' failed: {}. Reconnecting in {:?}.", topic, e, backoff);
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(Duration::from_secs(10));
                        match RespConnection::connect(&addr, connect_timeout, command_timeout).await {
                            Ok(new_conn) => conn = new_conn,
                            Err(e) => debug!("Reconnect for '{}' failed: {}", topic, e),
                        }
                    }
                }
            }
            debug!("Consumer on '{}' stopped.", topic);
        });
        Ok(rx)
    }
}

/// Resolves the id of the newest entry of `topic` with `XREVRANGE`.
async fn newest_entry_id(conn: &mut RespConnection, topic: &str) -> Result<String, GatewayError> {
    let frame = RespFrame::command([
        "XREVRANGE".to_string(),
        topic.to_string(),
        "+".to_string(),
        "-".to_string(),
        "COUNT".to_string(),
        "1".to_string(),
    ]);
    let reply = conn
        .call(frame)
        .await
        .map_err(|e| GatewayError::Broker(format!("XREVRANGE on '{topic}' failed: {e}")))?;
    parse_newest_id(reply)
}

/// Reads the id out of an `XREVRANGE .. COUNT 1` reply. An empty or missing
/// stream yields [`STREAM_START_ID`].
pub fn parse_newest_id(reply: RespFrame) -> Result<String, GatewayError> {
    let entries = match reply {
        RespFrame::Null | RespFrame::NullArray => return Ok(STREAM_START_ID.to_string()),
        RespFrame::Array(entries) => entries,
        other => {
            return Err(GatewayError::Broker(format!("unexpected XREVRANGE reply: {other:?}")));
        }
    };
    let Some(RespFrame::Array(entry)) = entries.into_iter().next() else {
        return Ok(STREAM_START_ID.to_string());
    };
    match entry.first().and_then(RespFrame::as_bytes) {
        Some(id) => Ok(String::from_utf8(id.to_vec())?),
        None => Err(GatewayError::Broker("XREVRANGE entry without an id".to_string())),
    }
}

/// Issues one `XREAD BLOCK` and returns `(id, payload)` pairs in order.
async fn read_batch(
    conn: &mut RespConnection,
    topic: &str,
    last_id: &str,
    block: Duration,
    command_timeout: Duration,
) -> Result<Vec<(String, Option<Bytes>)>, GatewayError> {
    let frame = RespFrame::command([
        "XREAD".to_string(),
        "COUNT".to_string(),
        READ_BATCH.to_string(),
        "BLOCK".to_string(),
        block.as_millis().to_string(),
        "STREAMS".to_string(),
        topic.to_string(),
        last_id.to_string(),
    ]);
    conn.send(frame).await?;
    let reply = conn.read_with_timeout(block + command_timeout).await?.into_result()?;
    parse_xread(reply)
}

/// Flattens `[[topic, [[id, [field, value, ...]], ...]]]` into entries. Every
/// id is returned so the reader can move past entries with no payload field.
pub fn parse_xread(reply: RespFrame) -> Result<Vec<(String, Option<Bytes>)>, GatewayError> {
    let streams = match reply {
        RespFrame::Null | RespFrame::NullArray => return Ok(Vec::new()),
        RespFrame::Array(streams) => streams,
        other => return Err(GatewayError::Broker(format!("unexpected XREAD reply: {other:?}"))),
    };
    let mut out = Vec::new();
    for stream in streams {
        let RespFrame::Array(mut parts) = stream else {
            continue;
        };
        let Some(RespFrame::Array(entries)) = parts.pop() else {
            continue;
        };
        for entry in entries {
            let RespFrame::Array(fields) = entry else {
                continue;
            };
            let [id, RespFrame::Array(kv)] = fields.as_slice() else {
                continue;
            };
            let Some(id) = id.as_bytes() else {
                continue;
            };
            let id = String::from_utf8(id.to_vec())?;
            let payload = kv
                .chunks(2)
                .find(|pair| pair[0].as_bytes().as_deref() == Some(PAYLOAD_FIELD.as_bytes()))
                .and_then(|pair| pair.get(1))
                .and_then(RespFrame::as_bytes);
            out.push((id, payload));
        }
    }
    Ok(out)
}
