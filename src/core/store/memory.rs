// src/core/store/memory.rs

//! An in-process implementation of [`SharedStore`].
//!
//! Several gateway nodes built in the same process can share one `MemoryStore`,
//! which is how the multi-node tests run. Keys expire lazily on access.

use super::{SUBSCRIPTION_CAPACITY, SharedStore, StoreCondition, StoreOp};
use crate::core::GatewayError;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

/// The capacity of each pub/sub broadcast channel.
const CHANNEL_CAPACITY: usize = 128;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// An in-memory shared store with failure injection for tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    keyspace: Mutex<HashMap<String, Entry>>,
    channels: DashMap<String, broadcast::Sender<Bytes>>,
    unavailable: AtomicBool,
    publish_unavailable: AtomicBool,
    publishes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Default::default()
    }

    /// Makes every operation fail as if the store were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Makes only `publish` fail.
    pub fn set_publish_unavailable(&self, unavailable: bool) {
        self.publish_unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// The number of successful `publish` calls.
    pub fn publish_count(&self) -> u64 {
        self.publishes.load(Ordering::SeqCst)
    }

    /// The remaining time to live of `key`, if it exists and has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let keyspace = self.keyspace.lock();
        keyspace
            .get(key)
            .filter(|e| !e.is_expired(now))
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    fn check(&self) -> Result<(), GatewayError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(GatewayError::Store("store unavailable".to_string()));
        }
        Ok(())
    }

    /// Runs `f` over the keyspace with expired entries already purged for `keys`.
    fn with_keyspace<R>(
        &self,
        keys: &[&str],
        f: impl FnOnce(&mut HashMap<String, Entry>) -> Result<R, GatewayError>,
    ) -> Result<R, GatewayError> {
        self.check()?;
        let now = Instant::now();
        let mut keyspace = self.keyspace.lock();
        for key in keys {
            if keyspace.get(*key).is_some_and(|e| e.is_expired(now)) {
                keyspace.remove(*key);
            }
        }
        f(&mut keyspace)
    }
}

fn wrong_type(key: &str) -> GatewayError {
    GatewayError::Store(format!(
        "WRONGTYPE Operation against key '{key}' holding the wrong kind of value"
    ))
}

fn op_key(op: &StoreOp) -> &str {
    match op {
        StoreOp::HSet { key, .. }
        | StoreOp::HDel { key, .. }
        | StoreOp::SAdd { key, .. }
        | StoreOp::SRem { key, .. }
        | StoreOp::Del { key } => key,
    }
}

/// Type-checks every operation before any of them is applied.
fn validate_ops(keyspace: &HashMap<String, Entry>, ops: &[StoreOp]) -> Result<(), GatewayError> {
    for op in ops {
        let key = op_key(op);
        let Some(entry) = keyspace.get(key) else {
            continue;
        };
        let ok = match op {
            StoreOp::HSet { .. } | StoreOp::HDel { .. } => matches!(entry.value, Value::Hash(_)),
            StoreOp::SAdd { .. } | StoreOp::SRem { .. } => matches!(entry.value, Value::Set(_)),
            StoreOp::Del { .. } => true,
        };
        if !ok {
            return Err(wrong_type(key));
        }
    }
    Ok(())
}

fn apply_ops(keyspace: &mut HashMap<String, Entry>, ops: Vec<StoreOp>) {
    for op in ops {
        match op {
            StoreOp::HSet { key, field, value } => {
                let entry = keyspace.entry(key).or_insert_with(|| Entry {
                    value: Value::Hash(HashMap::new()),
                    expires_at: None,
                });
                if let Value::Hash(h) = &mut entry.value {
                    h.insert(field, value);
                }
            }
            StoreOp::HDel { key, field } => {
                let now_empty = match keyspace.get_mut(&key).map(|e| &mut e.value) {
                    Some(Value::Hash(h)) => {
                        h.remove(&field);
                        h.is_empty()
                    }
                    _ => false,
                };
                if now_empty {
                    keyspace.remove(&key);
                }
            }
            StoreOp::SAdd { key, member } => {
                let entry = keyspace.entry(key).or_insert_with(|| Entry {
                    value: Value::Set(HashSet::new()),
                    expires_at: None,
                });
                if let Value::Set(s) = &mut entry.value {
                    s.insert(member);
                }
            }
            StoreOp::SRem { key, member } => {
                let now_empty = match keyspace.get_mut(&key).map(|e| &mut e.value) {
                    Some(Value::Set(s)) => {
                        s.remove(&member);
                        s.is_empty()
                    }
                    _ => false,
                };
                if now_empty {
                    keyspace.remove(&key);
                }
            }
            StoreOp::Del { key } => {
                keyspace.remove(&key);
            }
        }
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn ping(&self) -> Result<(), GatewayError> {
        self.check()
    }

    async fn set_nx_px(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, GatewayError> {
        self.with_keyspace(&[key], |keyspace| {
            if keyspace.contains_key(key) {
                return Ok(false);
            }
            keyspace.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(value.to_string()),
                    expires_at: Some(Instant::now() + ttl),
                },
            );
            Ok(true)
        })
    }

    async fn set_px(&self, key: &str, value: &str, ttl: Duration) -> Result<(), GatewayError> {
        self.with_keyspace(&[key], |keyspace| {
            keyspace.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(value.to_string()),
                    expires_at: Some(Instant::now() + ttl),
                },
            );
            Ok(())
        })
    }

    async fn get(&self, key: &str) -> Result<Option<String>, GatewayError> {
        self.with_keyspace(&[key], |keyspace| match keyspace.get(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn del(&self, key: &str) -> Result<bool, GatewayError> {
        self.with_keyspace(&[key], |keyspace| Ok(keyspace.remove(key).is_some()))
    }

    async fn del_if_eq(&self, key: &str, expected: &str) -> Result<bool, GatewayError> {
        self.with_keyspace(&[key], |keyspace| {
            let matches = matches!(
                keyspace.get(key),
                Some(Entry { value: Value::Str(s), .. }) if s == expected
            );
            if matches {
                keyspace.remove(key);
            }
            Ok(matches)
        })
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, GatewayError> {
        self.with_keyspace(&[key], |keyspace| match keyspace.get(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Hash(h),
                ..
            }) => Ok(h.get(field).cloned()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, GatewayError> {
        self.with_keyspace(&[key], |keyspace| match keyspace.get(key) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::Set(s),
                ..
            }) => {
                let mut members: Vec<String> = s.iter().cloned().collect();
                members.sort();
                Ok(members)
            }
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn exec_transaction(&self, ops: Vec<StoreOp>) -> Result<(), GatewayError> {
        let keys: Vec<String> = ops.iter().map(|op| op_key(op).to_string()).collect();
        let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        self.with_keyspace(&key_refs, |keyspace| {
            validate_ops(keyspace, &ops)?;
            apply_ops(keyspace, ops);
            Ok(())
        })
    }

    async fn exec_if(
        &self,
        condition: StoreCondition,
        ops: Vec<StoreOp>,
    ) -> Result<bool, GatewayError> {
        let StoreCondition::HashFieldEquals { key, field, value } = &condition;
        let mut keys: Vec<String> = ops.iter().map(|op| op_key(op).to_string()).collect();
        keys.push(key.clone());
        let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        self.with_keyspace(&key_refs, |keyspace| {
            let holds = match keyspace.get(key.as_str()) {
                None => false,
                Some(Entry {
                    value: Value::Hash(h),
                    ..
                }) => h.get(field.as_str()) == Some(value),
                Some(_) => return Err(wrong_type(key)),
            };
            if !holds {
                return Ok(false);
            }
            validate_ops(keyspace, &ops)?;
            apply_ops(keyspace, ops);
            Ok(true)
        })
    }

    async fn publish(&self, channel: &str, message: Bytes) -> Result<usize, GatewayError> {
        self.check()?;
        if self.publish_unavailable.load(Ordering::SeqCst) {
            return Err(GatewayError::Store("publish failed".to_string()));
        }
        self.publishes.fetch_add(1, Ordering::SeqCst);
        let receivers = self
            .channels
            .get(channel)
            .map_or(0, |sender| sender.send(message).unwrap_or(0));
        Ok(receivers)
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Bytes>, GatewayError> {
        self.check()?;
        let mut rx = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .value()
            .subscribe();
        let (tx, out) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let channel = channel.to_string();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => {
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("Subscriber on '{}' lagged by {} messages.", channel, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(out)
    }
}
