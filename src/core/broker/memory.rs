// src/core/broker/memory.rs

//! An in-process [`Broker`] keeping every topic as a bounded append-only log.
//!
//! Offsets are absolute: trimming the head of a log never shifts the position
//! of a consumer. A consumer that falls behind the retained window skips to
//! the oldest entry still held.

use super::{Broker, BrokerMessage, CONSUMER_CAPACITY};
use crate::core::GatewayError;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, watch};
use tracing::warn;

/// Entries kept per topic by [`MemoryBroker::new`].
pub const DEFAULT_RETENTION: usize = 10_000;

#[derive(Debug, Default)]
struct LogState {
    entries: VecDeque<Bytes>,
    /// Absolute offset of `entries[0]`.
    base: usize,
}

#[derive(Debug)]
struct TopicLog {
    state: RwLock<LogState>,
    /// Carries the absolute end offset so consumers can wait for appends.
    length: watch::Sender<usize>,
}

impl TopicLog {
    fn new() -> Self {
        Self {
            state: RwLock::new(LogState::default()),
            length: watch::channel(0).0,
        }
    }

    fn append(&self, payload: Bytes, retention: Option<usize>) {
        let mut state = self.state.write();
        state.entries.push_back(payload);
        if let Some(limit) = retention {
            while state.entries.len() > limit {
                state.entries.pop_front();
                state.base += 1;
            }
        }
        self.length.send_replace(state.base + state.entries.len());
    }

    /// Returns the offset actually read from and the entries from there on.
    fn read_from(&self, offset: usize) -> (usize, Vec<Bytes>) {
        let state = self.state.read();
        let start = offset.max(state.base);
        let entries = state.entries.range(start - state.base..).cloned().collect();
        (start, entries)
    }

    fn retained(&self) -> usize {
        self.state.read().entries.len()
    }
}

/// An in-memory broker for single-process deployments and tests.
#[derive(Debug)]
pub struct MemoryBroker {
    topics: DashMap<String, Arc<TopicLog>>,
    /// `None` keeps every entry.
    retention: Option<usize>,
    unavailable: AtomicBool,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// A broker keeping the newest [`DEFAULT_RETENTION`] entries of each topic.
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    /// A broker keeping the newest `limit` entries of each topic.
    pub fn with_retention(limit: usize) -> Self {
        Self::build(Some(limit.max(1)))
    }

    /// A broker that never trims, so tests can inspect everything published.
    pub fn retaining_all() -> Self {
        Self::build(None)
    }

    fn build(retention: Option<usize>) -> Self {
        Self {
            topics: DashMap::new(),
            retention,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Makes `publish` and `subscribe` fail as if the broker were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// The retained entries of `topic`, oldest first.
    pub fn published(&self, topic: &str) -> Vec<Bytes> {
        self.topics
            .get(topic)
            .map(|log| log.read_from(0).1)
            .unwrap_or_default()
    }

    /// Number of entries ever published to `topic`, including trimmed ones.
    pub fn published_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map_or(0, |log| *log.length.borrow())
    }

    /// Number of entries `topic` currently holds.
    pub fn retained_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, |log| log.retained())
    }

    /// Total number of entries published across all topics.
    pub fn total_published(&self) -> usize {
        self.topics.iter().map(|log| *log.length.borrow()).sum()
    }

    fn topic(&self, topic: &str) -> Arc<TopicLog> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(TopicLog::new()))
            .value()
            .clone()
    }

    fn check(&self) -> Result<(), GatewayError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(GatewayError::Broker("broker unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), GatewayError> {
        self.check()?;
        self.topic(topic).append(payload, self.retention);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<BrokerMessage>, GatewayError> {
        self.check()?;
        let log = self.topic(topic);
        let mut length_rx = log.length.subscribe();
        let mut offset = *length_rx.borrow_and_update();
        let (tx, rx) = mpsc::channel(CONSUMER_CAPACITY);
        let topic = topic.to_string();
        tokio::spawn(async move {
            loop {
                let (start, batch) = log.read_from(offset);
                if start > offset {
                    warn!(
                        "Consumer on '{}' fell behind; {} entries were trimmed before delivery.",
                        topic,
                        start - offset
                    );
                }
                offset = start;
                for payload in batch {
                    offset += 1;
                    let msg = BrokerMessage {
                        topic: topic.clone(),
                        payload,
                    };
                    if tx.send(msg).await.is_err() {
                        return;
                    }
                }
                tokio::select! {
                    changed = length_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    _ = tx.closed() => return,
                }
            }
        });
        Ok(rx)
    }
}
