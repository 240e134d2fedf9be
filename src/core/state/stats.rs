// src/core/state/stats.rs

//! Contains state definitions and logic for gateway statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Running totals since startup. Prometheus carries the labelled views;
/// these are the plain counters logged at shutdown.
#[derive(Debug)]
pub struct StatsState {
    /// The total number of WebSocket connections accepted.
    total_connections: AtomicU64,
    /// The total number of client frames processed.
    total_frames: AtomicU64,
    /// The total number of successful logins.
    total_logins: AtomicU64,
}

impl Default for StatsState {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsState {
    pub fn new() -> Self {
        Self {
            total_connections: AtomicU64::new(0),
            total_frames: AtomicU64::new(0),
            total_logins: AtomicU64::new(0),
        }
    }

    pub fn increment_total_connections(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    pub fn increment_total_frames(&self) {
        self.total_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_frames(&self) -> u64 {
        self.total_frames.load(Ordering::Relaxed)
    }

    pub fn increment_total_logins(&self) {
        self.total_logins.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_logins(&self) -> u64 {
        self.total_logins.load(Ordering::Relaxed)
    }
}
