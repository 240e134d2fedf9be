// src/core/metrics.rs

//! Defines and registers Prometheus metrics for gateway monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only once
//! globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, TextEncoder, register_counter, register_counter_vec,
    register_gauge,
};

lazy_static! {
    // --- Gateway-wide Gauges ---
    /// The number of WebSocket clients currently connected to this node.
    pub static ref CONNECTED_CLIENTS: Gauge =
        register_gauge!("spinelgate_connected_clients", "Number of currently connected clients.").unwrap();
    /// The number of users bound to a connection on this node.
    pub static ref LOGGED_IN_USERS: Gauge =
        register_gauge!("spinelgate_logged_in_users", "Number of users with a live local binding.").unwrap();

    // --- Gateway-wide Counters ---
    /// The total number of connections accepted since startup.
    pub static ref CONNECTIONS_RECEIVED_TOTAL: Counter =
        register_counter!("spinelgate_connections_received_total", "Total number of connections received.").unwrap();
    /// Messages routed, labeled by the path taken (`local`, `cross_node`, `offline`).
    pub static ref ROUTED_MESSAGES_TOTAL: CounterVec =
        register_counter_vec!("spinelgate_routed_messages_total", "Total number of routed messages, labeled by route.", &["route"]).unwrap();
    /// Routing attempts that ended in an error, labeled by the error kind.
    pub static ref ROUTING_ERRORS_TOTAL: CounterVec =
        register_counter_vec!("spinelgate_routing_errors_total", "Total number of routing failures, labeled by kind.", &["kind"]).unwrap();
    /// Kick notifications, labeled by path (`pubsub`, `broker`, `received`).
    pub static ref KICKS_TOTAL: CounterVec =
        register_counter_vec!("spinelgate_kicks_total", "Total number of kick notifications, labeled by path.", &["path"]).unwrap();
    /// Logins rejected as retryable conflicts.
    pub static ref LOGIN_CONFLICTS_TOTAL: Counter =
        register_counter!("spinelgate_login_conflicts_total", "Total number of logins rejected with a retryable conflict.").unwrap();
    /// Session records forcibly deleted after the verification ceiling.
    pub static ref SESSION_OVERRIDES_TOTAL: Counter =
        register_counter!("spinelgate_session_overrides_total", "Total number of stale session records overridden during login.").unwrap();
    /// Outbound messages dropped because a connection queue was full.
    pub static ref DROPPED_MESSAGES_TOTAL: Counter =
        register_counter!("spinelgate_dropped_messages_total", "Total number of outbound messages dropped on a full queue.").unwrap();
    /// Broker messages handled by the inbound dispatcher, labeled by outcome.
    pub static ref DISPATCHED_MESSAGES_TOTAL: CounterVec =
        register_counter_vec!("spinelgate_dispatched_messages_total", "Total number of inbound broker messages, labeled by outcome.", &["outcome"]).unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap_or_default()
}
