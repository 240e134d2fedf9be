// src/core/errors.rs

//! Defines the primary error type for the entire gateway.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the gateway.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Incomplete data in stream")]
    IncompleteData,

    /// The shared coordination store is unreachable or rejected an operation.
    #[error("Shared store error: {0}")]
    Store(String),

    /// The message broker is unreachable or rejected an operation.
    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("HTTP client error: {0}")]
    HttpClientError(String),

    #[error("Auth service error: {0}")]
    AuthService(String),

    /// The per-user lease is held by another login attempt.
    #[error("Login for user '{0}' is already in progress elsewhere, retry")]
    LoginInProgress(String),

    /// A stale session owner persisted past the verification ceiling.
    #[error("Login conflict for user '{0}', retry")]
    LoginConflict(String),

    #[error("Connection '{0}' not found")]
    ConnectionNotFound(String),

    #[error("Connection '{connection_id}' is already bound to user '{user_id}'")]
    AlreadyBound {
        connection_id: String,
        user_id: String,
    },

    #[error("User '{0}' is not connected to this node")]
    NotConnected(String),

    #[error("Outbound queue for user '{0}' is full")]
    QueueFull(String),

    #[error("No local session for user '{0}'")]
    SessionNotFound(String),

    /// The router saw a local miss while the shared map names this node.
    #[error("Routing inconsistency for user '{0}': owner map names this node but no local binding")]
    RoutingInconsistency(String),

    #[error("Broadcast failed for {} of the recipients: {}", failed.len(), failed.join(", "))]
    PartialBroadcast { failed: Vec<String> },

    #[error("Internal Server Error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Conflict errors the client should be told to retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::LoginInProgress(_) | GatewayError::LoginConflict(_)
        )
    }

    /// Errors caused by the shared store or the broker being unavailable.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::Store(_) | GatewayError::Broker(_) | GatewayError::Io(_)
        )
    }
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
impl Clone for GatewayError {
    fn clone(&self) -> Self {
        match self {
            GatewayError::Io(e) => GatewayError::Io(Arc::clone(e)),
            GatewayError::IncompleteData => GatewayError::IncompleteData,
            GatewayError::Store(s) => GatewayError::Store(s.clone()),
            GatewayError::Broker(s) => GatewayError::Broker(s.clone()),
            GatewayError::Protocol(s) => GatewayError::Protocol(s.clone()),
            GatewayError::MalformedEnvelope(s) => GatewayError::MalformedEnvelope(s.clone()),
            GatewayError::WebSocket(s) => GatewayError::WebSocket(s.clone()),
            GatewayError::HttpClientError(s) => GatewayError::HttpClientError(s.clone()),
            GatewayError::AuthService(s) => GatewayError::AuthService(s.clone()),
            GatewayError::LoginInProgress(s) => GatewayError::LoginInProgress(s.clone()),
            GatewayError::LoginConflict(s) => GatewayError::LoginConflict(s.clone()),
            GatewayError::ConnectionNotFound(s) => GatewayError::ConnectionNotFound(s.clone()),
            GatewayError::AlreadyBound {
                connection_id,
                user_id,
            } => GatewayError::AlreadyBound {
                connection_id: connection_id.clone(),
                user_id: user_id.clone(),
            },
            GatewayError::NotConnected(s) => GatewayError::NotConnected(s.clone()),
            GatewayError::QueueFull(s) => GatewayError::QueueFull(s.clone()),
            GatewayError::SessionNotFound(s) => GatewayError::SessionNotFound(s.clone()),
            GatewayError::RoutingInconsistency(s) => {
                GatewayError::RoutingInconsistency(s.clone())
            }
            GatewayError::PartialBroadcast { failed } => GatewayError::PartialBroadcast {
                failed: failed.clone(),
            },
            GatewayError::Internal(s) => GatewayError::Internal(s.clone()),
        }
    }
}

impl PartialEq for GatewayError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (GatewayError::Io(e1), GatewayError::Io(e2)) => e1.to_string() == e2.to_string(),
            (GatewayError::Store(s1), GatewayError::Store(s2)) => s1 == s2,
            (GatewayError::Broker(s1), GatewayError::Broker(s2)) => s1 == s2,
            (GatewayError::Protocol(s1), GatewayError::Protocol(s2)) => s1 == s2,
            (GatewayError::MalformedEnvelope(s1), GatewayError::MalformedEnvelope(s2)) => s1 == s2,
            (GatewayError::WebSocket(s1), GatewayError::WebSocket(s2)) => s1 == s2,
            (GatewayError::HttpClientError(s1), GatewayError::HttpClientError(s2)) => s1 == s2,
            (GatewayError::AuthService(s1), GatewayError::AuthService(s2)) => s1 == s2,
            (GatewayError::LoginInProgress(s1), GatewayError::LoginInProgress(s2)) => s1 == s2,
            (GatewayError::LoginConflict(s1), GatewayError::LoginConflict(s2)) => s1 == s2,
            (GatewayError::ConnectionNotFound(s1), GatewayError::ConnectionNotFound(s2)) => {
                s1 == s2
            }
            (
                GatewayError::AlreadyBound {
                    connection_id: c1,
                    user_id: u1,
                },
                GatewayError::AlreadyBound {
                    connection_id: c2,
                    user_id: u2,
                },
            ) => c1 == c2 && u1 == u2,
            (GatewayError::NotConnected(s1), GatewayError::NotConnected(s2)) => s1 == s2,
            (GatewayError::QueueFull(s1), GatewayError::QueueFull(s2)) => s1 == s2,
            (GatewayError::SessionNotFound(s1), GatewayError::SessionNotFound(s2)) => s1 == s2,
            (GatewayError::RoutingInconsistency(s1), GatewayError::RoutingInconsistency(s2)) => {
                s1 == s2
            }
            (
                GatewayError::PartialBroadcast { failed: f1 },
                GatewayError::PartialBroadcast { failed: f2 },
            ) => f1 == f2,
            (GatewayError::Internal(s1), GatewayError::Internal(s2)) => s1 == s2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for GatewayError {
    fn from(e: std::io::Error) -> Self {
        GatewayError::Io(Arc::new(e))
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        GatewayError::HttpClientError(e.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Protocol(format!("JSON error: {e}"))
    }
}

impl From<bincode::error::EncodeError> for GatewayError {
    fn from(e: bincode::error::EncodeError) -> Self {
        GatewayError::Internal(format!("Failed to encode message: {e}"))
    }
}

impl From<bincode::error::DecodeError> for GatewayError {
    fn from(e: bincode::error::DecodeError) -> Self {
        GatewayError::Protocol(format!("Failed to decode message: {e}"))
    }
}

impl From<std::str::Utf8Error> for GatewayError {
    fn from(e: std::str::Utf8Error) -> Self {
        GatewayError::Protocol(format!("Invalid UTF-8: {e}"))
    }
}

impl From<std::string::FromUtf8Error> for GatewayError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        GatewayError::Protocol(format!("Invalid UTF-8: {e}"))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for GatewayError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        match e {
            tokio_tungstenite::tungstenite::Error::Io(io) => GatewayError::Io(Arc::new(io)),
            other => GatewayError::WebSocket(other.to_string()),
        }
    }
}

impl From<tokio::time::error::Elapsed> for GatewayError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        GatewayError::Store("operation timed out".to_string())
    }
}
