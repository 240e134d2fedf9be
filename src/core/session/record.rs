// src/core/session/record.rs

//! Shared-store key layout and the `connection:node` session record.

use crate::core::GatewayError;
use std::fmt;

/// The hash mapping a user to the node holding their live connection.
pub const CONNECTION_MAPPING_KEY: &str = "ws_connection_mapping";

pub fn lock_key(user_id: &str) -> String {
    format!("user_lock:{user_id}")
}

pub fn session_key(user_id: &str) -> String {
    format!("user_session:{user_id}")
}

/// The set of connection identities registered by `node_id`.
pub fn node_connections_key(node_id: &str) -> String {
    format!("container_connections:{node_id}")
}

/// The cluster-wide owner of a user's session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub connection_id: String,
    pub node_id: String,
}

impl SessionRecord {
    pub fn new(connection_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            node_id: node_id.into(),
        }
    }

    /// Parses `connID:nodeID`. Connection identities are socket addresses and
    /// contain colons themselves, so the split happens at the last one.
    pub fn parse(value: &str) -> Result<Self, GatewayError> {
        match value.rsplit_once(':') {
            Some((conn, node)) if !conn.is_empty() && !node.is_empty() => {
                Ok(Self::new(conn, node))
            }
            _ => Err(GatewayError::Protocol(format!(
                "malformed session record '{value}'"
            ))),
        }
    }

    pub fn is_owned_by(&self, node_id: &str) -> bool {
        self.node_id == node_id
    }
}

impl fmt::Display for SessionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.connection_id, self.node_id)
    }
}
