// src/core/session/table.rs

//! The per-node table of logged-in users.

use crate::core::GatewayError;
use crate::core::registry::ConnectionRegistry;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::time::Duration;
use tracing::{debug, info};

/// One user bound to one connection on this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSession {
    pub user_id: String,
    pub connection_id: String,
    pub login_time: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub active: bool,
}

impl LocalSession {
    fn new(user_id: &str, connection_id: &str) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.to_string(),
            connection_id: connection_id.to_string(),
            login_time: now,
            last_active: now,
            active: true,
        }
    }

    /// How long the session has gone without a frame.
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_active).to_std().unwrap_or_default()
    }
}

/// At most one session per user. A new session displaces the previous one.
#[derive(Debug, Default)]
pub struct LocalSessionTable {
    sessions: DashMap<String, LocalSession>,
}

impl LocalSessionTable {
    pub fn new() -> Self {
        Default::default()
    }

    /// Records a login, returning the session it displaced, if any.
    pub fn create(&self, user_id: &str, connection_id: &str) -> Option<LocalSession> {
        let displaced = self
            .sessions
            .insert(user_id.to_string(), LocalSession::new(user_id, connection_id));
        if let Some(old) = &displaced
            && old.connection_id != connection_id
        {
            debug!(
                "Session for user '{}' moved from {} to {}.",
                user_id, old.connection_id, connection_id
            );
        }
        displaced
    }

    pub fn get(&self, user_id: &str) -> Option<LocalSession> {
        self.sessions.get(user_id).map(|s| s.value().clone())
    }

    /// Marks activity. Returns `false` if the user has no session.
    pub fn touch(&self, user_id: &str) -> bool {
        match self.sessions.get_mut(user_id) {
            Some(mut session) => {
                session.last_active = Utc::now();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, user_id: &str) -> Option<LocalSession> {
        self.sessions.remove(user_id).map(|(_, s)| s)
    }

    /// Removes the user's session only if it belongs to `connection_id`.
    pub fn remove_if_connection(&self, user_id: &str, connection_id: &str) -> bool {
        self.sessions
            .remove_if(user_id, |_, s| s.connection_id == connection_id)
            .is_some()
    }

    /// Closes the user's connection and deletes the session.
    pub async fn force_logout(
        &self,
        user_id: &str,
        registry: &ConnectionRegistry,
    ) -> Result<(), GatewayError> {
        let session = self
            .get(user_id)
            .ok_or_else(|| GatewayError::SessionNotFound(user_id.to_string()))?;
        info!(
            "Forcing logout of user '{}' on connection {}.",
            user_id, session.connection_id
        );
        registry.remove_connection(&session.connection_id).await;
        self.remove_if_connection(user_id, &session.connection_id);
        Ok(())
    }

    pub fn active_sessions(&self) -> Vec<LocalSession> {
        self.sessions
            .iter()
            .filter(|s| s.active)
            .map(|s| s.value().clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Logs out every session idle for at least `timeout`. Returns how many went.
    pub async fn cleanup_inactive(&self, timeout: Duration, registry: &ConnectionRegistry) -> usize {
        let now = Utc::now();
        let idle: Vec<String> = self
            .sessions
            .iter()
            .filter(|s| s.idle_for(now) >= timeout)
            .map(|s| s.key().clone())
            .collect();

        let mut removed = 0;
        for user_id in idle {
            // The session may have been touched or replaced since the scan.
            if self.get(&user_id).is_none_or(|s| s.idle_for(Utc::now()) < timeout) {
                continue;
            }
            if self.force_logout(&user_id, registry).await.is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Logged out {} idle session(s).", removed);
        }
        removed
    }
}
