// src/connection/session.rs

//! Defines the state associated with a single client session.

/// Holds the state specific to one WebSocket client.
#[derive(Debug, Default)]
pub struct SessionState {
    /// The user this connection is bound to, once logged in.
    pub user_id: Option<String>,
    /// The token issued by the auth service at login.
    pub token: Option<String>,
    /// Frames received on this connection.
    pub frames: u64,
}

impl SessionState {
    pub(crate) fn new() -> Self {
        Default::default()
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }
}
