// src/core/protocol/kick.rs

//! Text formats of the two kick paths: the pub/sub notification and the
//! durable broker command.

use lazy_static::lazy_static;
use regex::Regex;

const KICK_PREFIX: &str = "KICK:";

lazy_static! {
    static ref KICK_COMMAND: Regex =
        Regex::new(r"^DELETE USER (\S+) TARGET ([A-Za-z0-9._-]+)$").unwrap();
}

/// A parsed fallback kick: log out `user_id` if you are `target_node`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KickCommand {
    pub user_id: String,
    pub target_node: String,
}

impl KickCommand {
    pub fn new(user_id: impl Into<String>, target_node: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            target_node: target_node.into(),
        }
    }

    /// Formats the command as `DELETE USER <uid> TARGET <node>`.
    pub fn to_text(&self) -> String {
        format!("DELETE USER {} TARGET {}", self.user_id, self.target_node)
    }

    /// Parses a command, ignoring surrounding whitespace.
    pub fn parse(text: &str) -> Option<Self> {
        let caps = KICK_COMMAND.captures(text.trim())?;
        Some(Self::new(&caps[1], &caps[2]))
    }

    pub fn targets(&self, node_id: &str) -> bool {
        self.target_node == node_id
    }
}

/// The pub/sub channel a node listens on for kick notifications.
pub fn kick_channel(node_id: &str) -> String {
    format!("user_kick:{node_id}")
}

/// Formats the pub/sub notification body.
pub fn kick_notification(user_id: &str) -> String {
    format!("{KICK_PREFIX}{user_id}")
}

/// Extracts the user id from a pub/sub notification body.
pub fn parse_kick_notification(body: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(body).ok()?;
    let user_id = text.strip_prefix(KICK_PREFIX)?.trim();
    (!user_id.is_empty()).then(|| user_id.to_string())
}
