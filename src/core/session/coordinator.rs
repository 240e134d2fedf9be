// src/core/session/coordinator.rs

//! Cluster-wide session coordination on top of the shared store.
//!
//! The coordinator owns three pieces of shared state per user: a leased login
//! lock, the session record naming the owning `connection:node`, and an entry in
//! the user-to-node mapping consulted by the router. It also carries the two kick
//! paths: a pub/sub notification on the target node's channel, and a durable
//! fallback command on the broker used only when the publish itself fails.

use super::record::{
    CONNECTION_MAPPING_KEY, SessionRecord, lock_key, node_connections_key, session_key,
};
use crate::config::SessionConfig;
use crate::core::GatewayError;
use crate::core::broker::Broker;
use crate::core::metrics;
use crate::core::protocol::kick::{kick_channel, kick_notification};
use crate::core::protocol::{Envelope, KickCommand};
use crate::core::store::{SharedStore, StoreCondition, StoreOp};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Proof of holding a user's login lock. Release only deletes the lock if it
/// still carries this token, so an expired lease never frees a successor's lock.
#[derive(Debug)]
pub struct LockToken {
    user_id: String,
    token: String,
}

impl LockToken {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

/// The outcome of a guarded session record removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordRemoval {
    /// The record named the given connection and was deleted.
    Removed,
    /// There was no record.
    Absent,
    /// The record names a newer connection and was left alone.
    OwnedElsewhere,
}

/// Which channel carried a kick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KickPath {
    PubSub,
    Broker,
}

pub struct SessionCoordinator {
    store: Arc<dyn SharedStore>,
    broker: Arc<dyn Broker>,
    node_id: String,
    kick_topic: String,
    config: SessionConfig,
}

impl SessionCoordinator {
    pub fn new(
        store: Arc<dyn SharedStore>,
        broker: Arc<dyn Broker>,
        node_id: impl Into<String>,
        kick_topic: impl Into<String>,
        config: SessionConfig,
    ) -> Self {
        Self {
            store,
            broker,
            node_id: node_id.into(),
            kick_topic: kick_topic.into(),
            config,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SharedStore> {
        &self.store
    }

    /// Tries to take the user's login lease. `None` means another login holds it.
    pub async fn acquire_user_lock(&self, user_id: &str) -> Result<Option<LockToken>, GatewayError> {
        let token = uuid::Uuid::new_v4().to_string();
        let acquired = self
            .store
            .set_nx_px(&lock_key(user_id), &token, self.config.lock_ttl)
            .await?;
        if !acquired {
            debug!("Login lock for user '{}' is held elsewhere.", user_id);
            return Ok(None);
        }
        Ok(Some(LockToken {
            user_id: user_id.to_string(),
            token,
        }))
    }

    pub async fn release_user_lock(&self, lock: LockToken) -> Result<(), GatewayError> {
        let released = self
            .store
            .del_if_eq(&lock_key(&lock.user_id), &lock.token)
            .await?;
        if !released {
            warn!(
                "Login lock for user '{}' expired before it was released.",
                lock.user_id
            );
        }
        Ok(())
    }

    pub async fn get_user_session(&self, user_id: &str) -> Result<Option<SessionRecord>, GatewayError> {
        match self.store.get(&session_key(user_id)).await? {
            Some(value) => match SessionRecord::parse(&value) {
                Ok(record) => Ok(Some(record)),
                Err(e) => {
                    warn!("Ignoring unreadable session record for user '{}': {}", user_id, e);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// Writes `connection_id:<this node>` with the record TTL.
    pub async fn set_user_session(&self, user_id: &str, connection_id: &str) -> Result<(), GatewayError> {
        let record = SessionRecord::new(connection_id, &self.node_id);
        self.store
            .set_px(&session_key(user_id), &record.to_string(), self.config.record_ttl)
            .await
    }

    /// Deletes the session record whatever it holds.
    pub async fn remove_user_session(&self, user_id: &str) -> Result<bool, GatewayError> {
        self.store.del(&session_key(user_id)).await
    }

    /// Deletes the session record only if it still names `connection_id` on this node.
    pub async fn remove_user_session_if_owned(
        &self,
        user_id: &str,
        connection_id: &str,
    ) -> Result<RecordRemoval, GatewayError> {
        let expected = SessionRecord::new(connection_id, &self.node_id).to_string();
        if self.store.del_if_eq(&session_key(user_id), &expected).await? {
            return Ok(RecordRemoval::Removed);
        }
        match self.store.get(&session_key(user_id)).await? {
            None => Ok(RecordRemoval::Absent),
            Some(current) => {
                debug!(
                    "Session record for user '{}' now reads '{}'; leaving it in place.",
                    user_id, current
                );
                Ok(RecordRemoval::OwnedElsewhere)
            }
        }
    }

    /// Re-reads the record until it is absent or names this node.
    ///
    /// If another node still owns it on the final attempt, the record is deleted
    /// (that node has already been told to let go) and read once more after a
    /// short settle. A record that reappears is reported as a conflict.
    pub async fn verify_ownership(&self, user_id: &str) -> Result<(), GatewayError> {
        let retries = self.config.verify_retries.max(1);
        for attempt in 1..=retries {
            let stale = match self.get_user_session(user_id).await? {
                Some(record) if !record.is_owned_by(&self.node_id) => record,
                _ => return Ok(()),
            };
            if attempt < retries {
                debug!(
                    "Session for user '{}' still owned by '{}' (attempt {}/{}).",
                    user_id, stale, attempt, retries
                );
                tokio::time::sleep(self.config.verify_delay).await;
                continue;
            }

            warn!(
                "Session for user '{}' still owned by '{}' after {} checks; overriding.",
                user_id, stale, retries
            );
            metrics::SESSION_OVERRIDES_TOTAL.inc();
            self.remove_user_session(user_id).await?;
            tokio::time::sleep(self.config.override_settle).await;
            if let Some(record) = self.get_user_session(user_id).await?
                && !record.is_owned_by(&self.node_id)
            {
                return Err(GatewayError::LoginConflict(user_id.to_string()));
            }
        }
        Ok(())
    }

    /// Tells `target_node` to drop its connection for `user_id`.
    ///
    /// The pub/sub notification is tried first. The broker command is sent only
    /// when the publish call fails; receiving nobody is not a failure.
    pub async fn publish_kick_notification(
        &self,
        user_id: &str,
        target_node: &str,
    ) -> Result<KickPath, GatewayError> {
        let channel = kick_channel(target_node);
        match self
            .store
            .publish(&channel, Bytes::from(kick_notification(user_id)))
            .await
        {
            Ok(receivers) => {
                if receivers == 0 {
                    debug!("Kick for user '{}' on '{}' reached no subscriber.", user_id, channel);
                }
                metrics::KICKS_TOTAL.with_label_values(&["pubsub"]).inc();
                info!("Asked node '{}' to drop user '{}'.", target_node, user_id);
                Ok(KickPath::PubSub)
            }
            Err(e) => {
                warn!(
                    "Kick publish for user '{}' failed: {}. Falling back to the broker.",
                    user_id, e
                );
                let command = KickCommand::new(user_id, target_node);
                let envelope = Envelope::legacy_text(command.to_text());
                self.broker
                    .publish(&self.kick_topic, Bytes::from(envelope.encode()?))
                    .await?;
                metrics::KICKS_TOTAL.with_label_values(&["broker"]).inc();
                Ok(KickPath::Broker)
            }
        }
    }

    /// Subscribes to this node's kick channel.
    pub async fn subscribe_kick_notifications(&self) -> Result<mpsc::Receiver<Bytes>, GatewayError> {
        self.store.subscribe(&kick_channel(&self.node_id)).await
    }

    /// Records that `user_id` is served by this node, in one transaction.
    pub async fn register_connection(&self, user_id: &str, connection_id: &str) -> Result<(), GatewayError> {
        self.store
            .exec_transaction(vec![
                StoreOp::HSet {
                    key: CONNECTION_MAPPING_KEY.to_string(),
                    field: user_id.to_string(),
                    value: self.node_id.clone(),
                },
                StoreOp::SAdd {
                    key: node_connections_key(&self.node_id),
                    member: connection_id.to_string(),
                },
            ])
            .await
    }

    /// Removes the mapping entry if it still names this node, and drops the
    /// connection from this node's set. Returns whether the mapping was removed.
    pub async fn unregister_connection(&self, user_id: &str, connection_id: &str) -> Result<bool, GatewayError> {
        let condition = StoreCondition::HashFieldEquals {
            key: CONNECTION_MAPPING_KEY.to_string(),
            field: user_id.to_string(),
            value: self.node_id.clone(),
        };
        let removed = self
            .store
            .exec_if(
                condition,
                vec![
                    StoreOp::HDel {
                        key: CONNECTION_MAPPING_KEY.to_string(),
                        field: user_id.to_string(),
                    },
                    StoreOp::SRem {
                        key: node_connections_key(&self.node_id),
                        member: connection_id.to_string(),
                    },
                ],
            )
            .await?;
        if !removed {
            debug!(
                "Mapping for user '{}' no longer names '{}'; keeping it.",
                user_id, self.node_id
            );
            self.forget_connection(connection_id).await?;
        }
        Ok(removed)
    }

    /// Drops a connection from this node's set without touching the mapping.
    pub async fn forget_connection(&self, connection_id: &str) -> Result<(), GatewayError> {
        self.store
            .exec_transaction(vec![StoreOp::SRem {
                key: node_connections_key(&self.node_id),
                member: connection_id.to_string(),
            }])
            .await
    }

    /// The node currently serving `user_id`, if any.
    pub async fn owner_of(&self, user_id: &str) -> Result<Option<String>, GatewayError> {
        self.store.hget(CONNECTION_MAPPING_KEY, user_id).await
    }

    /// Connection identities this node has registered.
    pub async fn registered_connections(&self) -> Result<Vec<String>, GatewayError> {
        self.store.smembers(&node_connections_key(&self.node_id)).await
    }
}
