// src/core/storage_bridge.rs

//! Sends requests to the remote storage service over the broker.
//!
//! Requests carry this node's topic as the reply address. Responses come back
//! through the inbound dispatcher and are routed to the requesting user.

use crate::core::GatewayError;
use crate::core::broker::Broker;
use crate::core::protocol::storage::{StoragePayload, StorageRequest};
use crate::core::protocol::{Envelope, EnvelopeType};
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

pub struct StorageBridge {
    broker: Arc<dyn Broker>,
    storage_topic: String,
    reply_topic: String,
}

impl StorageBridge {
    pub fn new(
        broker: Arc<dyn Broker>,
        storage_topic: impl Into<String>,
        reply_topic: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            storage_topic: storage_topic.into(),
            reply_topic: reply_topic.into(),
        }
    }

    /// Publishes a request whose response is for `target_user_id`. Returns the request id.
    pub async fn request(
        &self,
        target_user_id: &str,
        payload: StoragePayload,
    ) -> Result<String, GatewayError> {
        let request = StorageRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            from_topic: self.reply_topic.clone(),
            target_user_id: target_user_id.to_string(),
            payload,
        };
        let envelope = Envelope::wrap(EnvelopeType::StorageRequest, &request)?;
        self.broker
            .publish(&self.storage_topic, Bytes::from(envelope.encode()?))
            .await?;
        debug!(
            "Storage request {} published for user '{}'.",
            request.request_id, target_user_id
        );
        Ok(request.request_id)
    }
}
