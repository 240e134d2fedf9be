// src/core/routing/router.rs

//! Decides where a message for a user goes: the local socket, the owning
//! node's broker topic, or the storage service's offline topic.
//!
//! Ordering is only guaranteed per connection. A message sent over the broker
//! can arrive after a later one delivered locally.

use crate::core::GatewayError;
use crate::core::broker::Broker;
use crate::core::metrics;
use crate::core::protocol::envelope::encode;
use crate::core::protocol::{Delivery, Envelope, EnvelopeType, ResponseMessage};
use crate::core::registry::ConnectionRegistry;
use bytes::Bytes;
use std::sync::Arc;
use strum_macros::AsRefStr;
use tracing::{debug, error, warn};

/// Where a routed message went.
#[derive(Debug, Clone, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum RouteDecision {
    Local,
    CrossNode(String),
    Offline,
}

pub struct MessageRouter {
    registry: Arc<ConnectionRegistry>,
    broker: Arc<dyn Broker>,
    storage_topic: String,
}

impl MessageRouter {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        broker: Arc<dyn Broker>,
        storage_topic: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            broker,
            storage_topic: storage_topic.into(),
        }
    }

    /// Routes an encoded client frame to `target_user_id`.
    pub async fn route_message(
        &self,
        target_user_id: &str,
        payload: Bytes,
    ) -> Result<RouteDecision, GatewayError> {
        let result = self.route_inner(target_user_id, payload).await;
        match &result {
            Ok(decision) => {
                metrics::ROUTED_MESSAGES_TOTAL
                    .with_label_values(&[decision.as_ref()])
                    .inc();
            }
            Err(e) => {
                metrics::ROUTING_ERRORS_TOTAL
                    .with_label_values(&[error_kind(e)])
                    .inc();
            }
        }
        result
    }

    /// Encodes `response` and routes it.
    pub async fn route_response(
        &self,
        target_user_id: &str,
        response: &ResponseMessage,
    ) -> Result<RouteDecision, GatewayError> {
        let payload = Bytes::from(encode(response)?);
        self.route_message(target_user_id, payload).await
    }

    /// Routes the same payload to every recipient. One failure does not stop
    /// the rest; all failures are reported together.
    pub async fn broadcast_message(
        &self,
        target_user_ids: &[String],
        payload: Bytes,
    ) -> Result<(), GatewayError> {
        let mut failed = Vec::new();
        for user_id in target_user_ids {
            if let Err(e) = self.route_message(user_id, payload.clone()).await {
                warn!("Broadcast to user '{}' failed: {}", user_id, e);
                failed.push(user_id.clone());
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(GatewayError::PartialBroadcast { failed })
        }
    }

    async fn route_inner(
        &self,
        target_user_id: &str,
        payload: Bytes,
    ) -> Result<RouteDecision, GatewayError> {
        match self.registry.send_to_user(target_user_id, payload.clone()) {
            Ok(()) => return Ok(RouteDecision::Local),
            Err(GatewayError::NotConnected(_)) => {}
            Err(e) => return Err(e),
        }

        let owner = self.registry.coordinator().owner_of(target_user_id).await?;
        match owner {
            Some(node) if node == self.registry.node_id() => {
                warn!(
                    "User '{}' is mapped to this node but has no local binding; retrying once.",
                    target_user_id
                );
                match self.registry.send_to_user(target_user_id, payload) {
                    Ok(()) => Ok(RouteDecision::Local),
                    Err(GatewayError::NotConnected(_)) => {
                        error!(
                            "Routing inconsistency: user '{}' is mapped to node '{}' but not bound here.",
                            target_user_id, node
                        );
                        Err(GatewayError::RoutingInconsistency(target_user_id.to_string()))
                    }
                    Err(e) => Err(e),
                }
            }
            Some(node) => {
                self.publish_delivery(&node, target_user_id, payload).await?;
                debug!("Forwarded message for user '{}' to node '{}'.", target_user_id, node);
                Ok(RouteDecision::CrossNode(node))
            }
            None => {
                self.publish_delivery(&self.storage_topic, target_user_id, payload)
                    .await?;
                debug!("User '{}' is offline; handed message to storage.", target_user_id);
                Ok(RouteDecision::Offline)
            }
        }
    }

    async fn publish_delivery(
        &self,
        topic: &str,
        target_user_id: &str,
        payload: Bytes,
    ) -> Result<(), GatewayError> {
        let delivery = Delivery {
            target_user_id: target_user_id.to_string(),
            payload: payload.to_vec(),
        };
        let envelope = Envelope::wrap(EnvelopeType::Request, &delivery)?;
        self.broker
            .publish(topic, Bytes::from(envelope.encode()?))
            .await
    }
}

fn error_kind(e: &GatewayError) -> &'static str {
    match e {
        GatewayError::QueueFull(_) => "queue_full",
        GatewayError::RoutingInconsistency(_) => "inconsistency",
        GatewayError::Store(_) => "store",
        GatewayError::Broker(_) => "broker",
        _ => "other",
    }
}
