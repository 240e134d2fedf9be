// src/core/routing/dispatcher.rs

//! Consumes this node's broker topic and the cluster-wide kick topic, and
//! hands each envelope to the registry, the router, or the kick handler.

use super::router::MessageRouter;
use crate::core::GatewayError;
use crate::core::broker::{Broker, BrokerMessage};
use crate::core::metrics;
use crate::core::protocol::storage::StorageResponse;
use crate::core::protocol::{Delivery, Envelope, EnvelopeType, KickCommand, ResponseMessage};
use crate::core::registry::ConnectionRegistry;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use strum_macros::AsRefStr;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);
const WORK_QUEUE_CAPACITY: usize = 1024;

/// What happened to one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum DispatchOutcome {
    Delivered,
    DeliveryFailed,
    ForwardedStorageResponse,
    DiscardedStorageRequest,
    Kicked,
    IgnoredKick,
    Skipped,
}

pub struct InboundDispatcher {
    registry: Arc<ConnectionRegistry>,
    router: Arc<MessageRouter>,
}

impl InboundDispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>, router: Arc<MessageRouter>) -> Self {
        Self { registry, router }
    }

    /// Handles one raw broker payload. Never fails; bad input is logged and skipped.
    pub async fn dispatch(&self, payload: &[u8]) -> DispatchOutcome {
        let outcome = match Envelope::decode(payload) {
            Ok(envelope) => self.dispatch_envelope(envelope).await,
            Err(e) => match std::str::from_utf8(payload) {
                Ok(text) => self.handle_text(text).await,
                Err(_) => {
                    warn!("Skipping undecodable broker message: {}", e);
                    DispatchOutcome::Skipped
                }
            },
        };
        metrics::DISPATCHED_MESSAGES_TOTAL
            .with_label_values(&[outcome.as_ref()])
            .inc();
        outcome
    }

    async fn dispatch_envelope(&self, envelope: Envelope) -> DispatchOutcome {
        match envelope.kind {
            EnvelopeType::Request | EnvelopeType::Response => {
                let delivery: Delivery = match envelope.open() {
                    Ok(d) => d,
                    Err(e) => {
                        warn!("Skipping {} envelope with a bad payload: {}", envelope.kind, e);
                        return DispatchOutcome::Skipped;
                    }
                };
                // The sender resolved this node as the owner; re-routing could loop.
                match self
                    .registry
                    .send_to_user(&delivery.target_user_id, Bytes::from(delivery.payload))
                {
                    Ok(()) => DispatchOutcome::Delivered,
                    Err(e) => {
                        error!(
                            "Cross-node delivery to user '{}' failed: {}",
                            delivery.target_user_id, e
                        );
                        DispatchOutcome::DeliveryFailed
                    }
                }
            }
            EnvelopeType::StorageResponse => {
                let response: StorageResponse = match envelope.open() {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("Skipping storage response with a bad payload: {}", e);
                        return DispatchOutcome::Skipped;
                    }
                };
                let target = response.target_user_id.clone();
                match self
                    .router
                    .route_response(&target, &ResponseMessage::Storage(response))
                    .await
                {
                    Ok(_) => DispatchOutcome::ForwardedStorageResponse,
                    Err(e) => {
                        warn!("Could not forward storage response to user '{}': {}", target, e);
                        DispatchOutcome::DeliveryFailed
                    }
                }
            }
            EnvelopeType::StorageRequest => {
                warn!("Discarding storage request received on a gateway topic.");
                DispatchOutcome::DiscardedStorageRequest
            }
            EnvelopeType::LegacyText => match envelope.text() {
                Ok(text) => self.handle_text(text).await,
                Err(e) => {
                    warn!("Skipping legacy envelope that is not UTF-8: {}", e);
                    DispatchOutcome::Skipped
                }
            },
        }
    }

    /// Acts on `DELETE USER <uid> TARGET <node>` when `<node>` is this node.
    async fn handle_text(&self, text: &str) -> DispatchOutcome {
        let Some(command) = KickCommand::parse(text) else {
            warn!("Skipping unrecognised text message: {:?}", text);
            return DispatchOutcome::Skipped;
        };
        if !command.targets(self.registry.node_id()) {
            return DispatchOutcome::IgnoredKick;
        }
        metrics::KICKS_TOTAL.with_label_values(&["received"]).inc();
        match self.registry.force_logout(&command.user_id).await {
            Ok(()) => info!(
                "User '{}' logged out by a broker kick command.",
                command.user_id
            ),
            Err(GatewayError::SessionNotFound(_)) => debug!(
                "Broker kick for user '{}' found no local session.",
                command.user_id
            ),
            Err(e) => warn!("Broker kick for user '{}' failed: {}", command.user_id, e),
        }
        DispatchOutcome::Kicked
    }
}

/// The background task feeding broker messages to a pool of dispatch workers.
///
/// Workers share one queue, so two messages for the same user can be handled
/// out of order when more than one worker is configured.
pub struct InboundDispatcherTask {
    dispatcher: Arc<InboundDispatcher>,
    broker: Arc<dyn Broker>,
    topics: Vec<String>,
    workers: usize,
}

impl InboundDispatcherTask {
    pub fn new(
        dispatcher: Arc<InboundDispatcher>,
        broker: Arc<dyn Broker>,
        topics: Vec<String>,
        workers: usize,
    ) -> Self {
        Self {
            dispatcher,
            broker,
            topics,
            workers: workers.max(1),
        }
    }

    pub async fn run(self, shutdown_tx: broadcast::Sender<()>) {
        info!(
            "Inbound dispatcher started on topics {:?} with {} worker(s).",
            self.topics, self.workers
        );
        let (work_tx, work_rx) = mpsc::channel::<BrokerMessage>(WORK_QUEUE_CAPACITY);
        let work_rx = Arc::new(Mutex::new(work_rx));
        let mut tasks = JoinSet::new();

        for topic in &self.topics {
            tasks.spawn(consume_topic(
                self.broker.clone(),
                topic.clone(),
                work_tx.clone(),
                shutdown_tx.subscribe(),
            ));
        }
        drop(work_tx);

        for worker in 0..self.workers {
            let dispatcher = self.dispatcher.clone();
            let work_rx = work_rx.clone();
            tasks.spawn(async move {
                loop {
                    let next = work_rx.lock().await.recv().await;
                    let Some(msg) = next else {
                        break;
                    };
                    let outcome = dispatcher.dispatch(&msg.payload).await;
                    debug!("Worker {} handled message from '{}': {:?}", worker, msg.topic, outcome);
                }
            });
        }

        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res
                && e.is_panic()
            {
                error!("A dispatcher task panicked: {e:?}");
            }
        }
        info!("Inbound dispatcher shut down.");
    }
}

/// Forwards one topic into the work queue, resubscribing if the subscription ends.
async fn consume_topic(
    broker: Arc<dyn Broker>,
    topic: String,
    work_tx: mpsc::Sender<BrokerMessage>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        let mut rx = match broker.subscribe(&topic).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!("Could not subscribe to topic '{}': {}. Retrying.", topic, e);
                tokio::select! {
                    _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => continue,
                    _ = shutdown_rx.recv() => return,
                }
            }
        };
        debug!("Consuming topic '{}'.", topic);
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(msg) => {
                        if work_tx.send(msg).await.is_err() {
                            return;
                        }
                    }
                    None => {
                        warn!("Subscription to topic '{}' ended; resubscribing.", topic);
                        break;
                    }
                },
                _ = shutdown_rx.recv() => return,
            }
        }
    }
}
