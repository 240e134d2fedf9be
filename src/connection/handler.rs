// src/connection/handler.rs

//! Defines the `ConnectionHandler` which manages the full lifecycle of a client connection.

use super::guard::ConnectionGuard;
use super::session::SessionState;
use crate::core::GatewayError;
use crate::core::protocol::envelope::{decode, encode};
use crate::core::protocol::message::{
    Credential, LoginResponse, LoginResult, Post, RequestMessage, RequestPayload,
    ResponseMessage,
};
use crate::core::protocol::storage::StoragePayload;
use crate::core::registry::Connection;
use crate::core::state::GatewayState;
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

/// The next step for the connection's main loop to take.
enum NextAction {
    Continue,
    Close,
}

/// Manages the full lifecycle of a client connection.
///
/// The read loop runs here. Replies and routed messages both go through the
/// connection's outbound queue, drained by a separate write task, so a client
/// sees them in enqueue order.
pub struct ConnectionHandler {
    state: Arc<GatewayState>,
    conn: Arc<Connection>,
    outbound_rx: Option<mpsc::Receiver<Bytes>>,
    shutdown_rx: broadcast::Receiver<()>,
    session: SessionState,
}

impl ConnectionHandler {
    /// Registers the connection and prepares its handler.
    pub fn new(
        state: Arc<GatewayState>,
        addr: SocketAddr,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        let (conn, outbound_rx) = state.registry.add_connection(addr);
        Self {
            state,
            conn,
            outbound_rx: Some(outbound_rx),
            shutdown_rx,
            session: SessionState::new(),
        }
    }

    pub fn connection_id(&self) -> &str {
        self.conn.id()
    }

    /// The main event loop for the connection, handling incoming frames and signals.
    pub async fn run<S>(mut self, ws: WebSocketStream<S>) -> Result<(), GatewayError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let addr = self.conn.addr();
        let mut guard =
            ConnectionGuard::new(self.state.clone(), self.conn.id().to_string(), addr);
        let (sink, mut stream) = ws.split();
        let outbound_rx = self
            .outbound_rx
            .take()
            .ok_or_else(|| GatewayError::Internal("connection handler ran twice".into()))?;
        let writer = tokio::spawn(write_loop(sink, outbound_rx, self.conn.id().to_string()));

        let result = loop {
            tokio::select! {
                // Prioritize shutdown signals over other events.
                biased;
                _ = self.shutdown_rx.recv() => {
                    info!("Connection handler for {} received shutdown signal.", addr);
                    break Ok(());
                }
                _ = self.conn.cancelled() => {
                    debug!("Connection {} was stopped by the registry.", self.conn.id());
                    break Ok(());
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Binary(data))) => {
                        match self.process_frame(&data).await {
                            Ok(NextAction::Continue) => {}
                            Ok(NextAction::Close) => break Ok(()),
                            Err(e) => break Err(e),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Connection from {} closed by peer.", addr);
                        break Ok(());
                    }
                    Some(Ok(Message::Text(_))) => {
                        if !self.session.is_authenticated() {
                            warn!("Text frame from unauthenticated client {}; closing.", addr);
                            break Ok(());
                        }
                        self.reply(&ResponseMessage::ServerError {
                            message: "only binary frames are accepted".to_string(),
                        });
                    }
                    // Pings are answered by the protocol layer.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        if is_normal_disconnect(&e) {
                            debug!("Connection from {} closed: {}", addr, e);
                            break Ok(());
                        }
                        break Err(e.into());
                    }
                },
            }
        };

        self.state.registry.remove_connection(self.conn.id()).await;
        guard.set_released();
        if let Err(e) = writer.await {
            warn!("Write task for {} ended abnormally: {:?}", addr, e);
        }
        debug!(
            "Connection {} finished after {} frame(s).",
            self.conn.id(),
            self.session.frames
        );
        result
    }

    async fn process_frame(&mut self, data: &[u8]) -> Result<NextAction, GatewayError> {
        self.session.frames += 1;
        self.state.stats.increment_total_frames();

        let request: RequestMessage = match decode(data) {
            Ok(request) => request,
            Err(e) => {
                warn!("Undecodable frame from {}: {}", self.conn.addr(), e);
                if !self.session.is_authenticated() {
                    return Ok(NextAction::Close);
                }
                self.reply(&ResponseMessage::ServerError {
                    message: "malformed request".to_string(),
                });
                return Ok(NextAction::Continue);
            }
        };
        debug!(
            "Connection {}: received {} request.",
            self.conn.id(),
            request.payload.name()
        );

        let Some(user_id) = self.session.user_id.clone() else {
            return self.process_unauthenticated(request).await;
        };
        self.state.registry.sessions().touch(&user_id);

        let storage_payload = match request.payload {
            RequestPayload::Login { .. } | RequestPayload::Signup { .. } => {
                self.reply(&ResponseMessage::Refused {
                    reason: "already logged in".to_string(),
                });
                return Ok(NextAction::Continue);
            }
            RequestPayload::Logout => {
                info!("User '{}' logged out.", user_id);
                return Ok(NextAction::Close);
            }
            RequestPayload::Post(post) => {
                self.handle_post(&user_id, &request.token, post).await;
                return Ok(NextAction::Continue);
            }
            RequestPayload::QueryUser { user_id: target } => {
                StoragePayload::QueryUser { user_id: target }
            }
            RequestPayload::UpdateUserName { user_name } => StoragePayload::UpdateUserName {
                user_id: user_id.clone(),
                user_name,
            },
            RequestPayload::UpdateUserAvatar { avatar_url } => StoragePayload::UpdateUserAvatar {
                user_id: user_id.clone(),
                avatar_url,
            },
            RequestPayload::QueryMessage { message_id } => {
                StoragePayload::QueryMessage { message_id }
            }
            RequestPayload::QuerySyncMessages { since } => StoragePayload::QuerySyncMessages {
                user_id: user_id.clone(),
                since,
            },
            RequestPayload::QueryFileExists { file_hash } => {
                StoragePayload::QueryFileExists { file_hash }
            }
        };

        if let Err(e) = self.state.storage.request(&user_id, storage_payload).await {
            warn!("Storage request for user '{}' failed: {}", user_id, e);
            self.reply(&ResponseMessage::ServerError {
                message: "storage service unavailable".to_string(),
            });
        }
        Ok(NextAction::Continue)
    }

    /// Only login and signup are accepted before authentication.
    async fn process_unauthenticated(
        &mut self,
        request: RequestMessage,
    ) -> Result<NextAction, GatewayError> {
        match request.payload {
            RequestPayload::Login {
                account,
                credential,
            } => {
                self.handle_login(&account, &credential).await;
                Ok(NextAction::Continue)
            }
            RequestPayload::Signup {
                account,
                password,
                user_name,
            } => {
                let response = self.state.auth.signup(&account, &password, &user_name).await;
                self.reply(&ResponseMessage::Signup(response));
                Ok(NextAction::Continue)
            }
            RequestPayload::Logout => Ok(NextAction::Close),
            other => {
                warn!(
                    "Unauthenticated {} request from {}; closing.",
                    other.name(),
                    self.conn.addr()
                );
                self.reply(&ResponseMessage::Refused {
                    reason: "login required".to_string(),
                });
                Ok(NextAction::Close)
            }
        }
    }

    async fn handle_login(&mut self, account: &str, credential: &Credential) {
        let mut response = self.state.auth.login(account, credential).await;
        if response.result != LoginResult::Ok {
            self.reply(&ResponseMessage::Login(response));
            return;
        }

        match self
            .state
            .registry
            .login(self.conn.id(), &response.user_id)
            .await
        {
            Ok(()) => {
                self.session.user_id = Some(response.user_id.clone());
                self.session.token = Some(response.token.clone());
                self.state.stats.increment_total_logins();
            }
            Err(e) if e.is_retryable() || e.is_transient() => {
                if e.is_transient() {
                    warn!("Session bind for account '{}' hit an outage: {}", account, e);
                }
                response = LoginResponse {
                    result: LoginResult::TryAgain,
                    token: String::new(),
                    user_id: response.user_id,
                };
            }
            Err(e) => {
                warn!("Session bind for account '{}' failed: {}", account, e);
                response = LoginResponse {
                    result: LoginResult::ServiceError,
                    token: String::new(),
                    user_id: response.user_id,
                };
            }
        }
        self.reply(&ResponseMessage::Login(response));
    }

    async fn handle_post(&mut self, user_id: &str, token: &str, mut post: Post) {
        let token = if token.is_empty() {
            self.session.token.clone().unwrap_or_default()
        } else {
            token.to_string()
        };
        if token.is_empty() {
            self.reply(&ResponseMessage::Refused {
                reason: "token required".to_string(),
            });
            return;
        }
        match self.state.auth.check_token(user_id, &token).await {
            LoginResult::Ok => {}
            LoginResult::ServiceError => {
                self.reply(&ResponseMessage::ServerError {
                    message: "auth service unavailable".to_string(),
                });
                return;
            }
            _ => {
                self.reply(&ResponseMessage::Refused {
                    reason: "invalid token".to_string(),
                });
                return;
            }
        }
        if post.is_group {
            self.reply(&ResponseMessage::Refused {
                reason: "group messages are not supported".to_string(),
            });
            return;
        }

        post.from_id = user_id.to_string();
        if post.timestamp == 0 {
            post.timestamp = chrono::Utc::now().timestamp_millis();
        }
        let target = post.to_id.clone();
        match self
            .state
            .router
            .route_response(&target, &ResponseMessage::Post(post))
            .await
        {
            Ok(decision) => debug!("Post from '{}' to '{}' routed {:?}.", user_id, target, decision),
            Err(e) => {
                warn!("Post from '{}' to '{}' failed: {}", user_id, target, e);
                self.reply(&ResponseMessage::ServerError {
                    message: format!("delivery failed: {e}"),
                });
            }
        }
    }

    /// Queues a response for this client.
    fn reply(&self, response: &ResponseMessage) {
        let result = encode(response).and_then(|bytes| self.conn.try_send(Bytes::from(bytes)));
        if let Err(e) = result {
            warn!("Could not reply on connection {}: {}", self.conn.id(), e);
        }
    }
}

/// Drains the outbound queue into the socket until the queue closes, then
/// sends a close frame.
async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut outbound_rx: mpsc::Receiver<Bytes>,
    connection_id: String,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    while let Some(payload) = outbound_rx.recv().await {
        if let Err(e) = sink.send(Message::binary(payload.to_vec())).await {
            debug!("Write to connection {} failed: {}", connection_id, e);
            return;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
}

/// Helper function to check for non-critical disconnection errors.
fn is_normal_disconnect(e: &tungstenite::Error) -> bool {
    match e {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => true,
        tungstenite::Error::Io(io) => matches!(
            io.kind(),
            std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::ConnectionAborted
        ),
        tungstenite::Error::Protocol(_) => true,
        _ => false,
    }
}
