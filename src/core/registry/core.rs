// src/core/registry/core.rs

//! Defines `ConnectionRegistry`, the per-node index of live connections.

use super::connection::Connection;
use crate::core::GatewayError;
use crate::core::metrics;
use crate::core::session::{LocalSessionTable, RecordRemoval, SessionCoordinator};
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

/// Live connections indexed by connection identity and by bound user.
///
/// Every operation that changes a user's binding runs under that user's entry
/// in `user_locks`, so the two indices and the local session table move together.
/// Unrelated users never contend.
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<Connection>>,
    /// user identity -> connection identity
    users: DashMap<String, String>,
    user_locks: DashMap<String, Arc<Mutex<()>>>,
    sessions: LocalSessionTable,
    coordinator: Arc<SessionCoordinator>,
    queue_capacity: usize,
}

impl ConnectionRegistry {
    pub fn new(coordinator: Arc<SessionCoordinator>) -> Self {
        let queue_capacity = coordinator.config().outbound_queue.max(1);
        Self {
            connections: DashMap::new(),
            users: DashMap::new(),
            user_locks: DashMap::new(),
            sessions: LocalSessionTable::new(),
            coordinator,
            queue_capacity,
        }
    }

    pub fn node_id(&self) -> &str {
        self.coordinator.node_id()
    }

    pub fn coordinator(&self) -> &Arc<SessionCoordinator> {
        &self.coordinator
    }

    pub fn sessions(&self) -> &LocalSessionTable {
        &self.sessions
    }

    /// Registers a freshly upgraded socket. The identity is the peer address,
    /// suffixed if that address is somehow already present.
    pub fn add_connection(&self, addr: SocketAddr) -> (Arc<Connection>, mpsc::Receiver<Bytes>) {
        let mut id = addr.to_string();
        let mut suffix = 1u32;
        loop {
            match self.connections.entry(id.clone()) {
                Entry::Vacant(slot) => {
                    let (conn, rx) = Connection::new(id, addr, self.queue_capacity);
                    let conn = Arc::new(conn);
                    slot.insert(conn.clone());
                    metrics::CONNECTED_CLIENTS.inc();
                    debug!("Registered connection {}.", conn.id());
                    return (conn, rx);
                }
                Entry::Occupied(_) => {
                    id = format!("{addr}#{suffix}");
                    suffix += 1;
                }
            }
        }
    }

    pub fn get_connection(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.connections.get(connection_id).map(|c| c.value().clone())
    }

    pub fn get_connection_by_user(&self, user_id: &str) -> Option<Arc<Connection>> {
        let connection_id = self.users.get(user_id)?.value().clone();
        self.get_connection(&connection_id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn connection_ids(&self) -> Vec<String> {
        self.connections.iter().map(|c| c.key().clone()).collect()
    }

    /// Users bound on this node, sorted.
    pub fn bound_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.users.iter().map(|u| u.key().clone()).collect();
        users.sort();
        users
    }

    /// Binds `connection_id` to `user_id`, resolving any existing session for
    /// the user across the cluster first.
    ///
    /// Conflicts come back as retryable errors (`LoginInProgress`,
    /// `LoginConflict`); store failures come back as-is. A failed login leaves
    /// no local binding behind.
    pub async fn login(&self, connection_id: &str, user_id: &str) -> Result<(), GatewayError> {
        let conn = self
            .get_connection(connection_id)
            .filter(|c| !c.is_stopped())
            .ok_or_else(|| GatewayError::ConnectionNotFound(connection_id.to_string()))?;
        if let Some(bound) = conn.user_id()
            && bound != user_id
        {
            return Err(GatewayError::AlreadyBound {
                connection_id: connection_id.to_string(),
                user_id: bound,
            });
        }

        let user_lock = self.user_lock(user_id);
        let guard = user_lock.lock().await;

        let lease = match self.coordinator.acquire_user_lock(user_id).await? {
            Some(lease) => lease,
            None => {
                metrics::LOGIN_CONFLICTS_TOTAL.inc();
                return Err(GatewayError::LoginInProgress(user_id.to_string()));
            }
        };

        let result = self.login_locked(&conn, user_id).await;

        if let Err(e) = self.coordinator.release_user_lock(lease).await {
            warn!("Failed to release login lock for user '{}': {}", user_id, e);
        }
        match &result {
            Ok(()) => info!(
                "User '{}' logged in on connection {} (node '{}').",
                user_id,
                conn.id(),
                self.node_id()
            ),
            Err(e) if e.is_retryable() => {
                metrics::LOGIN_CONFLICTS_TOTAL.inc();
                warn!("Login for user '{}' must be retried: {}", user_id, e);
            }
            Err(e) => warn!("Login for user '{}' failed: {}", user_id, e),
        }
        drop(guard);
        drop(user_lock);
        self.prune_user_lock(user_id);
        result
    }

    /// The conflict-resolution protocol, run with both the local and the
    /// distributed lock for `user_id` held.
    async fn login_locked(&self, conn: &Arc<Connection>, user_id: &str) -> Result<(), GatewayError> {
        // Ask a remote owner to let go, without waiting for it.
        if let Some(record) = self.coordinator.get_user_session(user_id).await?
            && !record.is_owned_by(self.node_id())
        {
            self.coordinator
                .publish_kick_notification(user_id, &record.node_id)
                .await?;
        }

        // Drop any stale local binding for this user.
        if let Some(existing) = self.users.get(user_id).map(|e| e.value().clone())
            && existing != conn.id()
        {
            match self.get_connection(&existing) {
                Some(stale) => {
                    info!(
                        "User '{}' re-logged in; closing previous connection {}.",
                        user_id, existing
                    );
                    self.teardown(&stale).await;
                }
                None => {
                    self.users.remove_if(user_id, |_, c| *c == existing);
                    self.sessions.remove_if_connection(user_id, &existing);
                }
            }
        }

        if conn.is_stopped() {
            return Err(GatewayError::ConnectionNotFound(conn.id().to_string()));
        }
        conn.bind(user_id);
        self.users.insert(user_id.to_string(), conn.id().to_string());
        self.sessions.create(user_id, conn.id());

        if let Err(e) = self.coordinator.verify_ownership(user_id).await {
            self.unbind_local(conn, user_id);
            return Err(e);
        }

        let committed = async {
            self.coordinator.set_user_session(user_id, conn.id()).await?;
            self.coordinator.register_connection(user_id, conn.id()).await
        }
        .await;
        if let Err(e) = committed {
            self.release_binding(conn, user_id).await;
            conn.unbind();
            return Err(e);
        }

        // The socket may have gone away while the commit was in flight.
        if conn.is_stopped() {
            self.release_binding(conn, user_id).await;
            return Err(GatewayError::ConnectionNotFound(conn.id().to_string()));
        }
        metrics::LOGGED_IN_USERS.set(self.users.len() as f64);
        Ok(())
    }

    /// Closes and forgets a connection. Safe to call any number of times, from
    /// any task; only the first call does the work.
    pub async fn remove_connection(&self, connection_id: &str) {
        let Some(conn) = self.get_connection(connection_id) else {
            debug!("Connection {} already removed.", connection_id);
            return;
        };
        match conn.user_id() {
            Some(user_id) => {
                let user_lock = self.user_lock(&user_id);
                let guard = user_lock.lock().await;
                self.teardown(&conn).await;
                drop(guard);
                drop(user_lock);
                self.prune_user_lock(&user_id);
            }
            None => self.teardown(&conn).await,
        }
    }

    /// Removes every connection, as on shutdown.
    pub async fn remove_all(&self) {
        let ids = self.connection_ids();
        info!("Closing {} local connection(s).", ids.len());
        for id in ids {
            self.remove_connection(&id).await;
        }
    }

    /// Logs `user_id` out of this node. See [`LocalSessionTable::force_logout`].
    pub async fn force_logout(&self, user_id: &str) -> Result<(), GatewayError> {
        self.sessions.force_logout(user_id, self).await
    }

    /// Enqueues `payload` for the user's connection on this node.
    pub fn send_to_user(&self, user_id: &str, payload: Bytes) -> Result<(), GatewayError> {
        let conn = self
            .get_connection_by_user(user_id)
            .filter(|c| !c.is_stopped())
            .ok_or_else(|| GatewayError::NotConnected(user_id.to_string()))?;
        conn.try_send(payload).inspect_err(|e| {
            if let GatewayError::QueueFull(_) = e {
                metrics::DROPPED_MESSAGES_TOTAL.inc();
                warn!(
                    "Outbound queue for user '{}' is full; dropping message.",
                    user_id
                );
            }
        })
    }

    /// Stops `conn` and, if it was bound, releases its binding. Callers hold
    /// the user's lock when the connection is bound.
    async fn teardown(&self, conn: &Arc<Connection>) {
        if !conn.stop() {
            return;
        }
        self.connections
            .remove_if(conn.id(), |_, c| Arc::ptr_eq(c, conn));
        metrics::CONNECTED_CLIENTS.dec();
        if let Some(user_id) = conn.user_id() {
            self.release_binding(conn, &user_id).await;
        }
        debug!("Connection {} torn down.", conn.id());
    }

    /// Drops local and shared state tying `user_id` to `conn`. Shared entries
    /// are only removed while they still point at this connection.
    async fn release_binding(&self, conn: &Connection, user_id: &str) {
        self.users.remove_if(user_id, |_, c| c == conn.id());
        self.sessions.remove_if_connection(user_id, conn.id());
        metrics::LOGGED_IN_USERS.set(self.users.len() as f64);

        let coordinator = &self.coordinator;
        let cleanup = async {
            match coordinator.remove_user_session_if_owned(user_id, conn.id()).await? {
                RecordRemoval::Removed | RecordRemoval::Absent => {
                    coordinator.unregister_connection(user_id, conn.id()).await?;
                }
                RecordRemoval::OwnedElsewhere => {
                    coordinator.forget_connection(conn.id()).await?;
                }
            }
            Ok::<(), GatewayError>(())
        };
        if let Err(e) = cleanup.await {
            error!(
                "Failed to clear shared session state for user '{}' (connection {}): {}",
                user_id,
                conn.id(),
                e
            );
        }
    }

    fn unbind_local(&self, conn: &Connection, user_id: &str) {
        conn.unbind();
        self.users.remove_if(user_id, |_, c| c == conn.id());
        self.sessions.remove_if_connection(user_id, conn.id());
    }

    fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        self.user_locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    /// Drops the user's lock entry once nobody else holds a handle to it.
    fn prune_user_lock(&self, user_id: &str) {
        self.user_locks
            .remove_if(user_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}
