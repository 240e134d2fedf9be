// src/core/registry/connection.rs

//! A single live client socket as seen by the registry.

use crate::core::GatewayError;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// One physical socket owned by this node.
///
/// The outbound queue is a bounded FIFO drained by the connection's write task.
/// Its sender is held here and taken exactly once on stop, which closes the
/// queue and lets the writer finish.
#[derive(Debug)]
pub struct Connection {
    id: String,
    addr: SocketAddr,
    created: Instant,
    user_id: RwLock<Option<String>>,
    outbound: Mutex<Option<mpsc::Sender<Bytes>>>,
    logged_in: AtomicBool,
    stopped: AtomicBool,
    cancel: CancellationToken,
}

impl Connection {
    pub(crate) fn new(id: String, addr: SocketAddr, capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity);
        let conn = Self {
            id,
            addr,
            created: Instant::now(),
            user_id: RwLock::new(None),
            outbound: Mutex::new(Some(tx)),
            logged_in: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        };
        (conn, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn user_id(&self) -> Option<String> {
        self.user_id.read().clone()
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Enqueues without waiting. A full queue drops the message.
    pub fn try_send(&self, payload: Bytes) -> Result<(), GatewayError> {
        let guard = self.outbound.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(GatewayError::NotConnected(self.label()));
        };
        match tx.try_send(payload) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(GatewayError::QueueFull(self.label())),
            Err(TrySendError::Closed(_)) => Err(GatewayError::NotConnected(self.label())),
        }
    }

    /// Messages waiting in the outbound queue.
    pub fn queue_len(&self) -> usize {
        self.outbound
            .lock()
            .as_ref()
            .map_or(0, |tx| tx.max_capacity() - tx.capacity())
    }

    /// Resolves once the connection has been stopped.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub(crate) fn bind(&self, user_id: &str) {
        *self.user_id.write() = Some(user_id.to_string());
        self.logged_in.store(true, Ordering::SeqCst);
    }

    pub(crate) fn unbind(&self) {
        self.logged_in.store(false, Ordering::SeqCst);
        *self.user_id.write() = None;
    }

    /// Marks the connection stopped, cancels its tasks and closes the outbound
    /// queue. Only the first call does anything; it returns `true`.
    pub(crate) fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.logged_in.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        drop(self.outbound.lock().take());
        true
    }

    fn label(&self) -> String {
        self.user_id().unwrap_or_else(|| self.id.clone())
    }
}
