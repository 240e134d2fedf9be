// src/connection/mod.rs

//! Manages the lifecycle of a single client WebSocket connection, including
//! frame decoding, request handling, and per-connection session state.

mod guard;
mod handler;
mod session;

pub use guard::ConnectionGuard;
pub use handler::ConnectionHandler;
pub use session::SessionState;
