// src/core/registry/mod.rs

//! The per-node registry of live client connections.

mod connection;
mod core;

pub use connection::Connection;
pub use core::ConnectionRegistry;
