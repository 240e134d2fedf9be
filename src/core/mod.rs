// src/core/mod.rs

//! The central module containing the core logic and data structures of SpinelGate.

pub mod auth;
pub mod broker;
pub mod errors;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod routing;
pub mod session;
pub mod state;
pub mod storage_bridge;
pub mod store;

pub use errors::GatewayError;
