// src/core/routing/mod.rs

//! Outbound routing and inbound broker dispatch.

pub mod dispatcher;
pub mod router;

pub use dispatcher::{DispatchOutcome, InboundDispatcher, InboundDispatcherTask};
pub use router::{MessageRouter, RouteDecision};
