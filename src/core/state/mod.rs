// src/core/state/mod.rs

//! Defines the central `GatewayState` struct and its statistics.

mod core;
mod stats;

pub use core::{GatewayState, LogReloadHandle};
pub use stats::StatsState;
