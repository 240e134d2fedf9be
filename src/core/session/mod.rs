// src/core/session/mod.rs

//! Session state: the local per-node table and the cluster-wide coordinator.

pub mod coordinator;
pub mod kick_listener;
pub mod reaper;
pub mod record;
pub mod table;

pub use coordinator::{KickPath, LockToken, RecordRemoval, SessionCoordinator};
pub use kick_listener::KickListenerTask;
pub use reaper::SessionReaperTask;
pub use record::SessionRecord;
pub use table::{LocalSession, LocalSessionTable};
