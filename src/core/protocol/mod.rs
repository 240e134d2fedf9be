// src/core/protocol/mod.rs

pub mod envelope;
pub mod kick;
pub mod message;
pub mod resp_frame;
pub mod storage;

pub use envelope::{Delivery, Envelope, EnvelopeType};
pub use kick::KickCommand;
pub use message::{RequestMessage, RequestPayload, ResponseMessage};
pub use resp_frame::{RespFrame, RespFrameCodec};
