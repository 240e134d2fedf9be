// src/core/protocol/envelope.rs

//! The tagged wire wrapper multiplexing every message family carried by the broker.

use crate::core::GatewayError;
use bincode::config;
use bincode::{Decode, Encode};
use strum_macros::{AsRefStr, Display};

/// Upper bound on the bytes a single decoded message may claim.
pub const MAX_DECODE_BYTES: usize = 16 * 1024 * 1024;

/// Identifies how an envelope's payload must be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum EnvelopeType {
    /// A `Delivery` addressed to a user bound on the receiving node.
    Request,
    /// A `Delivery` carrying a server-originated response for a user.
    Response,
    /// A `StorageRequest` for the storage service.
    StorageRequest,
    /// A `StorageResponse` coming back from the storage service.
    StorageResponse,
    /// UTF-8 text, used for legacy commands such as fallback kicks.
    LegacyText,
}

/// The wire record: a type tag plus an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Envelope {
    pub kind: EnvelopeType,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(kind: EnvelopeType, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    /// Wraps a bincode-encodable value.
    pub fn wrap<T: Encode>(kind: EnvelopeType, value: &T) -> Result<Self, GatewayError> {
        Ok(Self::new(kind, encode(value)?))
    }

    pub fn legacy_text(text: impl Into<String>) -> Self {
        Self::new(EnvelopeType::LegacyText, text.into().into_bytes())
    }

    pub fn encode(&self) -> Result<Vec<u8>, GatewayError> {
        encode(self)
    }

    /// Parses an envelope. The whole buffer must be consumed.
    pub fn decode(bytes: &[u8]) -> Result<Self, GatewayError> {
        decode(bytes).map_err(|e| GatewayError::MalformedEnvelope(e.to_string()))
    }

    /// Decodes the payload as `T`.
    pub fn open<T: Decode<()>>(&self) -> Result<T, GatewayError> {
        decode(&self.payload)
    }

    /// Returns the payload as text for `LegacyText` envelopes.
    pub fn text(&self) -> Result<&str, GatewayError> {
        Ok(std::str::from_utf8(&self.payload)?)
    }
}

/// A payload addressed to one user, used by `Request` and `Response` envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Delivery {
    pub target_user_id: String,
    /// An encoded `ResponseMessage` ready to be written to the client socket.
    pub payload: Vec<u8>,
}

/// Encodes any wire value with the standard bincode configuration.
pub fn encode<T: Encode>(value: &T) -> Result<Vec<u8>, GatewayError> {
    Ok(bincode::encode_to_vec(value, config::standard())?)
}

/// Decodes a wire value, rejecting trailing bytes. Length prefixes are
/// checked against `MAX_DECODE_BYTES` before anything is allocated.
pub fn decode<T: Decode<()>>(bytes: &[u8]) -> Result<T, GatewayError> {
    let config = config::standard().with_limit::<MAX_DECODE_BYTES>();
    let (value, read) = bincode::decode_from_slice::<T, _>(bytes, config)?;
    if read != bytes.len() {
        return Err(GatewayError::Protocol(format!(
            "{} trailing bytes after message",
            bytes.len() - read
        )));
    }
    Ok(value)
}
