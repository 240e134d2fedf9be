// src/core/protocol/resp_frame.rs

//! Implements the RESP (REdis Serialization Protocol) frame structure and the
//! corresponding `Encoder` and `Decoder` used by the shared store and stream broker clients.

use crate::core::GatewayError;
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// The CRLF (Carriage Return, Line Feed) sequence used to terminate lines in RESP.
const CRLF: &[u8] = b"\r\n";
const CRLF_LEN: usize = 2;

// Protocol-level limits for replies coming back from the store.
const MAX_FRAME_ELEMENTS: usize = 1_024 * 1_024;
const MAX_BULK_STRING_SIZE: usize = 512 * 1024 * 1024;
const MAX_RECURSION_DEPTH: usize = 32;

/// A single frame in the RESP protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum RespFrame {
    SimpleString(String),
    Error(String),
    Integer(i64),
    BulkString(Bytes),
    Null,
    NullArray,
    Array(Vec<RespFrame>),
}

impl RespFrame {
    /// Builds a command array from its parts, e.g. `["SET", key, value]`.
    pub fn command<I, T>(parts: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        RespFrame::Array(
            parts
                .into_iter()
                .map(|p| RespFrame::BulkString(p.into()))
                .collect(),
        )
    }

    /// Encodes a frame into a fresh byte vector.
    pub fn encode_to_vec(&self) -> Result<Vec<u8>, GatewayError> {
        let mut buf = BytesMut::new();
        RespFrameCodec.encode(self.clone(), &mut buf)?;
        Ok(buf.to_vec())
    }

    /// Returns the payload of a bulk or simple string reply.
    pub fn as_bytes(&self) -> Option<Bytes> {
        match self {
            RespFrame::BulkString(b) => Some(b.clone()),
            RespFrame::SimpleString(s) => Some(Bytes::from(s.clone())),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RespFrame::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RespFrame::Null | RespFrame::NullArray)
    }

    /// Turns a server `-ERR ...` reply into a store error, passing other frames through.
    pub fn into_result(self) -> Result<RespFrame, GatewayError> {
        match self {
            RespFrame::Error(e) => Err(GatewayError::Store(e)),
            other => Ok(other),
        }
    }
}

/// A `tokio_util::codec` implementation for encoding and decoding `RespFrame`s.
#[derive(Debug, Default, Clone, Copy)]
pub struct RespFrameCodec;

impl Encoder<RespFrame> for RespFrameCodec {
    type Error = GatewayError;

    fn encode(&mut self, item: RespFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            RespFrame::SimpleString(s) => {
                dst.extend_from_slice(b"+");
                dst.extend_from_slice(s.as_bytes());
                dst.extend_from_slice(CRLF);
            }
            RespFrame::Error(s) => {
                dst.extend_from_slice(b"-");
                dst.extend_from_slice(s.as_bytes());
                dst.extend_from_slice(CRLF);
            }
            RespFrame::Integer(i) => {
                dst.extend_from_slice(b":");
                dst.extend_from_slice(i.to_string().as_bytes());
                dst.extend_from_slice(CRLF);
            }
            RespFrame::BulkString(b) => {
                dst.extend_from_slice(b"$");
                dst.extend_from_slice(b.len().to_string().as_bytes());
                dst.extend_from_slice(CRLF);
                dst.extend_from_slice(&b);
                dst.extend_from_slice(CRLF);
            }
            RespFrame::Null => dst.extend_from_slice(b"$-1\r\n"),
            RespFrame::NullArray => dst.extend_from_slice(b"*-1\r\n"),
            RespFrame::Array(arr) => {
                dst.extend_from_slice(b"*");
                dst.extend_from_slice(arr.len().to_string().as_bytes());
                dst.extend_from_slice(CRLF);
                for frame in arr {
                    self.encode(frame, dst)?;
                }
            }
        }
        Ok(())
    }
}

impl Decoder for RespFrameCodec {
    type Item = RespFrame;
    type Error = GatewayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let mut bytes = &src[..];
        match decode_recursive(&mut bytes, 0) {
            Ok(frame) => {
                let len = src.len() - bytes.len();
                src.advance(len);
                Ok(Some(frame))
            }
            // Not enough buffered yet; wait for more data.
            Err(GatewayError::IncompleteData) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn syntax(what: &str) -> GatewayError {
    GatewayError::Protocol(format!("invalid RESP {what}"))
}

fn decode_recursive(bytes: &mut &[u8], depth: usize) -> Result<RespFrame, GatewayError> {
    if depth > MAX_RECURSION_DEPTH {
        return Err(GatewayError::Protocol(
            "RESP recursion depth limit exceeded".to_string(),
        ));
    }
    let Some(&prefix) = bytes.first() else {
        return Err(GatewayError::IncompleteData);
    };
    *bytes = &bytes[1..];

    match prefix {
        b'+' => Ok(RespFrame::SimpleString(
            String::from_utf8_lossy(parse_line(bytes)?).to_string(),
        )),
        b'-' => Ok(RespFrame::Error(
            String::from_utf8_lossy(parse_line(bytes)?).to_string(),
        )),
        b':' => Ok(RespFrame::Integer(parse_number(bytes, "integer")?)),
        b'$' => {
            let len = parse_number(bytes, "bulk length")?;
            if len == -1 {
                return Ok(RespFrame::Null);
            }
            let len = usize::try_from(len).map_err(|_| syntax("bulk length"))?;
            if len > MAX_BULK_STRING_SIZE {
                return Err(syntax("bulk length"));
            }
            if bytes.len() < len + CRLF_LEN {
                return Err(GatewayError::IncompleteData);
            }
            if &bytes[len..len + CRLF_LEN] != CRLF {
                return Err(syntax("bulk terminator"));
            }
            let data = Bytes::copy_from_slice(&bytes[..len]);
            *bytes = &bytes[len + CRLF_LEN..];
            Ok(RespFrame::BulkString(data))
        }
        b'*' => {
            let len = parse_number(bytes, "array length")?;
            if len == -1 {
                return Ok(RespFrame::NullArray);
            }
            let len = usize::try_from(len).map_err(|_| syntax("array length"))?;
            if len > MAX_FRAME_ELEMENTS {
                return Err(syntax("array length"));
            }
            let mut frames = Vec::with_capacity(len.min(1024));
            for _ in 0..len {
                frames.push(decode_recursive(bytes, depth + 1)?);
            }
            Ok(RespFrame::Array(frames))
        }
        _ => Err(syntax("type prefix")),
    }
}

/// Returns the next line without its CRLF and advances past it.
fn parse_line<'a>(bytes: &mut &'a [u8]) -> Result<&'a [u8], GatewayError> {
    match bytes.windows(CRLF_LEN).position(|window| window == CRLF) {
        Some(pos) => {
            let line = &bytes[..pos];
            *bytes = &bytes[pos + CRLF_LEN..];
            Ok(line)
        }
        None => Err(GatewayError::IncompleteData),
    }
}

fn parse_number(bytes: &mut &[u8], what: &str) -> Result<i64, GatewayError> {
    let line = parse_line(bytes)?;
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| syntax(what))
}
