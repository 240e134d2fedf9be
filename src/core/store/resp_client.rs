// src/core/store/resp_client.rs

//! A minimal RESP connection used by the store and the stream broker.

use crate::core::GatewayError;
use crate::core::protocol::{RespFrame, RespFrameCodec};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::warn;

/// A single framed connection to a Redis-protocol server.
pub struct RespConnection {
    framed: Framed<TcpStream, RespFrameCodec>,
    command_timeout: Duration,
}

impl RespConnection {
    /// Opens a TCP connection to `addr` with a timeout.
    pub async fn connect(
        addr: &str,
        connect_timeout: Duration,
        command_timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| GatewayError::Store(format!("connect to {addr} timed out")))??;
        stream.set_nodelay(true)?;
        Ok(Self {
            framed: Framed::new(stream, RespFrameCodec),
            command_timeout,
        })
    }

    /// Sends one command and waits for its reply. `-ERR` replies become errors.
    pub async fn call(&mut self, frame: RespFrame) -> Result<RespFrame, GatewayError> {
        self.send(frame).await?;
        self.read_with_timeout(self.command_timeout).await?.into_result()
    }

    /// Sends several commands back to back, then reads one reply per command.
    pub async fn pipeline(&mut self, frames: Vec<RespFrame>) -> Result<Vec<RespFrame>, GatewayError> {
        let count = frames.len();
        for frame in frames {
            self.framed.feed(frame).await?;
        }
        self.framed.flush().await?;
        let mut replies = Vec::with_capacity(count);
        for _ in 0..count {
            replies.push(self.read_with_timeout(self.command_timeout).await?);
        }
        Ok(replies)
    }

    pub async fn send(&mut self, frame: RespFrame) -> Result<(), GatewayError> {
        tokio::time::timeout(self.command_timeout, self.framed.send(frame))
            .await
            .map_err(|_| GatewayError::Store("write timed out".to_string()))?
    }

    /// Reads the next frame, waiting at most `timeout`.
    pub async fn read_with_timeout(&mut self, timeout: Duration) -> Result<RespFrame, GatewayError> {
        match tokio::time::timeout(timeout, self.framed.next()).await {
            Ok(Some(Ok(frame))) => Ok(frame),
            Ok(Some(Err(e))) => Err(e),
            Ok(None) => Err(GatewayError::Store("connection closed by peer".to_string())),
            Err(_) => Err(GatewayError::Store("read timed out".to_string())),
        }
    }

    /// Reads the next frame with no deadline. Used by subscriber connections.
    pub async fn read(&mut self) -> Result<RespFrame, GatewayError> {
        match self.framed.next().await {
            Some(result) => result,
            None => Err(GatewayError::Store("connection closed by peer".to_string())),
        }
    }
}

/// Connects, retrying with exponential backoff. Used at startup.
pub async fn connect_with_retry(
    addr: &str,
    connect_timeout: Duration,
    command_timeout: Duration,
    attempts: u32,
    initial_backoff: Duration,
) -> Result<RespConnection, GatewayError> {
    let mut backoff = initial_backoff;
    let mut last_err = GatewayError::Store(format!("no connection attempt made to {addr}"));
    for attempt in 1..=attempts.max(1) {
        match RespConnection::connect(addr, connect_timeout, command_timeout).await {
            Ok(mut conn) => match conn.call(RespFrame::command(["PING"])).await {
                Ok(_) => return Ok(conn),
                Err(e) => last_err = e,
            },
            Err(e) => last_err = e,
        }
        if attempt < attempts {
            warn!(
                "Connection to {} failed (attempt {}/{}): {}. Retrying in {:?}.",
                addr, attempt, attempts, last_err, backoff
            );
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(10));
        }
    }
    Err(last_err)
}

/// Converts a bulk/simple string reply into an owned string.
pub fn frame_to_string(frame: &RespFrame) -> Result<Option<String>, GatewayError> {
    if frame.is_null() {
        return Ok(None);
    }
    match frame.as_bytes() {
        Some(bytes) => Ok(Some(String::from_utf8(bytes.to_vec())?)),
        None => Err(GatewayError::Store(format!("unexpected reply: {frame:?}"))),
    }
}
