//! Message channel client for the imaging device.
//!
//! The device transport is fire-and-forget: replies carry no request
//! identifier and arrive in the order requests were sent. This client turns
//! it into request/response semantics by strictly serializing exchanges:
//! at most one request is in flight per connection, enforced with a
//! single-slot async mutex held across the whole write-then-read exchange.
//! Concurrent callers therefore observe their replies in send order.
//!
//! Every exchange runs under a configurable timeout. After a timeout or I/O
//! fault the connection is dropped and redialed before the session lock is
//! released, so a reply that arrives late can never be read by (and
//! mis-correlated to) the next caller. Neither failure is retried here;
//! retry policy belongs to the caller.

use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{
    tcp::{OwnedReadHalf, OwnedWriteHalf},
    TcpStream,
};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{BridgeError, BridgeResult};
use crate::protocol::{parse_reply, DeviceReply, TriggerCommand};

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// Request/response client over one channel connection.
pub struct ChannelClient {
    endpoint: String,
    timeout: Duration,
    session: Mutex<Option<Connection>>,
}

impl ChannelClient {
    /// Create a client for `endpoint` (`host:port`). No connection is made
    /// until the first exchange (or an explicit [`ChannelClient::connect`]).
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout,
            session: Mutex::new(None),
        }
    }

    /// Eagerly establish the connection. Useful at startup so a bad endpoint
    /// fails fast instead of on the first trigger.
    pub async fn connect(&self) -> BridgeResult<()> {
        let mut session = self.session.lock().await;
        if session.is_none() {
            *session = Some(self.dial().await?);
        }
        Ok(())
    }

    /// Perform one trigger exchange: send the command, await the reply line,
    /// decode it.
    ///
    /// # Errors
    ///
    /// - `ChannelTimeout` if no reply arrives within the configured timeout.
    /// - `ChannelProtocol` if the reply is malformed or the peer closed the
    ///   connection mid-exchange.
    /// - `Io` if the connection cannot be (re)established or written to.
    pub async fn send_trigger(&self, command: &TriggerCommand) -> BridgeResult<DeviceReply> {
        let line = command.encode()?;

        let mut session = self.session.lock().await;
        if session.is_none() {
            *session = Some(self.dial().await?);
        }
        // Checked above; the Option is only None again after a fault below.
        let Some(conn) = session.as_mut() else {
            return Err(BridgeError::ChannelNotConnected);
        };

        debug!(endpoint = %self.endpoint, command = %line, "Sending trigger command");
        if let Err(e) = Self::write_line(&mut conn.writer, &line).await {
            *session = None;
            return Err(e.into());
        }

        let mut reply_line = String::new();
        let read = tokio::time::timeout(self.timeout, conn.reader.read_line(&mut reply_line));
        match read.await {
            Ok(Ok(0)) => {
                *session = None;
                Err(BridgeError::ChannelProtocol(
                    "connection closed before reply".to_string(),
                ))
            }
            Ok(Ok(_)) => {
                debug!(reply = %reply_line.trim(), "Received channel reply");
                parse_reply(&reply_line)
            }
            Ok(Err(e)) => {
                *session = None;
                Err(BridgeError::Io(e))
            }
            Err(_) => {
                // The reply may still arrive on this connection later; drop
                // it so the next exchange starts from a clean session.
                warn!(
                    endpoint = %self.endpoint,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Channel exchange timed out, dropping connection"
                );
                *session = None;
                Err(BridgeError::ChannelTimeout(self.timeout))
            }
        }
    }

    async fn dial(&self) -> BridgeResult<Connection> {
        let stream = TcpStream::connect(&self.endpoint).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        debug!(endpoint = %self.endpoint, "Channel connected");
        Ok(Connection {
            reader: BufReader::new(read_half),
            writer: write_half,
        })
    }

    async fn write_line(writer: &mut OwnedWriteHalf, line: &str) -> std::io::Result<()> {
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await
    }
}
