//! Connection to the remote collector.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::debug;

use crate::error::{TransportError, TransportResult};
use crate::proto::Response;

/// Reconnecting, request/response link used by the sender.
#[async_trait]
pub trait Transport: Send {
    /// Connect if not already connected.
    async fn connect_once(&mut self, timeout: Duration) -> TransportResult<()>;

    /// Drop the connection if there is one.
    async fn disconnect_once(&mut self);

    async fn send_bytes(&mut self, data: &[u8], timeout: Duration) -> TransportResult<()>;

    /// Wait for the collector's answer to the last frame sent.
    async fn recv(&mut self, timeout: Duration) -> TransportResult<Response>;
}

/// Length-delimited frames over TCP; each sent frame is answered by one
/// JSON encoded [`Response`] frame.
pub struct TcpTransport {
    addr: String,
    conn: Option<Framed<TcpStream, LengthDelimitedCodec>>,
}

impl TcpTransport {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            conn: None,
        }
    }

    fn conn(&mut self) -> TransportResult<&mut Framed<TcpStream, LengthDelimitedCodec>> {
        self.conn.as_mut().ok_or(TransportError::NotConnected)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect_once(&mut self, limit: Duration) -> TransportResult<()> {
        if self.conn.is_some() {
            return Ok(());
        }
        let connect = TcpStream::connect(&self.addr);
        let stream = timeout(limit, connect)
            .await
            .map_err(|_| TransportError::Timeout {
                op: "connect",
                secs: limit.as_secs_f64(),
            })?
            .map_err(|e| TransportError::Connect {
                addr: self.addr.clone(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true)?;
        debug!(addr = %self.addr, "connected to collector");
        self.conn = Some(Framed::new(stream, LengthDelimitedCodec::new()));
        Ok(())
    }

    async fn disconnect_once(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            let _ = SinkExt::<Bytes>::close(&mut conn).await;
            debug!(addr = %self.addr, "disconnected from collector");
        }
    }

    async fn send_bytes(&mut self, data: &[u8], limit: Duration) -> TransportResult<()> {
        let frame = Bytes::copy_from_slice(data);
        let conn = self.conn()?;
        let result = timeout(limit, conn.send(frame)).await;
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.conn = None;
                Err(TransportError::Io(e))
            }
            Err(_) => {
                self.conn = None;
                Err(TransportError::Timeout {
                    op: "send",
                    secs: limit.as_secs_f64(),
                })
            }
        }
    }

    async fn recv(&mut self, limit: Duration) -> TransportResult<Response> {
        let conn = self.conn()?;
        let frame = match timeout(limit, conn.next()).await {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(e))) => {
                self.conn = None;
                return Err(TransportError::Io(e));
            }
            Ok(None) => {
                self.conn = None;
                return Err(TransportError::Closed);
            }
            Err(_) => {
                self.conn = None;
                return Err(TransportError::Timeout {
                    op: "recv",
                    secs: limit.as_secs_f64(),
                });
            }
        };
        serde_json::from_slice(&frame).map_err(|e| TransportError::InvalidResponse {
            reason: e.to_string(),
        })
    }
}
