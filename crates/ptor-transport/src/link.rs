//! Connection links.
//!
//! A connection is split on arrival: the read half goes to whichever loop
//! consumes it (a relay's serve loop, a pump, the client), the write half is
//! wrapped in a [`Link`] that can be shared between tasks. Writes through a
//! link are serialized by its lock so cells from different tasks never
//! interleave.
//!
//! Closing a link is a signal, not an I/O operation: readers `select!` on
//! [`Link::closed`] and stop, and the socket goes away when the last handle
//! to its halves is dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};

use ptor_types::CircuitId;

use crate::cell::Cell;
use crate::frame;
use crate::{Result, TransportError};

/// Boxed read half.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed write half.
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Shared write half of a connection.
pub struct Link {
    peer: String,
    writer: Mutex<BoxWriter>,
    closed: watch::Sender<bool>,
}

impl Link {
    pub fn new(peer: impl Into<String>, writer: BoxWriter) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            peer: peer.into(),
            writer: Mutex::new(writer),
            closed,
        }
    }

    /// Remote address, for logging.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Write one regular frame.
    pub async fn send_cell(&self, circuit_id: &CircuitId, cell: &Cell) -> Result<()> {
        let bytes = frame::encode_frame(circuit_id, cell)?;
        self.write_raw(&bytes).await
    }

    /// Write one unpadded CREATED frame.
    pub async fn send_created(&self, circuit_id: &CircuitId, payload: &[u8]) -> Result<()> {
        let bytes = frame::encode_created(circuit_id, payload)?;
        self.write_raw(&bytes).await
    }

    /// Write raw bytes (stream data towards a target).
    pub async fn write_raw(&self, bytes: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Mark the link closed. Idempotent.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    /// Close and shut down the write direction.
    pub async fn shutdown(&self) {
        self.close();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!(peer = %self.peer, error = %e, "link shutdown");
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        // Sender lives in self, so wait_for only fails if self is gone.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// A freshly split connection.
pub struct Connection {
    pub reader: BoxReader,
    pub link: Arc<Link>,
}

impl Connection {
    /// Split an accepted or dialed TCP stream.
    pub fn from_tcp(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%peer, error = %e, "set_nodelay failed");
        }
        let (reader, writer) = stream.into_split();
        Self::from_parts(peer, Box::new(reader), Box::new(writer))
    }

    /// Build from arbitrary halves (in-memory pipes in tests).
    pub fn from_parts(peer: impl Into<String>, reader: BoxReader, writer: BoxWriter) -> Self {
        Self {
            reader,
            link: Arc::new(Link::new(peer, writer)),
        }
    }
}

/// Dial `addr` over TCP within `timeout`.
pub async fn dial(addr: &str, timeout: Duration) -> Result<Connection> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::Timeout(addr.to_string()))??;
    tracing::debug!(%addr, "dialed");
    Ok(Connection::from_tcp(stream))
}
