//! # Connection Handle
//!
//! One physical device connection: framed reader, single-writer sink, auth
//! identity and liveness timestamps.
//!
//! ## Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   accept ──► Connection::new ──► AuthGate ──► authenticate(identity)   │
//! │                   │                  │                 │                │
//! │                   │                  │ rejected        ▼                │
//! │                   │                  ▼           registry.add           │
//! │                   │               close()            │                  │
//! │                   │                                  ▼                  │
//! │                   │                   read loop + heartbeat + fan-out   │
//! │                   │                                  │                  │
//! │                   │             any transport error / shutdown          │
//! │                   │                                  ▼                  │
//! │                   └──────────────────────► registry.remove + close()   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency
//! The connection task is the only reader. Writers (the task itself, its
//! heartbeat loop and the dispatcher) serialize on the sink mutex. `close()`
//! cancels a per-connection token so a reader parked in `read_message`
//! returns immediately.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

use folio_core::UserId;

use crate::codec::EnvelopeCodec;
use crate::error::{SyncError, SyncResult};
use crate::protocol::Envelope;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

// =============================================================================
// Identity
// =============================================================================

/// Registry key of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        ConnectionId(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        ConnectionId::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Who is on the other end, known once the handshake succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub user_id: UserId,
    pub display_name: String,
    pub device_name: String,
    pub device_type: String,
    pub authenticated_at: DateTime<Utc>,
}

// =============================================================================
// Timeouts
// =============================================================================

/// Read and write deadlines applied by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionTimeouts {
    /// Read deadline before authentication. Default: 30s
    pub unauthenticated_read: Duration,

    /// Read deadline after authentication. Default: 60s
    pub authenticated_read: Duration,

    /// Write deadline. Default: 10s
    pub write: Duration,
}

impl Default for ConnectionTimeouts {
    fn default() -> Self {
        ConnectionTimeouts {
            unauthenticated_read: Duration::from_secs(30),
            authenticated_read: Duration::from_secs(60),
            write: Duration::from_secs(10),
        }
    }
}

// =============================================================================
// Connection
// =============================================================================

/// A single device connection. Shared as `Arc<Connection>` between its task,
/// the registry and the dispatcher.
pub struct Connection {
    id: ConnectionId,
    remote_addr: String,
    reader: Mutex<FramedRead<BoxedReader, EnvelopeCodec>>,
    writer: Mutex<Option<FramedWrite<BoxedWriter, EnvelopeCodec>>>,
    identity: OnceLock<DeviceIdentity>,
    closed: CancellationToken,
    timeouts: ConnectionTimeouts,
    connected_at: DateTime<Utc>,
    last_seen_ms: AtomicI64,
}

impl Connection {
    /// Wraps a byte stream.
    ///
    /// `shutdown` is the server's root token; cancelling it closes this
    /// connection's read side as well.
    pub fn new<S>(
        stream: S,
        remote_addr: impl Into<String>,
        timeouts: ConnectionTimeouts,
        max_frame_bytes: usize,
        shutdown: &CancellationToken,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let reader: BoxedReader = Box::new(read_half);
        let writer: BoxedWriter = Box::new(write_half);
        let now = Utc::now();

        Arc::new(Connection {
            id: ConnectionId::new(),
            remote_addr: remote_addr.into(),
            reader: Mutex::new(FramedRead::new(reader, EnvelopeCodec::new(max_frame_bytes))),
            writer: Mutex::new(Some(FramedWrite::new(
                writer,
                EnvelopeCodec::new(max_frame_bytes),
            ))),
            identity: OnceLock::new(),
            closed: shutdown.child_token(),
            timeouts,
            connected_at: now,
            last_seen_ms: AtomicI64::new(now.timestamp_millis()),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Time of the last successful read or write.
    pub fn last_seen(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_seen_ms.load(Ordering::Relaxed))
            .unwrap_or(self.connected_at)
    }

    pub fn identity(&self) -> Option<&DeviceIdentity> {
        self.identity.get()
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.identity.get().map(|identity| identity.user_id)
    }

    /// Marks the connection authenticated.
    ///
    /// Returns `false` if an identity was already set; the first one wins.
    pub fn authenticate(&self, identity: DeviceIdentity) -> bool {
        self.identity.set(identity).is_ok()
    }

    /// True once authenticated and until closed.
    pub fn is_authenticated(&self) -> bool {
        self.identity.get().is_some() && !self.is_closed()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves when the connection is closed (locally or by shutdown).
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Reads the next envelope.
    ///
    /// Waits at most the unauthenticated or authenticated read deadline,
    /// depending on the current state.
    pub async fn read_message(&self) -> SyncResult<Envelope> {
        if self.is_closed() {
            return Err(SyncError::ConnectionClosed);
        }

        let deadline = if self.identity.get().is_some() {
            self.timeouts.authenticated_read
        } else {
            self.timeouts.unauthenticated_read
        };

        let mut reader = self.reader.lock().await;

        let next = tokio::select! {
            _ = self.closed.cancelled() => return Err(SyncError::ConnectionClosed),
            next = tokio::time::timeout(deadline, reader.next()) => next,
        };

        match next {
            Err(_) => Err(SyncError::Timeout {
                operation: "read",
                secs: deadline.as_secs(),
            }),
            Ok(None) => Err(SyncError::Disconnected),
            Ok(Some(Err(e))) => Err(e),
            Ok(Some(Ok(envelope))) => {
                self.touch();
                trace!(conn_id = %self.id, kind = envelope.type_name(), "Envelope received");
                Ok(envelope)
            }
        }
    }

    /// Writes one envelope under the write deadline.
    pub async fn send_message(&self, envelope: Envelope) -> SyncResult<()> {
        if self.is_closed() {
            return Err(SyncError::ConnectionClosed);
        }

        let kind = envelope.type_name();
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(SyncError::ConnectionClosed)?;

        match tokio::time::timeout(self.timeouts.write, writer.send(envelope)).await {
            Err(_) => Err(SyncError::Timeout {
                operation: "write",
                secs: self.timeouts.write.as_secs(),
            }),
            Ok(Err(e)) => Err(e),
            Ok(Ok(())) => {
                self.touch();
                trace!(conn_id = %self.id, kind, "Envelope sent");
                Ok(())
            }
        }
    }

    /// Releases the transport. Safe to call any number of times.
    pub async fn close(&self) {
        self.closed.cancel();

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            // Flushes what is buffered and shuts the write side down.
            let _ = tokio::time::timeout(self.timeouts.write, writer.close()).await;
            debug!(conn_id = %self.id, addr = %self.remote_addr, "Connection closed");
        }
    }

    fn touch(&self) {
        self.last_seen_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("user_id", &self.user_id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
