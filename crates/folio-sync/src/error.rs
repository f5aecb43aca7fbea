//! # Sync Error Types
//!
//! Error types for the sync engine.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transport     │  │     Protocol            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Io             │  │  InvalidMessage         │ │
//! │  │  ConfigLoad     │  │  Disconnected   │  │  FrameTooLarge          │ │
//! │  │  BindFailed     │  │  Timeout        │  │  Serialization          │ │
//! │  │                 │  │  ConnectionClosed│ │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │    Database     │  │  Deferred write │  │      Internal           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  DatabaseError  │  │  InvalidOperation│ │  ShuttingDown           │ │
//! │  │                 │  │  BroadcastDropped│ │  Internal               │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Authentication failures have their own type, [`crate::auth::AuthError`],
//! because each one maps onto a distinct wire error code.

use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering every failure the engine can surface.
///
/// None of these are fatal to the process; callers close the affected
/// connection or discard the affected queue entry.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Failed to bind the listener.
    #[error("Bind failed on {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    /// Socket read or write failed.
    #[error("I/O error: {0}")]
    Io(String),

    /// Peer closed the connection.
    #[error("Peer disconnected")]
    Disconnected,

    /// A read or write did not finish before its deadline.
    #[error("{operation} timed out after {secs} seconds")]
    Timeout { operation: &'static str, secs: u64 },

    /// Operation on a connection that was already closed locally.
    #[error("Connection already closed")]
    ConnectionClosed,

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Malformed envelope or unknown message type.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// A frame exceeded the per-connection buffer cap.
    #[error("Frame exceeds {limit} bytes without a delimiter")]
    FrameTooLarge { limit: usize },

    /// Failed to serialize an outgoing envelope.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    // =========================================================================
    // Registry Errors
    // =========================================================================
    /// Only authenticated connections may be registered.
    #[error("Connection {0} is not authenticated")]
    NotAuthenticated(String),

    // =========================================================================
    // Database Errors
    // =========================================================================
    /// Persistence collaborator failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    // =========================================================================
    // Deferred Write Errors
    // =========================================================================
    /// Queued operation failed validation.
    #[error("Invalid write operation: {0}")]
    InvalidOperation(String),

    /// Re-submission of a queued broadcast was dropped by the dispatcher.
    #[error("Broadcast for user {user_id} was dropped")]
    BroadcastDropped { user_id: i64 },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Service is shutting down.
    #[error("Sync service is shutting down")]
    ShuttingDown,
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<folio_db::DbError> for SyncError {
    fn from(err: folio_db::DbError) -> Self {
        SyncError::DatabaseError(err.to_string())
    }
}

impl From<folio_core::CoreError> for SyncError {
    fn from(err: folio_core::CoreError) -> Self {
        SyncError::InvalidOperation(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

/// Socket errors. Resets and broken pipes read as a disconnect.
impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => SyncError::Disconnected,
            _ => SyncError::Io(err.to_string()),
        }
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// Returns true if this error means the connection is dead.
    ///
    /// The connection task evicts the device from the registry on any of
    /// these.
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            SyncError::Io(_)
                | SyncError::Disconnected
                | SyncError::Timeout { .. }
                | SyncError::ConnectionClosed
        )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::BindFailed { .. }
        )
    }

    /// Returns true if the peer violated the wire protocol.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidMessage(_)
                | SyncError::FrameTooLarge { .. }
                | SyncError::SerializationFailed(_)
        )
    }
}
