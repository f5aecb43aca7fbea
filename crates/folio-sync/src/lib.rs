//! # folio-sync: Real-Time Progress Sync for Folio
//!
//! This crate keeps a reader's devices in step: it authenticates device
//! connections, tracks them per user, fans reading-progress events out to
//! every live device, and buffers writes that could not be delivered or
//! persisted right away.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Service Architecture                        │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                      SyncService (facade)                        │  │
//! │  │                                                                  │  │
//! │  │  submit_progress_event · publish_progress · enqueue_deferred    │  │
//! │  └───────────┬─────────────────────┬─────────────────────┬──────────┘  │
//! │              ▼                     ▼                     ▼              │
//! │  ┌────────────────┐  ┌────────────────────┐  ┌────────────────────┐    │
//! │  │  SyncServer    │  │ BroadcastDispatcher│  │ DeferredWrite      │    │
//! │  │                │  │                    │  │ Processor          │    │
//! │  │ TCP accept,    │  │ bounded queue,     │  │                    │    │
//! │  │ admission,     │  │ single consumer,   │  │ FIFO drain every   │    │
//! │  │ heartbeats     │  │ per-user fan-out   │  │ 5s, idempotent     │    │
//! │  └───────┬────────┘  └─────────┬──────────┘  └─────────┬──────────┘    │
//! │          ▼                     │                       │               │
//! │  ┌────────────────┐            │                       ▼               │
//! │  │  AuthGate      │            │             ┌────────────────────┐    │
//! │  │  one FSM, one  │            │             │ folio-db           │    │
//! │  │  deadline      │            │             │ (WriteApplier,     │    │
//! │  └───────┬────────┘            │             │  SessionRecorder)  │    │
//! │          ▼                     ▼             └────────────────────┘    │
//! │  ┌──────────────────────────────────────┐                              │
//! │  │  ConnectionRegistry (one RwLock)     │                              │
//! │  │  conn id → Connection, user → [ids]  │                              │
//! │  └──────────────────────────────────────┘                              │
//! │                                                                         │
//! │  WIRE: one JSON envelope per line, {"type": ..., "payload": {...}}     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`codec`] - Newline-delimited JSON framing
//! - [`protocol`] - Envelope and payload types, error codes
//! - [`connection`] - One device connection with read/write deadlines
//! - [`registry`] - Live authenticated connections, indexed by user
//! - [`auth`] - JWT validation and the handshake state machine
//! - [`dispatcher`] - Progress fan-out
//! - [`deferred`] - Deferred write queue and processor
//! - [`server`] - Accept loop and the `SyncService` facade
//! - [`config`] - Sync configuration (TOML + environment)
//! - [`error`] - Sync error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use folio_db::{Database, DbConfig};
//! use folio_sync::{SyncConfig, SyncService};
//!
//! let config = SyncConfig::load(None)?;
//! let db = Database::new(DbConfig::new(&config.database.path)).await?;
//!
//! let service = SyncService::start(config, db).await?;
//! service.publish_progress(user_id, work_id, 12, None).await?;
//!
//! service.shutdown().await;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod auth;
pub mod codec;
pub mod config;
pub mod connection;
pub mod deferred;
pub mod dispatcher;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;

// =============================================================================
// Re-exports
// =============================================================================

pub use auth::{AuthError, AuthGate, Claims, GateOutcome, JwtManager, SessionRecorder, TokenValidator};
pub use codec::{EnvelopeCodec, DEFAULT_MAX_FRAME_BYTES};
pub use config::SyncConfig;
pub use connection::{Connection, ConnectionId, ConnectionTimeouts, DeviceIdentity};
pub use deferred::{DeferredWriteProcessor, DeferredWriteQueue, DrainReport, WriteApplier};
pub use dispatcher::{BroadcastDispatcher, DeliveryReport, DispatcherHandle, SubmitOutcome};
pub use error::{SyncError, SyncResult};
pub use protocol::{Envelope, ErrorCode};
pub use registry::{ConnectionRegistry, RegistryStats};
pub use server::{AdmissionControl, AdmissionSlot, PublishOutcome, SyncServer, SyncService};
