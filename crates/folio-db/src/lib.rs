//! # folio-db: Database Layer for Folio
//!
//! Persistence for the writes the sync engine performs: library entries,
//! reading progress, reviews and sync-session audit rows. SQLite via sqlx.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Folio Data Flow                                 │
//! │                                                                         │
//! │  Deferred write processor / Auth gate (folio-sync)                     │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     folio-db (THIS CRATE)                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌────────────────┐    ┌──────────────┐  │   │
//! │  │   │   Database    │    │  Repositories  │    │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │    │                │    │  (embedded)  │  │   │
//! │  │   │               │    │ LibraryRepo    │    │              │  │   │
//! │  │   │ SqlitePool    │◄───│ ProgressRepo   │    │ 001_initial  │  │   │
//! │  │   │               │    │ ReviewRepo     │    │              │  │   │
//! │  │   │               │    │ SessionRepo    │    │              │  │   │
//! │  │   └───────────────┘    └────────────────┘    └──────────────┘  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use folio_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("folio.db")).await?;
//! if !db.library().exists(user_id, work_id).await? {
//!     db.library().add(user_id, work_id).await?;
//! }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

pub use repository::library::LibraryRepository;
pub use repository::progress::{ProgressRepository, ProgressRow};
pub use repository::review::{ReviewRepository, ReviewRow};
pub use repository::session::SessionRepository;
