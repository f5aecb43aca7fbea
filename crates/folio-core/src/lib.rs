//! # folio-core: Domain Types for Folio Sync
//!
//! Pure types and validation rules for reading-progress synchronization.
//! Nothing in this crate performs I/O.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Folio Architecture                             │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │              API layer (HTTP handlers, out of tree)             │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │ publish_progress / enqueue write       │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                 folio-sync (connection server)                  │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ folio-core (THIS CRATE) ★                       │   │
//! │  │                                                                 │   │
//! │  │   ┌──────────────┐  ┌────────────────┐  ┌─────────────┐        │   │
//! │  │   │    types     │  │   validation   │  │    error    │        │   │
//! │  │   │ProgressEvent │  │ chapter/rating │  │ CoreError   │        │   │
//! │  │   │WriteOperation│  │ review length  │  │             │        │   │
//! │  │   └──────────────┘  └────────────────┘  └─────────────┘        │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    folio-db (Database Layer)                    │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Domain types (ProgressEvent, WriteOperation, etc.)
//! - [`error`] - Domain error types
//! - [`validation`] - Business rule validation
//!
//! ## Example Usage
//!
//! ```rust
//! use folio_core::{OperationKind, WriteOperation};
//! use serde_json::json;
//!
//! let op = WriteOperation::new(
//!     OperationKind::UpdateProgress,
//!     42,
//!     7,
//!     json!({ "chapter_number": 12 }).as_object().cloned().unwrap_or_default(),
//! );
//!
//! let update = op.progress_update().unwrap();
//! assert_eq!(update.chapter_number, 12);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, ValidationError};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Lowest accepted review rating.
pub const MIN_RATING: i64 = 1;

/// Highest accepted review rating.
pub const MAX_RATING: i64 = 10;

/// Minimum review body length, in characters.
pub const MIN_REVIEW_LENGTH: usize = 10;

/// Maximum review body length, in characters.
pub const MAX_REVIEW_LENGTH: usize = 5000;

/// Maximum length of a client-supplied device name or type.
pub const MAX_DEVICE_FIELD_LENGTH: usize = 100;
