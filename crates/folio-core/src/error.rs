//! # Error Types
//!
//! Domain-specific error types for folio-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  folio-core errors (this file)                                         │
//! │  ├── CoreError        - Write operation / attribute errors             │
//! │  └── ValidationError  - Input validation failures                      │
//! │                                                                         │
//! │  folio-db errors (separate crate)                                      │
//! │  └── DbError          - Database operation failures                    │
//! │                                                                         │
//! │  folio-sync errors (separate crate)                                    │
//! │  └── SyncError        - Transport, protocol, auth, queue failures      │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → SyncError → log / drain report    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Errors raised while interpreting a write operation.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The attribute map lacks a field the operation kind requires.
    #[error("{kind} operation is missing attribute '{field}'")]
    MissingAttribute { kind: String, field: String },

    /// An attribute is present but has the wrong JSON type.
    #[error("Attribute '{field}' is invalid: {reason}")]
    InvalidAttribute { field: String, reason: String },

    /// Operation kind string is not one of the known kinds.
    ///
    /// ## When This Occurs
    /// - A producer built against a newer schema enqueues a kind this
    ///   build does not know
    #[error("Unknown operation type: {0}")]
    UnknownOperation(String),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too short.
    #[error("{field} must be at least {min} characters")]
    TooShort { field: String, min: usize },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Value must be positive.
    #[error("{field} must be positive")]
    MustBePositive { field: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;
