//! # Validation Module
//!
//! Input validation for write operations and handshake fields.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: API handler (out of tree)                                    │
//! │  └── Request shape, authentication                                     │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: Deferred write processor                                     │
//! │  └── THIS MODULE: chapter numbers, ratings, review length              │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: SQLite                                                       │
//! │  ├── UNIQUE (user_id, work_id) on library / progress / reviews         │
//! │  └── CHECK constraints on rating                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use folio_core::validation::{validate_rating, validate_review_content};
//!
//! assert!(validate_rating(8).is_ok());
//! assert!(validate_rating(11).is_err());
//! assert!(validate_review_content("too short").is_err());
//! ```

use crate::error::ValidationError;
use crate::{
    MAX_DEVICE_FIELD_LENGTH, MAX_RATING, MAX_REVIEW_LENGTH, MIN_RATING, MIN_REVIEW_LENGTH,
};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// Identity Validators
// =============================================================================

/// Validates a user or work identifier.
///
/// Identifiers come from database sequences, so anything below 1 is a
/// producer bug.
pub fn validate_id(field: &str, id: i64) -> ValidationResult<()> {
    if id <= 0 {
        return Err(ValidationError::MustBePositive {
            field: field.to_string(),
        });
    }

    Ok(())
}

// =============================================================================
// Progress Validators
// =============================================================================

/// Validates a chapter number.
///
/// ## Rules
/// - Chapters are numbered from 1
pub fn validate_chapter_number(chapter: i64) -> ValidationResult<()> {
    if chapter < 1 {
        return Err(ValidationError::OutOfRange {
            field: "chapter_number".to_string(),
            min: 1,
            max: i32::MAX as i64,
        });
    }

    if chapter > i32::MAX as i64 {
        return Err(ValidationError::OutOfRange {
            field: "chapter_number".to_string(),
            min: 1,
            max: i32::MAX as i64,
        });
    }

    Ok(())
}

// =============================================================================
// Review Validators
// =============================================================================

/// Validates a review rating.
///
/// ## Rules
/// - Must be within [`MIN_RATING`, `MAX_RATING`] (1 to 10 inclusive)
///
/// ## Example
/// ```rust
/// use folio_core::validation::validate_rating;
///
/// assert!(validate_rating(1).is_ok());
/// assert!(validate_rating(10).is_ok());
/// assert!(validate_rating(0).is_err());
/// ```
pub fn validate_rating(rating: i64) -> ValidationResult<()> {
    if !(MIN_RATING..=MAX_RATING).contains(&rating) {
        return Err(ValidationError::OutOfRange {
            field: "rating".to_string(),
            min: MIN_RATING,
            max: MAX_RATING,
        });
    }

    Ok(())
}

/// Validates a review body.
///
/// ## Rules
/// - Length is measured in characters after trimming
/// - Must be between 10 and 5000 characters
pub fn validate_review_content(content: &str) -> ValidationResult<()> {
    let length = content.trim().chars().count();

    if length == 0 {
        return Err(ValidationError::Required {
            field: "content".to_string(),
        });
    }

    if length < MIN_REVIEW_LENGTH {
        return Err(ValidationError::TooShort {
            field: "content".to_string(),
            min: MIN_REVIEW_LENGTH,
        });
    }

    if length > MAX_REVIEW_LENGTH {
        return Err(ValidationError::TooLong {
            field: "content".to_string(),
            max: MAX_REVIEW_LENGTH,
        });
    }

    Ok(())
}

// =============================================================================
// Device Validators
// =============================================================================

/// Normalizes a client-supplied device field (name or type).
///
/// Empty values become `"unknown"`; overlong values are rejected.
pub fn normalize_device_field(field: &str, value: &str) -> ValidationResult<String> {
    let value = value.trim();

    if value.chars().count() > MAX_DEVICE_FIELD_LENGTH {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max: MAX_DEVICE_FIELD_LENGTH,
        });
    }

    if value.is_empty() {
        return Ok("unknown".to_string());
    }

    Ok(value.to_string())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_id() {
        assert!(validate_id("user_id", 1).is_ok());
        assert!(validate_id("user_id", 0).is_err());
        assert!(validate_id("work_id", -5).is_err());
    }

    #[test]
    fn test_validate_chapter_number() {
        assert!(validate_chapter_number(1).is_ok());
        assert!(validate_chapter_number(7).is_ok());

        assert!(validate_chapter_number(0).is_err());
        assert!(validate_chapter_number(-3).is_err());
        assert!(validate_chapter_number(i64::MAX).is_err());
    }

    #[test]
    fn test_validate_rating() {
        assert!(validate_rating(1).is_ok());
        assert!(validate_rating(5).is_ok());
        assert!(validate_rating(10).is_ok());

        assert!(validate_rating(0).is_err());
        assert!(validate_rating(11).is_err());
    }

    #[test]
    fn test_validate_review_content() {
        assert!(validate_review_content("A gripping read from start to end.").is_ok());
        assert!(validate_review_content(&"x".repeat(10)).is_ok());
        assert!(validate_review_content(&"x".repeat(5000)).is_ok());

        assert!(validate_review_content("").is_err());
        assert!(validate_review_content("   ").is_err());
        assert!(validate_review_content("too short").is_err());
        assert!(validate_review_content(&"x".repeat(5001)).is_err());
    }

    #[test]
    fn test_review_length_counts_characters() {
        // 10 multi-byte characters are a valid review even though the byte
        // length is larger.
        assert!(validate_review_content("éééééééééé").is_ok());
        assert!(validate_review_content(&"é".repeat(5000)).is_ok());
    }

    #[test]
    fn test_normalize_device_field() {
        assert_eq!(normalize_device_field("device_name", " Pixel 8 ").unwrap(), "Pixel 8");
        assert_eq!(normalize_device_field("device_type", "").unwrap(), "unknown");
        assert!(normalize_device_field("device_name", &"d".repeat(101)).is_err());
    }
}
