//! # Domain Types
//!
//! Core domain types used throughout Folio.
//!
//! ## Type Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌──────────────────┐   ┌─────────────────┐      │
//! │  │  ProgressEvent  │   │  WriteOperation  │   │  SessionRecord  │      │
//! │  │  ─────────────  │   │  ──────────────  │   │  ─────────────  │      │
//! │  │  user_id        │   │  id (UUID)       │   │  user_id        │      │
//! │  │  work_id        │   │  kind            │   │  device_name    │      │
//! │  │  chapter        │   │  user_id         │   │  device_type    │      │
//! │  │  chapter_id?    │   │  work_id         │   │  remote_addr    │      │
//! │  │  timestamp      │   │  attributes{}    │   │  connected_at   │      │
//! │  └─────────────────┘   └──────────────────┘   └─────────────────┘      │
//! │                                                                         │
//! │  ProgressEvent is transient (consumed once by the dispatcher).         │
//! │  WriteOperation is consumed once by the deferred processor.            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::validation::{validate_chapter_number, validate_rating, validate_review_content};

// =============================================================================
// Identifiers
// =============================================================================

/// Database identity of a user.
pub type UserId = i64;

/// Database identity of a work (book, serial, comic).
pub type WorkId = i64;

/// Database identity of a single chapter.
pub type ChapterId = i64;

/// Kind-specific fields of a write operation.
pub type Attributes = Map<String, Value>;

// =============================================================================
// Progress Event
// =============================================================================

/// A reading-progress change to fan out to a user's devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub user_id: UserId,
    pub work_id: WorkId,
    pub chapter: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter_id: Option<ChapterId>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    /// Creates an event stamped with the current time.
    pub fn new(
        user_id: UserId,
        work_id: WorkId,
        chapter: i32,
        chapter_id: Option<ChapterId>,
    ) -> Self {
        ProgressEvent {
            user_id,
            work_id,
            chapter,
            chapter_id,
            timestamp: Utc::now(),
        }
    }
}

// =============================================================================
// Operation Kind
// =============================================================================

/// The fixed set of deferred write operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Add a work to the user's library.
    AddToLibrary,

    /// Persist the user's reading position in a work.
    UpdateProgress,

    /// Create the user's review of a work.
    CreateReview,

    /// Re-attempt real-time delivery of a progress event.
    BroadcastProgress,
}

impl OperationKind {
    /// Returns the wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::AddToLibrary => "add_to_library",
            OperationKind::UpdateProgress => "update_progress",
            OperationKind::CreateReview => "create_review",
            OperationKind::BroadcastProgress => "broadcast_progress",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OperationKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "add_to_library" | "library_insert" => Ok(OperationKind::AddToLibrary),
            "update_progress" | "progress_update" => Ok(OperationKind::UpdateProgress),
            "create_review" | "review_create" => Ok(OperationKind::CreateReview),
            "broadcast_progress" => Ok(OperationKind::BroadcastProgress),
            other => Err(CoreError::UnknownOperation(other.to_string())),
        }
    }
}

// =============================================================================
// Write Operation
// =============================================================================

/// A write queued for asynchronous application.
///
/// The attribute map stays open so producers can attach kind-specific
/// fields; the typed accessors below validate them on the way out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteOperation {
    /// Unique identifier, used only for logging.
    pub id: Uuid,

    /// What the operation does.
    pub kind: OperationKind,

    /// Target user.
    pub user_id: UserId,

    /// Target work.
    pub work_id: WorkId,

    /// Kind-specific fields (chapter_number, chapter_id, rating, content).
    #[serde(default)]
    pub attributes: Attributes,

    /// When the operation entered the queue.
    pub enqueued_at: DateTime<Utc>,
}

/// Validated fields of an `update_progress` / `broadcast_progress` operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub chapter_number: i32,
    pub chapter_id: Option<ChapterId>,
}

/// Validated fields of a `create_review` operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReview {
    pub rating: i64,
    pub content: String,
}

impl WriteOperation {
    /// Creates an operation stamped with a fresh id and the current time.
    pub fn new(kind: OperationKind, user_id: UserId, work_id: WorkId, attributes: Attributes) -> Self {
        WriteOperation {
            id: Uuid::new_v4(),
            kind,
            user_id,
            work_id,
            attributes,
            enqueued_at: Utc::now(),
        }
    }

    /// Extracts and validates the chapter position carried by this operation.
    pub fn progress_update(&self) -> CoreResult<ProgressUpdate> {
        let chapter = self.required_i64("chapter_number")?;
        validate_chapter_number(chapter)?;

        Ok(ProgressUpdate {
            chapter_number: chapter as i32,
            chapter_id: self.optional_i64("chapter_id")?,
        })
    }

    /// Extracts and validates the review carried by this operation.
    pub fn new_review(&self) -> CoreResult<NewReview> {
        let rating = self.required_i64("rating")?;
        validate_rating(rating)?;

        let content = match self.attributes.get("content") {
            Some(Value::String(s)) => s.trim().to_string(),
            Some(_) => {
                return Err(CoreError::InvalidAttribute {
                    field: "content".to_string(),
                    reason: "expected a string".to_string(),
                })
            }
            None => {
                return Err(CoreError::MissingAttribute {
                    kind: self.kind.to_string(),
                    field: "content".to_string(),
                })
            }
        };
        validate_review_content(&content)?;

        Ok(NewReview { rating, content })
    }

    fn required_i64(&self, field: &str) -> CoreResult<i64> {
        self.optional_i64(field)?
            .ok_or_else(|| CoreError::MissingAttribute {
                kind: self.kind.to_string(),
                field: field.to_string(),
            })
    }

    fn optional_i64(&self, field: &str) -> CoreResult<Option<i64>> {
        match self.attributes.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n.as_i64().map(Some).ok_or_else(|| {
                CoreError::InvalidAttribute {
                    field: field.to_string(),
                    reason: "expected an integer".to_string(),
                }
            }),
            // Some producers send numbers as strings.
            Some(Value::String(s)) => s.trim().parse::<i64>().map(Some).map_err(|_| {
                CoreError::InvalidAttribute {
                    field: field.to_string(),
                    reason: format!("'{}' is not an integer", s),
                }
            }),
            Some(_) => Err(CoreError::InvalidAttribute {
                field: field.to_string(),
                reason: "expected an integer".to_string(),
            }),
        }
    }
}

// =============================================================================
// Sync Session
// =============================================================================

/// Audit record written when a device completes the auth handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub user_id: UserId,
    pub device_name: String,
    pub device_type: String,
    pub remote_addr: String,
    pub connected_at: DateTime<Utc>,
    pub authenticated_at: DateTime<Utc>,
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(value: Value) -> Attributes {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_operation_kind_parsing() {
        assert_eq!("add_to_library".parse::<OperationKind>().unwrap(), OperationKind::AddToLibrary);
        assert_eq!("UPDATE_PROGRESS".parse::<OperationKind>().unwrap(), OperationKind::UpdateProgress);
        assert_eq!("create_review".parse::<OperationKind>().unwrap(), OperationKind::CreateReview);
        assert_eq!(
            "broadcast_progress".parse::<OperationKind>().unwrap(),
            OperationKind::BroadcastProgress
        );
        assert!(matches!(
            "rate_work".parse::<OperationKind>(),
            Err(CoreError::UnknownOperation(_))
        ));
    }

    #[test]
    fn test_operation_kind_serde_names() {
        let json = serde_json::to_string(&OperationKind::CreateReview).unwrap();
        assert_eq!(json, "\"create_review\"");
    }

    #[test]
    fn test_progress_update_extraction() {
        let op = WriteOperation::new(
            OperationKind::UpdateProgress,
            1,
            2,
            attrs(json!({ "chapter_number": 7, "chapter_id": 700 })),
        );
        let update = op.progress_update().unwrap();
        assert_eq!(update.chapter_number, 7);
        assert_eq!(update.chapter_id, Some(700));
    }

    #[test]
    fn test_progress_update_accepts_string_numbers() {
        let op = WriteOperation::new(
            OperationKind::UpdateProgress,
            1,
            2,
            attrs(json!({ "chapter_number": "3" })),
        );
        assert_eq!(op.progress_update().unwrap().chapter_number, 3);
    }

    #[test]
    fn test_progress_update_rejects_bad_chapter() {
        let missing = WriteOperation::new(OperationKind::UpdateProgress, 1, 2, Attributes::new());
        assert!(matches!(
            missing.progress_update(),
            Err(CoreError::MissingAttribute { .. })
        ));

        let zero = WriteOperation::new(
            OperationKind::UpdateProgress,
            1,
            2,
            attrs(json!({ "chapter_number": 0 })),
        );
        assert!(matches!(zero.progress_update(), Err(CoreError::Validation(_))));

        let wrong_type = WriteOperation::new(
            OperationKind::UpdateProgress,
            1,
            2,
            attrs(json!({ "chapter_number": [1] })),
        );
        assert!(matches!(
            wrong_type.progress_update(),
            Err(CoreError::InvalidAttribute { .. })
        ));
    }

    #[test]
    fn test_new_review_extraction() {
        let op = WriteOperation::new(
            OperationKind::CreateReview,
            1,
            2,
            attrs(json!({ "rating": 9, "content": "  Loved every chapter of it.  " })),
        );
        let review = op.new_review().unwrap();
        assert_eq!(review.rating, 9);
        assert_eq!(review.content, "Loved every chapter of it.");
    }

    #[test]
    fn test_new_review_rejects_rating_out_of_range() {
        let op = WriteOperation::new(
            OperationKind::CreateReview,
            1,
            2,
            attrs(json!({ "rating": 11, "content": "Long enough review body." })),
        );
        assert!(matches!(op.new_review(), Err(CoreError::Validation(_))));
    }

    #[test]
    fn test_write_operation_json_shape() {
        let op = WriteOperation::new(
            OperationKind::AddToLibrary,
            5,
            9,
            Attributes::new(),
        );
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["kind"], "add_to_library");
        assert_eq!(value["user_id"], 5);
        assert_eq!(value["work_id"], 9);
    }
}
