//! # Library Repository
//!
//! Works a user has added to their library. A `(user_id, work_id)` pair
//! appears at most once.

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::DbResult;
use folio_core::{UserId, WorkId};

/// Repository for library entries.
#[derive(Debug, Clone)]
pub struct LibraryRepository {
    pool: SqlitePool,
}

impl LibraryRepository {
    /// Creates a new LibraryRepository.
    pub fn new(pool: SqlitePool) -> Self {
        LibraryRepository { pool }
    }

    /// Returns true if the work is already in the user's library.
    pub async fn exists(&self, user_id: UserId, work_id: WorkId) -> DbResult<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM library_entries WHERE user_id = ?1 AND work_id = ?2",
        )
        .bind(user_id)
        .bind(work_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(found.is_some())
    }

    /// Adds a work to the user's library.
    ///
    /// ## Returns
    /// * `true` - A new entry was inserted
    /// * `false` - The entry already existed (nothing changed)
    pub async fn add(&self, user_id: UserId, work_id: WorkId) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO library_entries (user_id, work_id, added_at)
            VALUES (?1, ?2, ?3)
            "#,
        )
        .bind(user_id)
        .bind(work_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        let inserted = result.rows_affected() > 0;
        debug!(user_id, work_id, inserted, "Library entry written");

        Ok(inserted)
    }

    /// Counts the works in a user's library.
    pub async fn count_for_user(&self, user_id: UserId) -> DbResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM library_entries WHERE user_id = ?1")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }
}
