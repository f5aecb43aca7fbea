//! # Reading Progress Repository
//!
//! One row per `(user_id, work_id)`: the last chapter the user reached.
//!
//! ## Upsert Semantics
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  upsert(user, work, chapter, chapter_id)                               │
//! │                                                                         │
//! │  no row            ──► INSERT                        → true            │
//! │  row differs       ──► UPDATE chapter + updated_at   → true            │
//! │  row matches       ──► nothing written               → false           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::DbResult;
use folio_core::{ChapterId, UserId, WorkId};

/// A stored reading position.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ProgressRow {
    pub user_id: UserId,
    pub work_id: WorkId,
    pub chapter_number: i64,
    pub chapter_id: Option<ChapterId>,
    pub updated_at: DateTime<Utc>,
}

/// Repository for reading progress.
#[derive(Debug, Clone)]
pub struct ProgressRepository {
    pool: SqlitePool,
}

impl ProgressRepository {
    /// Creates a new ProgressRepository.
    pub fn new(pool: SqlitePool) -> Self {
        ProgressRepository { pool }
    }

    /// Returns the stored position, if any.
    pub async fn get(&self, user_id: UserId, work_id: WorkId) -> DbResult<Option<ProgressRow>> {
        let row = sqlx::query_as::<_, ProgressRow>(
            r#"
            SELECT user_id, work_id, chapter_number, chapter_id, updated_at
            FROM reading_progress
            WHERE user_id = ?1 AND work_id = ?2
            "#,
        )
        .bind(user_id)
        .bind(work_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Inserts or updates the reading position.
    ///
    /// Returns `false` when the stored position already matches, in which
    /// case `updated_at` is left untouched.
    pub async fn upsert(
        &self,
        user_id: UserId,
        work_id: WorkId,
        chapter_number: i32,
        chapter_id: Option<ChapterId>,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO reading_progress (user_id, work_id, chapter_number, chapter_id, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (user_id, work_id) DO UPDATE SET
                chapter_number = excluded.chapter_number,
                chapter_id = excluded.chapter_id,
                updated_at = excluded.updated_at
            WHERE reading_progress.chapter_number IS NOT excluded.chapter_number
               OR reading_progress.chapter_id IS NOT excluded.chapter_id
            "#,
        )
        .bind(user_id)
        .bind(work_id)
        .bind(chapter_number)
        .bind(chapter_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        let changed = result.rows_affected() > 0;
        debug!(user_id, work_id, chapter_number, changed, "Progress upserted");

        Ok(changed)
    }
}
