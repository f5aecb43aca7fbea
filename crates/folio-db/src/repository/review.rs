//! # Review Repository
//!
//! A user reviews a work at most once. The existence check runs before the
//! insert; the UNIQUE index catches concurrent writers that race past it.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::DbResult;
use folio_core::{UserId, WorkId};

/// A stored review.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ReviewRow {
    pub id: i64,
    pub user_id: UserId,
    pub work_id: WorkId,
    pub rating: i64,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Repository for reviews.
#[derive(Debug, Clone)]
pub struct ReviewRepository {
    pool: SqlitePool,
}

impl ReviewRepository {
    /// Creates a new ReviewRepository.
    pub fn new(pool: SqlitePool) -> Self {
        ReviewRepository { pool }
    }

    /// Returns true if the user already reviewed the work.
    pub async fn exists_for(&self, user_id: UserId, work_id: WorkId) -> DbResult<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM reviews WHERE user_id = ?1 AND work_id = ?2")
                .bind(user_id)
                .bind(work_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(found.is_some())
    }

    /// Inserts a review and returns the stored row.
    ///
    /// ## Errors
    /// * `DbError::UniqueViolation` - A review for this pair already exists
    /// * `DbError::CheckViolation` - Rating outside 1..=10
    pub async fn create(
        &self,
        user_id: UserId,
        work_id: WorkId,
        rating: i64,
        content: &str,
    ) -> DbResult<ReviewRow> {
        let row = sqlx::query_as::<_, ReviewRow>(
            r#"
            INSERT INTO reviews (user_id, work_id, rating, content, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            RETURNING id, user_id, work_id, rating, content, created_at
            "#,
        )
        .bind(user_id)
        .bind(work_id)
        .bind(rating)
        .bind(content)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        debug!(review_id = row.id, user_id, work_id, rating, "Review created");

        Ok(row)
    }

    /// Counts the reviews of a work.
    pub async fn count_for_work(&self, work_id: WorkId) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM reviews WHERE work_id = ?1")
            .bind(work_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use crate::{Database, DbConfig, DbError};

    #[tokio::test]
    async fn test_create_and_exists() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let reviews = db.reviews();

        assert!(!reviews.exists_for(3, 9).await.unwrap());

        let row = reviews
            .create(3, 9, 8, "Slow start, brilliant final act.")
            .await
            .unwrap();
        assert_eq!(row.rating, 8);
        assert_eq!(row.user_id, 3);

        assert!(reviews.exists_for(3, 9).await.unwrap());
        assert_eq!(reviews.count_for_work(9).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_review_is_unique_violation() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let reviews = db.reviews();

        reviews.create(3, 9, 8, "First take on this one.").await.unwrap();
        let err = reviews
            .create(3, 9, 2, "Changed my mind entirely.")
            .await
            .unwrap_err();

        assert!(matches!(err, DbError::UniqueViolation { .. }));
        assert_eq!(reviews.count_for_work(9).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rating_check_constraint() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();

        let err = db
            .reviews()
            .create(3, 9, 11, "Out of range rating here.")
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::CheckViolation(_)));
    }
}
