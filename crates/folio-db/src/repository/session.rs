//! # Sync Session Repository
//!
//! Audit rows written after a device completes the auth handshake.

use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;

use crate::error::DbResult;
use folio_core::{SessionRecord, UserId};

/// Repository for sync-session audit rows.
#[derive(Debug, Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    /// Creates a new SessionRepository.
    pub fn new(pool: SqlitePool) -> Self {
        SessionRepository { pool }
    }

    /// Records one authenticated session and returns its row id.
    pub async fn record(&self, session: &SessionRecord) -> DbResult<String> {
        let id = Uuid::new_v4().to_string();

        sqlx::query(
            r#"
            INSERT INTO sync_sessions (
                id, user_id, device_name, device_type, remote_addr,
                connected_at, authenticated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&id)
        .bind(session.user_id)
        .bind(&session.device_name)
        .bind(&session.device_type)
        .bind(&session.remote_addr)
        .bind(session.connected_at)
        .bind(session.authenticated_at)
        .execute(&self.pool)
        .await?;

        debug!(
            session_id = %id,
            user_id = session.user_id,
            device = %session.device_name,
            "Sync session recorded"
        );

        Ok(id)
    }

    /// Counts recorded sessions for a user.
    pub async fn count_for_user(&self, user_id: UserId) -> DbResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM sync_sessions WHERE user_id = ?1")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use chrono::Utc;

    fn session(user_id: UserId, device: &str) -> SessionRecord {
        let now = Utc::now();
        SessionRecord {
            user_id,
            device_name: device.to_string(),
            device_type: "tablet".to_string(),
            remote_addr: "127.0.0.1:50000".to_string(),
            connected_at: now,
            authenticated_at: now,
        }
    }

    #[tokio::test]
    async fn test_record_sessions() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let sessions = db.sessions();

        let first = sessions.record(&session(5, "Kobo")).await.unwrap();
        let second = sessions.record(&session(5, "Pixel")).await.unwrap();
        sessions.record(&session(6, "iPad")).await.unwrap();

        assert_ne!(first, second);
        assert_eq!(sessions.count_for_user(5).await.unwrap(), 2);
        assert_eq!(sessions.count_for_user(6).await.unwrap(), 1);
        assert_eq!(sessions.count_for_user(7).await.unwrap(), 0);
    }
}
