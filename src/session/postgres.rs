#![forbid(unsafe_code)]

use crate::session::{SessionRecord, SessionStore, StoreResult};
use async_trait::async_trait;
use sqlx::PgPool;
use tracing::debug;

/// Session store backed by the `sessions` table
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn find_session(&self, session_id: &str) -> StoreResult<Option<SessionRecord>> {
        let record = sqlx::query_as::<_, SessionRecord>(
            "SELECT id, owner_user_id, host_conn_id FROM sessions WHERE id = $1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn compare_and_set_host(
        &self,
        session_id: &str,
        expected_conn: Option<&str>,
        new_owner_user_id: &str,
        new_conn_id: &str,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE sessions SET owner_user_id = $3, host_conn_id = $4
             WHERE id = $1 AND host_conn_id IS NOT DISTINCT FROM $2",
        )
        .bind(session_id)
        .bind(expected_conn)
        .bind(new_owner_user_id)
        .bind(new_conn_id)
        .execute(&self.pool)
        .await?;

        debug!("compare_and_set_host({}) affected {} row(s)", session_id, result.rows_affected());
        Ok(result.rows_affected() == 1)
    }

    async fn clear_host(&self, session_id: &str, if_conn: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE sessions SET host_conn_id = NULL WHERE id = $1 AND host_conn_id = $2",
        )
        .bind(session_id)
        .bind(if_conn)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_session(&self, session_id: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}
