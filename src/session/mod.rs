#![forbid(unsafe_code)]

// Session module - persisted session ownership records
// The store's conditional update is the single arbiter of who holds the host seat.

pub mod memory;
pub mod postgres;

pub use memory::MemorySessionStore;
pub use postgres::PgSessionStore;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persisted ownership record of a session
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct SessionRecord {
    pub id: String,
    pub owner_user_id: String,
    /// Connection id of the current host, if any
    pub host_conn_id: Option<String>,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn find_session(&self, session_id: &str) -> StoreResult<Option<SessionRecord>>;

    /// Sets owner and host connection iff the stored host connection equals `expected_conn`.
    /// Returns whether the update was applied.
    async fn compare_and_set_host(
        &self,
        session_id: &str,
        expected_conn: Option<&str>,
        new_owner_user_id: &str,
        new_conn_id: &str,
    ) -> StoreResult<bool>;

    /// Clears the host connection iff it is still `if_conn`
    async fn clear_host(&self, session_id: &str, if_conn: &str) -> StoreResult<bool>;

    async fn delete_session(&self, session_id: &str) -> StoreResult<bool>;
}
