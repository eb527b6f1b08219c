#![forbid(unsafe_code)]

use crate::session::{SessionRecord, SessionStore, StoreError, StoreResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;
use tracing::debug;

/// Session store kept in process memory. Used when no database is configured.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: StdMutex<HashMap<String, SessionRecord>>,
    unavailable: AtomicBool,
    deletions: AtomicUsize,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates (or replaces) a session owned by `owner_user_id` with no host
    pub fn insert(&self, session_id: &str, owner_user_id: &str) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.insert(session_id.to_string(), SessionRecord {
            id: session_id.to_string(),
            owner_user_id: owner_user_id.to_string(),
            host_conn_id: None,
        });
    }

    /// Simulates an outage: every call fails until switched back
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    /// Number of sessions removed through `delete_session`
    pub fn deletions(&self) -> usize {
        self.deletions.load(Ordering::Relaxed)
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(StoreError::Unavailable("memory store switched off".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn find_session(&self, session_id: &str) -> StoreResult<Option<SessionRecord>> {
        self.check_available()?;
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        Ok(sessions.get(session_id).cloned())
    }

    async fn compare_and_set_host(
        &self,
        session_id: &str,
        expected_conn: Option<&str>,
        new_owner_user_id: &str,
        new_conn_id: &str,
    ) -> StoreResult<bool> {
        self.check_available()?;
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        match sessions.get_mut(session_id) {
            Some(record) if record.host_conn_id.as_deref() == expected_conn => {
                record.owner_user_id = new_owner_user_id.to_string();
                record.host_conn_id = Some(new_conn_id.to_string());
                debug!("Session {} host set to {}", session_id, new_conn_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn clear_host(&self, session_id: &str, if_conn: &str) -> StoreResult<bool> {
        self.check_available()?;
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        match sessions.get_mut(session_id) {
            Some(record) if record.host_conn_id.as_deref() == Some(if_conn) => {
                record.host_conn_id = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_session(&self, session_id: &str) -> StoreResult<bool> {
        self.check_available()?;
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let removed = sessions.remove(session_id).is_some();
        if removed {
            self.deletions.fetch_add(1, Ordering::Relaxed);
        }
        Ok(removed)
    }
}
