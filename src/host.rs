#![forbid(unsafe_code)]

// Host election and failover.
// The persisted session record decides who holds the host seat (compare-and-set),
// the room registry decides who is alive. A hostless session is deleted after a grace period.

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::room::RoomRegistry;
use crate::session::{SessionRecord, SessionStore};
use crate::signaling::protocol::ServerMessage;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Compare-and-set rounds a single claim may take before giving up
const MAX_CLAIM_ATTEMPTS: usize = 3;

/// Pending grace timer of a session
struct ExpiryTimer {
    generation: u64,
    handle: tokio::task::JoinHandle<()>,
}

pub struct HostElection {
    store: Arc<dyn SessionStore>,
    grace: Duration,
    timers: StdMutex<HashMap<String, ExpiryTimer>>,
    generation: AtomicU64,
    expired: mpsc::UnboundedSender<String>,
}

impl HostElection {
    /// The receiver yields the id of every session deleted by a grace timer
    pub fn new(store: Arc<dyn SessionStore>, grace: Duration) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (expired, receiver) = mpsc::unbounded_channel();
        (
            Self {
                store,
                grace,
                timers: StdMutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                expired,
            },
            receiver,
        )
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Looks up the session record; a store failure is never read as "no host"
    pub async fn find_session(&self, session_id: &str) -> CoordinatorResult<SessionRecord> {
        self.store
            .find_session(session_id)
            .await?
            .ok_or_else(|| CoordinatorError::RoomNotFound(session_id.to_string()))
    }

    /// The stored host connection, if it names a live client. `Err(stale)` carries
    /// the value the compare-and-set has to expect.
    fn live_host(registry: &RoomRegistry, record: &SessionRecord) -> Result<String, Option<String>> {
        if let Some(host) = registry.host(&record.id) {
            return Ok(host);
        }
        match &record.host_conn_id {
            Some(conn) if registry.is_live_client(&record.id, conn) => Ok(conn.clone()),
            stale => Err(stale.clone()),
        }
    }

    /// Makes `client_id` host if nobody live holds the seat. The store's
    /// compare-and-set picks the single winner among concurrent claimants. A miss
    /// re-reads the record: the seat may have been freed after `record` was read.
    async fn claim(
        &self,
        registry: &RoomRegistry,
        record: &SessionRecord,
        client_id: &str,
        new_owner_user_id: &str,
    ) -> CoordinatorResult<bool> {
        let mut expected = match Self::live_host(registry, record) {
            Ok(host) => {
                debug!("Session {} already hosted by {}", record.id, host);
                return Ok(false);
            }
            Err(expected) => expected,
        };

        let mut attempts = 1;
        while !self
            .store
            .compare_and_set_host(&record.id, expected.as_deref(), new_owner_user_id, client_id)
            .await?
        {
            if attempts == MAX_CLAIM_ATTEMPTS {
                debug!("Client {} gave up on the host seat of session {}", client_id, record.id);
                return Ok(false);
            }
            attempts += 1;

            let current = self.find_session(&record.id).await?;
            expected = match Self::live_host(registry, &current) {
                Ok(host) => {
                    debug!("Client {} lost the host race for session {} to {}", client_id, record.id, host);
                    return Ok(false);
                }
                Err(expected) => expected,
            };
        }

        match registry.set_host(&record.id, client_id) {
            Ok(true) => {
                info!("Client {} (user {}) became host of session {}", client_id, new_owner_user_id, record.id);
                Ok(true)
            }
            outcome => {
                // Client left (or another host appeared) between the store update and now
                warn!("Reverting host claim of {} on session {}: {:?}", client_id, record.id, outcome.err());
                if let Err(e) = self.store.clear_host(&record.id, client_id).await {
                    error!("Failed to revert host of session {}: {}", record.id, e);
                }
                Ok(false)
            }
        }
    }

    /// Join-time claim: the session owner becomes host when the seat is free
    pub async fn claim_on_join(
        &self,
        registry: &RoomRegistry,
        record: &SessionRecord,
        client_id: &str,
        user_id: Option<&str>,
    ) -> CoordinatorResult<bool> {
        match user_id {
            Some(user) if user == record.owner_user_id => self.claim(registry, record, client_id, user).await,
            _ => Ok(false),
        }
    }

    /// `host_application`: granted only if the session has no live host
    pub async fn apply(
        &self,
        registry: &RoomRegistry,
        session_id: &str,
        client_id: &str,
        user_id: Option<&str>,
    ) -> CoordinatorResult<bool> {
        let user = user_id.ok_or_else(|| {
            CoordinatorError::Unauthorized("host application requires an authenticated user".to_string())
        })?;
        let record = self.find_session(session_id).await?;
        self.claim(registry, &record, client_id, user).await
    }

    /// Host disconnected: clear the stored seat, tell the room and start the grace timer.
    /// The registry has already dropped the host, so the room hears `host_left` even
    /// when the store cannot be reached; the timer then retries the clear.
    pub async fn release(self: &Arc<Self>, registry: &RoomRegistry, session_id: &str, client_id: &str) {
        let stale_host = match self.store.clear_host(session_id, client_id).await {
            Ok(true) => None,
            Ok(false) => {
                debug!("Host seat of session {} already moved on from {}", session_id, client_id);
                return;
            }
            Err(e) => {
                error!("Failed to clear host {} of session {}, retrying at expiry: {}", client_id, session_id, e);
                Some(client_id.to_string())
            }
        };

        info!("Host {} left session {}", client_id, session_id);
        registry.broadcast_all(session_id, &ServerMessage::HostLeft {
            conn_id: client_id.to_string(),
        });
        self.start_timer(session_id, stale_host);
    }

    /// Starts (or restarts) the grace timer of a session. If the session still has
    /// no host when it fires, the session is deleted and reported on the expiry channel.
    pub fn schedule_expiry(self: &Arc<Self>, session_id: &str) {
        self.start_timer(session_id, None);
    }

    /// `stale_host` is a departed host whose stored seat could not be cleared yet
    fn start_timer(self: &Arc<Self>, session_id: &str, stale_host: Option<String>) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let this = Arc::clone(self);
        let session = session_id.to_string();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(this.grace).await;
            this.forget_timer(&session, generation);

            if let Some(stale) = stale_host {
                if let Err(e) = this.store.clear_host(&session, &stale).await {
                    error!("Grace check for session {} could not clear host {}, keeping it: {}", session, stale, e);
                    return;
                }
            }

            match this.store.find_session(&session).await {
                Ok(Some(record)) if record.host_conn_id.is_none() => {}
                Ok(Some(record)) => {
                    debug!("Session {} has host {:?}, keeping it", session, record.host_conn_id);
                    return;
                }
                Ok(None) => return,
                Err(e) => {
                    error!("Grace check for session {} failed, keeping it: {}", session, e);
                    return;
                }
            }

            match this.store.delete_session(&session).await {
                Ok(true) => {
                    info!("Session {} deleted after host grace period", session);
                    let _ = this.expired.send(session);
                }
                Ok(false) => debug!("Session {} was already deleted", session),
                Err(e) => error!("Failed to delete session {}: {}", session, e),
            }
        });

        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = timers.insert(session_id.to_string(), ExpiryTimer { generation, handle }) {
            old.handle.abort();
        }
        debug!("Grace timer ({:?}) started for session {}", self.grace, session_id);
    }

    fn forget_timer(&self, session_id: &str, generation: u64) {
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        if timers.get(session_id).is_some_and(|t| t.generation == generation) {
            timers.remove(session_id);
        }
    }

    /// Cancels a pending grace timer. Returns true if one was pending.
    pub fn cancel_expiry(&self, session_id: &str) -> bool {
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        match timers.remove(session_id) {
            Some(timer) => {
                timer.handle.abort();
                debug!("Grace timer cancelled for session {}", session_id);
                true
            }
            None => false,
        }
    }

    pub fn has_pending_expiry(&self, session_id: &str) -> bool {
        self.timers.lock().unwrap_or_else(|e| e.into_inner()).contains_key(session_id)
    }

    /// Aborts every pending timer (shutdown)
    pub fn cancel_all(&self) {
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        for (_, timer) in timers.drain() {
            timer.handle.abort();
        }
    }
}
