#![forbid(unsafe_code)]

// Router management: one mediasoup Router per session

use crate::media::config::RouterConfig;
use crate::media::types::{MediaError, MediaResult};
use crate::media::worker_manager::WorkerManager;
use mediasoup::prelude::*;
use mediasoup::worker::WorkerId;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use tracing::{debug, info, warn};

/// Information about a router and the worker hosting it
#[derive(Clone)]
struct RouterInfo {
    router: Router,
    worker_id: WorkerId,
}

/// Owns the `session id -> Router` map.
/// The map lock is only held for lookups and inserts, never across router creation.
pub struct RouterManager {
    routers: StdRwLock<HashMap<String, RouterInfo>>,
    worker_manager: Arc<WorkerManager>,
    config: RouterConfig,
}

impl RouterManager {
    pub fn new(worker_manager: Arc<WorkerManager>, config: RouterConfig) -> Self {
        Self {
            routers: StdRwLock::new(HashMap::new()),
            worker_manager,
            config,
        }
    }

    /// Returns the session's router, creating it on first use
    pub async fn get_or_create_router(&self, session_id: &str) -> MediaResult<Router> {
        if let Ok(router) = self.get_router(session_id) {
            return Ok(router);
        }

        let (worker, worker_id) = self.worker_manager.acquire_worker().await?;
        let router = match worker.create_router(self.config.to_router_options()).await {
            Ok(router) => router,
            Err(e) => {
                self.worker_manager.release_worker(worker_id).await;
                return Err(MediaError::RouterError(format!("Failed to create router: {e}")));
            }
        };

        // Another join may have created the router while we were waiting on the worker
        let existing = {
            let mut routers = self.routers.write().unwrap_or_else(|e| e.into_inner());
            match routers.get(session_id) {
                Some(info) => Some(info.router.clone()),
                None => {
                    routers.insert(session_id.to_string(), RouterInfo {
                        router: router.clone(),
                        worker_id,
                    });
                    None
                }
            }
        };

        if let Some(existing) = existing {
            debug!("Router for session {} created concurrently, discarding duplicate", session_id);
            self.worker_manager.release_worker(worker_id).await;
            return Ok(existing);
        }

        let session = session_id.to_string();
        router
            .on_close(move || {
                debug!("Router closed for session: {}", session);
            })
            .detach();
        let session = session_id.to_string();
        router
            .on_worker_close(move || {
                warn!("Worker closed under router of session: {}", session);
            })
            .detach();

        info!("Created router {} for session {} on worker {}", router.id(), session_id, worker_id);
        Ok(router)
    }

    /// Gets the router for a session
    pub fn get_router(&self, session_id: &str) -> MediaResult<Router> {
        let routers = self.routers.read().unwrap_or_else(|e| e.into_inner());
        routers
            .get(session_id)
            .map(|info| info.router.clone())
            .ok_or_else(|| MediaError::RouterNotFound(session_id.to_string()))
    }

    /// Removes the session's router. Dropping the last handle closes it in the worker,
    /// which in turn closes every transport still attached to it.
    pub async fn remove_router(&self, session_id: &str) -> bool {
        let removed = {
            let mut routers = self.routers.write().unwrap_or_else(|e| e.into_inner());
            routers.remove(session_id)
        };

        match removed {
            Some(info) => {
                self.worker_manager.release_worker(info.worker_id).await;
                info!("Removed router for session {} from worker {}", session_id, info.worker_id);
                true
            }
            None => false,
        }
    }

    pub fn router_count(&self) -> usize {
        self.routers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Drops all routers
    pub fn close_all(&self) {
        info!("Closing all routers");
        let mut routers = self.routers.write().unwrap_or_else(|e| e.into_inner());
        for (session_id, _info) in routers.drain() {
            debug!("Closed router for session: {}", session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::config::WorkerConfig;

    #[tokio::test]
    async fn test_router_created_once_per_session() {
        let config = WorkerConfig {
            num_workers: 1,
            ..WorkerConfig::default()
        };
        let worker_manager = Arc::new(WorkerManager::new(&config).await.unwrap());
        let router_manager = RouterManager::new(worker_manager, RouterConfig::default());

        let first = router_manager.get_or_create_router("session-1").await.unwrap();
        let second = router_manager.get_or_create_router("session-1").await.unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(router_manager.router_count(), 1);

        assert!(router_manager.remove_router("session-1").await);
        assert_eq!(router_manager.router_count(), 0);
        assert!(!router_manager.remove_router("session-1").await);
    }
}
