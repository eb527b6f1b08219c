#![forbid(unsafe_code)]

// Worker pool management for mediasoup

use crate::media::config::WorkerConfig;
use crate::media::types::{MediaError, MediaResult};
use mediasoup::prelude::*;
use mediasoup::worker::WorkerId;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

/// Manages a pool of mediasoup Workers.
/// Routers are spread across workers by router count.
pub struct WorkerManager {
    workers: RwLock<Vec<Worker>>,
    router_load: RwLock<HashMap<WorkerId, usize>>,
    // Keeps the worker threads' manager alive for the pool's lifetime
    _manager: mediasoup::worker_manager::WorkerManager,
}

impl WorkerManager {
    /// Creates a new `WorkerManager` with `config.num_workers` workers
    ///
    /// # Errors
    /// Returns `MediaError::WorkerError` if any worker fails to start
    pub async fn new(config: &WorkerConfig) -> MediaResult<Self> {
        let num_workers = config.num_workers.max(1);
        info!("Creating WorkerManager with {} workers", num_workers);

        let manager = mediasoup::worker_manager::WorkerManager::new();
        let mut workers = Vec::with_capacity(num_workers);
        let mut router_load = HashMap::new();

        for index in 0..num_workers {
            let worker = manager
                .create_worker(config.to_worker_settings())
                .await
                .map_err(|e| MediaError::WorkerError(format!("Failed to create worker: {e}")))?;
            let worker_id = worker.id();
            info!("Created worker {} with id: {}", index, worker_id);

            worker
                .on_dead(move |reason| {
                    error!("Worker {} (index {}) died: {:?}", worker_id, index, reason);
                })
                .detach();

            router_load.insert(worker_id, 0);
            workers.push(worker);
        }

        Ok(Self {
            workers: RwLock::new(workers),
            router_load: RwLock::new(router_load),
            _manager: manager,
        })
    }

    /// Picks the live worker hosting the fewest routers and counts one more router on it
    ///
    /// # Errors
    /// Returns `MediaError::WorkerError` if no live worker is available
    pub async fn acquire_worker(&self) -> MediaResult<(Worker, WorkerId)> {
        let workers = self.workers.read().await;
        let mut load = self.router_load.write().await;

        let worker = workers
            .iter()
            .filter(|w| !w.closed())
            .min_by_key(|w| load.get(&w.id()).copied().unwrap_or(0))
            .cloned()
            .ok_or_else(|| MediaError::WorkerError("No workers available".to_string()))?;

        let worker_id = worker.id();
        let count = load.entry(worker_id).or_insert(0);
        *count += 1;

        debug!("Selected worker {} ({} routers)", worker_id, *count);
        Ok((worker, worker_id))
    }

    /// Decrements the router count for a worker (called when a router is closed)
    pub async fn release_worker(&self, worker_id: WorkerId) {
        let mut load = self.router_load.write().await;
        if let Some(count) = load.get_mut(&worker_id) {
            *count = count.saturating_sub(1);
            debug!("Decremented load for worker {} to {}", worker_id, *count);
        }
    }

    /// Number of workers still running
    pub async fn live_workers(&self) -> usize {
        self.workers.read().await.iter().filter(|w| !w.closed()).count()
    }

    /// Drops every worker; mediasoup closes a worker when its last handle goes away
    pub async fn shutdown(&self) {
        info!("Shutting down all workers");
        self.workers.write().await.clear();
        self.router_load.write().await.clear();
    }
}
