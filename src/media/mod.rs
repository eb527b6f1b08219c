#![forbid(unsafe_code)]

// Media module - the media engine adapter
// `MediaEngine` is the seam the coordinator talks to; `MediaServer` backs it with mediasoup

pub mod config;
pub mod memory;
pub mod router_manager;
pub mod transport_manager;
pub mod types;
pub mod worker_manager;

pub use config::{MediaConfig, RouterConfig, WebRtcTransportConfig, WorkerConfig};
pub use memory::MemoryEngine;
pub use router_manager::RouterManager;
pub use transport_manager::TransportManager;
pub use types::{
    ClientId, ConsumerId, ConsumerParams, EngineEvent, MediaError, MediaKind, MediaResult,
    ProducerId, ProducerMetadata, SessionId, TransportDirection, TransportId, TransportParams,
};
pub use worker_manager::WorkerManager;

use async_trait::async_trait;
use mediasoup::prelude::RtpCapabilities;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Operations the coordinator needs from the SFU.
///
/// Ids are engine-assigned strings; ICE, DTLS and RTP parameters pass through as
/// opaque JSON. Objects closed by the engine itself are reported as [`EngineEvent`]s
/// on the channel handed out when the engine is built.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Creates the session's router. Calling it again for the same session is a no-op.
    async fn create_router(&self, session_id: &str) -> MediaResult<()>;

    /// Closes the session's router together with everything still attached to it
    async fn close_router(&self, session_id: &str);

    fn rtp_capabilities(&self, session_id: &str) -> MediaResult<Value>;

    async fn create_transport(
        &self,
        session_id: &str,
        direction: TransportDirection,
    ) -> MediaResult<TransportParams>;

    async fn connect_transport(&self, transport_id: &str, dtls_parameters: Value) -> MediaResult<()>;

    /// Creates a producer; it starts paused when `metadata.paused` is set
    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
        metadata: &ProducerMetadata,
    ) -> MediaResult<ProducerId>;

    fn can_consume(&self, session_id: &str, producer_id: &str, rtp_capabilities: &Value) -> bool;

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: Value,
    ) -> MediaResult<ConsumerParams>;

    async fn pause_producer(&self, producer_id: &str) -> MediaResult<()>;
    async fn resume_producer(&self, producer_id: &str) -> MediaResult<()>;
    async fn pause_consumer(&self, consumer_id: &str) -> MediaResult<()>;
    async fn resume_consumer(&self, consumer_id: &str) -> MediaResult<()>;

    fn close_producer(&self, producer_id: &str);
    fn close_consumer(&self, consumer_id: &str);
    fn close_transport(&self, transport_id: &str);
}

/// Main MediaServer struct that coordinates all mediasoup operations
pub struct MediaServer {
    worker_manager: Arc<WorkerManager>,
    router_manager: RouterManager,
    transport_manager: TransportManager,
    config: MediaConfig,
}

impl MediaServer {
    /// Starts the worker pool. The receiver yields engine-side closures.
    pub async fn new(config: MediaConfig) -> MediaResult<(Self, mpsc::UnboundedReceiver<EngineEvent>)> {
        info!("Initializing MediaServer with {} workers", config.worker_config.num_workers);

        let worker_manager = Arc::new(WorkerManager::new(&config.worker_config).await?);
        let router_manager = RouterManager::new(worker_manager.clone(), config.router_config.clone());
        let (events, receiver) = mpsc::unbounded_channel();
        let transport_manager = TransportManager::new(events);

        Ok((
            Self {
                worker_manager,
                router_manager,
                transport_manager,
                config,
            },
            receiver,
        ))
    }

    pub fn router_count(&self) -> usize {
        self.router_manager.router_count()
    }

    /// Gracefully shuts down all workers and cleans up resources
    pub async fn shutdown(&self) {
        info!("Shutting down MediaServer");
        self.transport_manager.close_all();
        self.router_manager.close_all();
        self.worker_manager.shutdown().await;
        info!("MediaServer shutdown complete");
    }
}

#[async_trait]
impl MediaEngine for MediaServer {
    async fn create_router(&self, session_id: &str) -> MediaResult<()> {
        self.router_manager.get_or_create_router(session_id).await.map(|_| ())
    }

    async fn close_router(&self, session_id: &str) {
        debug!("Removing router for session: {}", session_id);
        self.transport_manager.close_session(session_id);
        self.router_manager.remove_router(session_id).await;
    }

    fn rtp_capabilities(&self, session_id: &str) -> MediaResult<Value> {
        let router = self.router_manager.get_router(session_id)?;
        serde_json::to_value(router.rtp_capabilities())
            .map_err(|e| MediaError::RouterError(format!("Failed to encode capabilities: {e}")))
    }

    async fn create_transport(
        &self,
        session_id: &str,
        direction: TransportDirection,
    ) -> MediaResult<TransportParams> {
        let router = self.router_manager.get_router(session_id)?;
        let options = self.config.webrtc_transport_config.to_transport_options();
        self.transport_manager
            .create_transport(session_id, direction, &router, options)
            .await
    }

    async fn connect_transport(&self, transport_id: &str, dtls_parameters: Value) -> MediaResult<()> {
        self.transport_manager.connect_transport(transport_id, dtls_parameters).await
    }

    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
        metadata: &ProducerMetadata,
    ) -> MediaResult<ProducerId> {
        self.transport_manager
            .produce(transport_id, kind, rtp_parameters, metadata)
            .await
    }

    fn can_consume(&self, session_id: &str, producer_id: &str, rtp_capabilities: &Value) -> bool {
        let Ok(router) = self.router_manager.get_router(session_id) else {
            return false;
        };
        let Some(engine_producer_id) = self.transport_manager.producer_id_in_session(session_id, producer_id) else {
            return false;
        };
        match serde_json::from_value::<RtpCapabilities>(rtp_capabilities.clone()) {
            Ok(capabilities) => router.can_consume(&engine_producer_id, &capabilities),
            Err(e) => {
                debug!("Unparseable rtpCapabilities for producer {}: {}", producer_id, e);
                false
            }
        }
    }

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: Value,
    ) -> MediaResult<ConsumerParams> {
        self.transport_manager
            .consume(transport_id, producer_id, rtp_capabilities)
            .await
    }

    async fn pause_producer(&self, producer_id: &str) -> MediaResult<()> {
        self.transport_manager.pause_producer(producer_id).await
    }

    async fn resume_producer(&self, producer_id: &str) -> MediaResult<()> {
        self.transport_manager.resume_producer(producer_id).await
    }

    async fn pause_consumer(&self, consumer_id: &str) -> MediaResult<()> {
        self.transport_manager.pause_consumer(consumer_id).await
    }

    async fn resume_consumer(&self, consumer_id: &str) -> MediaResult<()> {
        self.transport_manager.resume_consumer(consumer_id).await
    }

    fn close_producer(&self, producer_id: &str) {
        self.transport_manager.close_producer(producer_id);
    }

    fn close_consumer(&self, consumer_id: &str) {
        self.transport_manager.close_consumer(consumer_id);
    }

    fn close_transport(&self, transport_id: &str) {
        self.transport_manager.close_transport(transport_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_media_server_router_lifecycle() {
        let mut config = MediaConfig::default();
        config.worker_config.num_workers = 1;
        let (server, _events) = MediaServer::new(config).await.unwrap();

        assert!(server.rtp_capabilities("session-1").is_err());
        server.create_router("session-1").await.unwrap();
        server.create_router("session-1").await.unwrap();
        assert_eq!(server.router_count(), 1);

        let caps = server.rtp_capabilities("session-1").unwrap();
        assert!(caps["codecs"].as_array().is_some_and(|codecs| !codecs.is_empty()));

        server.close_router("session-1").await;
        assert_eq!(server.router_count(), 0);
        server.shutdown().await;
    }
}
