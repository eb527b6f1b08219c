#![forbid(unsafe_code)]

// Transport management for WebRTC connections.
// Engine objects are kept in id-keyed maps; ownership lives in the room registry.

use crate::media::types::{
    ConsumerParams, EngineEvent, MediaError, MediaKind, MediaResult, ProducerMetadata,
    TransportDirection, TransportParams,
};
use mediasoup::data_structures::{AppData, DtlsState};
use mediasoup::prelude::*;
use mediasoup::rtp_parameters::MediaKind as EngineKind;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock as StdRwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

struct TransportEntry {
    session_id: String,
    direction: TransportDirection,
    transport: WebRtcTransport,
}

struct ProducerEntry {
    session_id: String,
    producer: Producer,
    app_data: Value,
}

struct ConsumerEntry {
    session_id: String,
    consumer: Consumer,
}

/// Holds every live transport, producer and consumer of the engine.
///
/// Each map is protected by a std::sync::RwLock that is only held for lookups and
/// inserts. Handles are cloned out before any engine request is awaited.
pub struct TransportManager {
    transports: StdRwLock<HashMap<String, TransportEntry>>,
    producers: StdRwLock<HashMap<String, ProducerEntry>>,
    consumers: StdRwLock<HashMap<String, ConsumerEntry>>,
    events: mpsc::UnboundedSender<EngineEvent>,
}

fn parse_json<T: serde::de::DeserializeOwned>(value: Value, what: &str) -> MediaResult<T> {
    serde_json::from_value(value)
        .map_err(|e| MediaError::InvalidParameters(format!("Invalid {what}: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

pub(crate) fn engine_kind(kind: MediaKind) -> EngineKind {
    match kind {
        MediaKind::Audio => EngineKind::Audio,
        MediaKind::Video => EngineKind::Video,
    }
}

fn from_engine_kind(kind: EngineKind) -> MediaKind {
    match kind {
        EngineKind::Audio => MediaKind::Audio,
        EngineKind::Video => MediaKind::Video,
    }
}

impl TransportManager {
    pub fn new(events: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self {
            transports: StdRwLock::new(HashMap::new()),
            producers: StdRwLock::new(HashMap::new()),
            consumers: StdRwLock::new(HashMap::new()),
            events,
        }
    }

    fn get_transport(&self, transport_id: &str) -> MediaResult<(String, WebRtcTransport)> {
        let transports = self.transports.read().unwrap_or_else(|e| e.into_inner());
        transports
            .get(transport_id)
            .map(|entry| (entry.session_id.clone(), entry.transport.clone()))
            .ok_or_else(|| MediaError::ResourceNotFound(format!("transport {transport_id}")))
    }

    fn get_producer(&self, producer_id: &str) -> MediaResult<Producer> {
        let producers = self.producers.read().unwrap_or_else(|e| e.into_inner());
        producers
            .get(producer_id)
            .map(|entry| entry.producer.clone())
            .ok_or_else(|| MediaError::ResourceNotFound(format!("producer {producer_id}")))
    }

    fn get_consumer(&self, consumer_id: &str) -> MediaResult<Consumer> {
        let consumers = self.consumers.read().unwrap_or_else(|e| e.into_inner());
        consumers
            .get(consumer_id)
            .map(|entry| entry.consumer.clone())
            .ok_or_else(|| MediaError::ResourceNotFound(format!("consumer {consumer_id}")))
    }

    /// Creates a WebRTC transport on the session's router
    pub async fn create_transport(
        &self,
        session_id: &str,
        direction: TransportDirection,
        router: &Router,
        options: WebRtcTransportOptions,
    ) -> MediaResult<TransportParams> {
        debug!("Creating {:?} transport for session: {}", direction, session_id);

        let transport = router
            .create_webrtc_transport(options)
            .await
            .map_err(|e| MediaError::TransportError(format!("Failed to create transport: {e}")))?;

        let params = TransportParams {
            id: transport.id().to_string(),
            ice_parameters: to_json(transport.ice_parameters()),
            ice_candidates: to_json(transport.ice_candidates()),
            dtls_parameters: to_json(&transport.dtls_parameters()),
        };
        self.setup_transport_handlers(&transport, session_id);

        let mut transports = self.transports.write().unwrap_or_else(|e| e.into_inner());
        transports.insert(params.id.clone(), TransportEntry {
            session_id: session_id.to_string(),
            direction,
            transport,
        });

        info!("Created {:?} transport {} in session {}", direction, params.id, session_id);
        Ok(params)
    }

    pub async fn connect_transport(&self, transport_id: &str, dtls_parameters: Value) -> MediaResult<()> {
        let dtls_parameters: DtlsParameters = parse_json(dtls_parameters, "dtlsParameters")?;
        let (_, transport) = self.get_transport(transport_id)?;

        transport
            .connect(WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(|e| MediaError::TransportError(format!("Failed to connect transport: {e}")))?;

        info!("Connected transport {}", transport_id);
        Ok(())
    }

    /// Creates a producer on a send transport. The producer starts paused.
    pub async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
        metadata: &ProducerMetadata,
    ) -> MediaResult<String> {
        let rtp_parameters: RtpParameters = parse_json(rtp_parameters, "rtpParameters")?;
        let (session_id, transport) = self.get_transport(transport_id)?;

        let app_data = metadata.to_app_data();
        let mut producer_options = ProducerOptions::new(engine_kind(kind), rtp_parameters);
        producer_options.paused = metadata.paused;
        producer_options.app_data = AppData::new(metadata.clone());

        let producer = transport
            .produce(producer_options)
            .await
            .map_err(|e| MediaError::ProducerError(format!("Failed to create producer: {e}")))?;

        let producer_id = producer.id().to_string();
        self.setup_producer_handlers(&producer, &session_id);

        let mut producers = self.producers.write().unwrap_or_else(|e| e.into_inner());
        producers.insert(producer_id.clone(), ProducerEntry {
            session_id,
            producer,
            app_data,
        });

        info!("Created {:?} producer {} on transport {}", kind, producer_id, transport_id);
        Ok(producer_id)
    }

    /// Creates a consumer of `producer_id` on a receive transport
    pub async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: Value,
    ) -> MediaResult<ConsumerParams> {
        let rtp_capabilities: RtpCapabilities = parse_json(rtp_capabilities, "rtpCapabilities")?;
        let engine_producer_id: ProducerId = producer_id
            .parse()
            .map_err(|_| MediaError::InvalidParameters(format!("Invalid producer id: {producer_id}")))?;
        let (session_id, transport) = self.get_transport(transport_id)?;

        let app_data = {
            let producers = self.producers.read().unwrap_or_else(|e| e.into_inner());
            producers
                .get(producer_id)
                .map(|entry| entry.app_data.clone())
                .ok_or_else(|| MediaError::ResourceNotFound(format!("producer {producer_id}")))?
        };

        let consumer = transport
            .consume(ConsumerOptions::new(engine_producer_id, rtp_capabilities))
            .await
            .map_err(|e| MediaError::ConsumerError(format!("Failed to create consumer: {e}")))?;

        let params = ConsumerParams {
            id: consumer.id().to_string(),
            producer_id: producer_id.to_string(),
            kind: from_engine_kind(consumer.kind()),
            rtp_parameters: to_json(consumer.rtp_parameters()),
            app_data,
        };
        self.setup_consumer_handlers(&consumer, &session_id);

        let mut consumers = self.consumers.write().unwrap_or_else(|e| e.into_inner());
        consumers.insert(params.id.clone(), ConsumerEntry { session_id, consumer });

        info!("Created consumer {} for producer {} on transport {}", params.id, producer_id, transport_id);
        Ok(params)
    }

    pub async fn pause_producer(&self, producer_id: &str) -> MediaResult<()> {
        let producer = self.get_producer(producer_id)?;
        producer
            .pause()
            .await
            .map_err(|e| MediaError::ProducerError(format!("Failed to pause producer: {e}")))?;
        self.set_app_data_paused(producer_id, true);
        info!("Paused producer {}", producer_id);
        Ok(())
    }

    pub async fn resume_producer(&self, producer_id: &str) -> MediaResult<()> {
        let producer = self.get_producer(producer_id)?;
        producer
            .resume()
            .await
            .map_err(|e| MediaError::ProducerError(format!("Failed to resume producer: {e}")))?;
        self.set_app_data_paused(producer_id, false);
        info!("Resumed producer {}", producer_id);
        Ok(())
    }

    fn set_app_data_paused(&self, producer_id: &str, paused: bool) {
        let mut producers = self.producers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(Value::Object(map)) = producers.get_mut(producer_id).map(|entry| &mut entry.app_data) {
            map.insert("paused".to_string(), Value::Bool(paused));
        }
    }

    pub async fn pause_consumer(&self, consumer_id: &str) -> MediaResult<()> {
        let consumer = self.get_consumer(consumer_id)?;
        consumer
            .pause()
            .await
            .map_err(|e| MediaError::ConsumerError(format!("Failed to pause consumer: {e}")))?;
        info!("Paused consumer {}", consumer_id);
        Ok(())
    }

    pub async fn resume_consumer(&self, consumer_id: &str) -> MediaResult<()> {
        let consumer = self.get_consumer(consumer_id)?;
        consumer
            .resume()
            .await
            .map_err(|e| MediaError::ConsumerError(format!("Failed to resume consumer: {e}")))?;
        info!("Resumed consumer {}", consumer_id);
        Ok(())
    }

    /// Engine id of a live producer of the session, for the router's compatibility check
    pub fn producer_id_in_session(&self, session_id: &str, producer_id: &str) -> Option<ProducerId> {
        let producers = self.producers.read().unwrap_or_else(|e| e.into_inner());
        producers
            .get(producer_id)
            .filter(|entry| entry.session_id == session_id)
            .map(|entry| entry.producer.id())
    }

    // Dropping the last handle of an engine object closes it in the worker

    pub fn close_producer(&self, producer_id: &str) -> bool {
        let removed = self.producers.write().unwrap_or_else(|e| e.into_inner()).remove(producer_id);
        if removed.is_some() {
            debug!("Closed producer {}", producer_id);
        }
        removed.is_some()
    }

    pub fn close_consumer(&self, consumer_id: &str) -> bool {
        let removed = self.consumers.write().unwrap_or_else(|e| e.into_inner()).remove(consumer_id);
        if removed.is_some() {
            debug!("Closed consumer {}", consumer_id);
        }
        removed.is_some()
    }

    pub fn close_transport(&self, transport_id: &str) -> bool {
        let removed = self.transports.write().unwrap_or_else(|e| e.into_inner()).remove(transport_id);
        match removed {
            Some(entry) => {
                debug!("Closed {:?} transport {} of session {}", entry.direction, transport_id, entry.session_id);
                true
            }
            None => false,
        }
    }

    /// Forgets every object belonging to a session (its router is going away)
    pub fn close_session(&self, session_id: &str) {
        self.consumers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, entry| entry.session_id != session_id);
        self.producers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, entry| entry.session_id != session_id);
        self.transports
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, entry| entry.session_id != session_id);
    }

    /// Sets up event handlers for a transport.
    /// Handlers are detached so they persist for the transport's lifetime.
    fn setup_transport_handlers(&self, transport: &WebRtcTransport, session_id: &str) {
        let transport_id = transport.id().to_string();

        transport
            .on_dtls_state_change({
                let events = self.events.clone();
                let session_id = session_id.to_string();
                let transport_id = transport_id.clone();
                move |dtls_state| {
                    debug!("DTLS state: {:?} for transport {}", dtls_state, transport_id);
                    if matches!(dtls_state, DtlsState::Closed | DtlsState::Failed) {
                        let _ = events.send(EngineEvent::TransportClosed {
                            session_id: session_id.clone(),
                            transport_id: transport_id.clone(),
                        });
                    }
                }
            })
            .detach();

        transport
            .on_router_close({
                let events = self.events.clone();
                let session_id = session_id.to_string();
                let transport_id = transport_id.clone();
                Box::new(move || {
                    warn!("Router closed under transport {}", transport_id);
                    let _ = events.send(EngineEvent::TransportClosed { session_id, transport_id });
                })
            })
            .detach();

        transport
            .on_ice_state_change(move |ice_state| {
                debug!("ICE state: {:?} for transport {}", ice_state, transport_id);
            })
            .detach();
    }

    fn setup_producer_handlers(&self, producer: &Producer, session_id: &str) {
        let events = self.events.clone();
        let session_id = session_id.to_string();
        let producer_id = producer.id().to_string();

        producer
            .on_transport_close(move || {
                debug!("Transport closed under producer {}", producer_id);
                let _ = events.send(EngineEvent::ProducerClosed { session_id, producer_id });
            })
            .detach();
    }

    fn setup_consumer_handlers(&self, consumer: &Consumer, session_id: &str) {
        let consumer_id = consumer.id().to_string();

        consumer
            .on_producer_close({
                let events = self.events.clone();
                let session_id = session_id.to_string();
                let consumer_id = consumer_id.clone();
                move || {
                    debug!("Producer closed under consumer {}", consumer_id);
                    let _ = events.send(EngineEvent::ConsumerClosed { session_id, consumer_id });
                }
            })
            .detach();

        consumer
            .on_transport_close({
                let events = self.events.clone();
                let session_id = session_id.to_string();
                move || {
                    debug!("Transport closed under consumer {}", consumer_id);
                    let _ = events.send(EngineEvent::ConsumerClosed { session_id, consumer_id });
                }
            })
            .detach();
    }

    pub fn transport_count(&self) -> usize {
        self.transports.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Drops every engine object, consumers and producers before transports
    pub fn close_all(&self) {
        info!("Closing all transports");
        self.consumers.write().unwrap_or_else(|e| e.into_inner()).clear();
        self.producers.write().unwrap_or_else(|e| e.into_inner()).clear();
        self.transports.write().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::config::{RouterConfig, WebRtcTransportConfig, WorkerConfig};
    use crate::media::router_manager::RouterManager;
    use crate::media::worker_manager::WorkerManager;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_transport_creation_and_close() {
        let config = WorkerConfig {
            num_workers: 1,
            ..WorkerConfig::default()
        };
        let worker_manager = Arc::new(WorkerManager::new(&config).await.unwrap());
        let router_manager = RouterManager::new(worker_manager, RouterConfig::default());
        let (events, _rx) = mpsc::unbounded_channel();
        let transport_manager = TransportManager::new(events);

        let router = router_manager.get_or_create_router("test-session").await.unwrap();
        let options = WebRtcTransportConfig::default().to_transport_options();

        let params = transport_manager
            .create_transport("test-session", TransportDirection::Send, &router, options)
            .await
            .unwrap();
        assert!(params.ice_parameters.get("usernameFragment").is_some());
        assert!(params.dtls_parameters.get("fingerprints").is_some());
        assert_eq!(transport_manager.transport_count(), 1);

        let result = transport_manager
            .connect_transport(&params.id, json!({ "role": "nonsense" }))
            .await;
        assert!(matches!(result, Err(MediaError::InvalidParameters(_))));

        assert!(transport_manager.close_transport(&params.id));
        assert!(!transport_manager.close_transport(&params.id));
    }
}
