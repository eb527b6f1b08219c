#![forbid(unsafe_code)]

// In-process media engine. Keeps the same object model as the mediasoup adapter
// without moving any media; used by tests and for running the signaling plane alone.

use crate::media::types::{
    ConsumerParams, EngineEvent, MediaError, MediaKind, MediaResult, ProducerMetadata,
    TransportDirection, TransportParams,
};
use crate::media::MediaEngine;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

struct MemTransport {
    session_id: String,
    direction: TransportDirection,
    connected: bool,
}

struct MemProducer {
    session_id: String,
    transport_id: String,
    kind: MediaKind,
    paused: bool,
    app_data: Value,
}

struct MemConsumer {
    transport_id: String,
    producer_id: String,
    paused: bool,
}

#[derive(Default)]
struct EngineState {
    routers: HashSet<String>,
    transports: HashMap<String, MemTransport>,
    producers: HashMap<String, MemProducer>,
    consumers: HashMap<String, MemConsumer>,
}

pub struct MemoryEngine {
    state: StdMutex<EngineState>,
    events: mpsc::UnboundedSender<EngineEvent>,
    fail_produce: AtomicBool,
}

fn codec_capabilities() -> Value {
    json!({
        "codecs": [
            { "kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2 },
            { "kind": "video", "mimeType": "video/VP8", "clockRate": 90000 }
        ],
        "headerExtensions": []
    })
}

fn supports_kind(rtp_capabilities: &Value, kind: MediaKind) -> bool {
    rtp_capabilities
        .get("codecs")
        .and_then(Value::as_array)
        .is_some_and(|codecs| {
            codecs
                .iter()
                .any(|codec| codec.get("kind").and_then(Value::as_str) == Some(kind.as_str()))
        })
}

impl MemoryEngine {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        (
            Self {
                state: StdMutex::new(EngineState::default()),
                events,
                fail_produce: AtomicBool::new(false),
            },
            receiver,
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Makes every following `produce` fail as if the engine rejected it
    pub fn set_fail_produce(&self, fail: bool) {
        self.fail_produce.store(fail, Ordering::Relaxed);
    }

    pub fn router_count(&self) -> usize {
        self.lock().routers.len()
    }

    pub fn transport_count(&self) -> usize {
        self.lock().transports.len()
    }

    pub fn producer_count(&self) -> usize {
        self.lock().producers.len()
    }

    pub fn consumer_count(&self) -> usize {
        self.lock().consumers.len()
    }

    pub fn has_transport(&self, transport_id: &str) -> bool {
        self.lock().transports.contains_key(transport_id)
    }

    pub fn has_producer(&self, producer_id: &str) -> bool {
        self.lock().producers.contains_key(producer_id)
    }

    pub fn is_producer_paused(&self, producer_id: &str) -> Option<bool> {
        self.lock().producers.get(producer_id).map(|p| p.paused)
    }

    pub fn is_consumer_paused(&self, consumer_id: &str) -> Option<bool> {
        self.lock().consumers.get(consumer_id).map(|c| c.paused)
    }

    /// Closes a transport the way a failed DTLS session would, emitting the
    /// same events the mediasoup adapter does for it and for everything under it.
    pub fn close_transport_externally(&self, transport_id: &str) {
        let mut state = self.lock();
        let Some(transport) = state.transports.remove(transport_id) else {
            return;
        };
        let session_id = transport.session_id;
        let _ = self.events.send(EngineEvent::TransportClosed {
            session_id: session_id.clone(),
            transport_id: transport_id.to_string(),
        });

        let producer_ids: Vec<String> = state
            .producers
            .iter()
            .filter(|(_, p)| p.transport_id == transport_id)
            .map(|(id, _)| id.clone())
            .collect();
        for producer_id in &producer_ids {
            state.producers.remove(producer_id);
            let _ = self.events.send(EngineEvent::ProducerClosed {
                session_id: session_id.clone(),
                producer_id: producer_id.clone(),
            });
        }

        let consumer_ids: Vec<String> = state
            .consumers
            .iter()
            .filter(|(_, c)| c.transport_id == transport_id || producer_ids.contains(&c.producer_id))
            .map(|(id, _)| id.clone())
            .collect();
        for consumer_id in consumer_ids {
            state.consumers.remove(&consumer_id);
            let _ = self.events.send(EngineEvent::ConsumerClosed {
                session_id: session_id.clone(),
                consumer_id,
            });
        }
    }
}

#[async_trait]
impl MediaEngine for MemoryEngine {
    async fn create_router(&self, session_id: &str) -> MediaResult<()> {
        self.lock().routers.insert(session_id.to_string());
        Ok(())
    }

    async fn close_router(&self, session_id: &str) {
        let mut state = self.lock();
        state.routers.remove(session_id);
        let transports: HashSet<String> = state
            .transports
            .iter()
            .filter(|(_, t)| t.session_id == session_id)
            .map(|(id, _)| id.clone())
            .collect();
        state.consumers.retain(|_, c| !transports.contains(&c.transport_id));
        state.producers.retain(|_, p| p.session_id != session_id);
        state.transports.retain(|_, t| t.session_id != session_id);
        debug!("Closed in-memory router for session {}", session_id);
    }

    fn rtp_capabilities(&self, session_id: &str) -> MediaResult<Value> {
        if self.lock().routers.contains(session_id) {
            Ok(codec_capabilities())
        } else {
            Err(MediaError::RouterNotFound(session_id.to_string()))
        }
    }

    async fn create_transport(
        &self,
        session_id: &str,
        direction: TransportDirection,
    ) -> MediaResult<TransportParams> {
        let mut state = self.lock();
        if !state.routers.contains(session_id) {
            return Err(MediaError::RouterNotFound(session_id.to_string()));
        }
        let id = Uuid::new_v4().to_string();
        state.transports.insert(id.clone(), MemTransport {
            session_id: session_id.to_string(),
            direction,
            connected: false,
        });
        Ok(TransportParams {
            ice_parameters: json!({ "usernameFragment": &id[..8], "password": id, "iceLite": true }),
            ice_candidates: json!([{ "foundation": "udpcandidate", "ip": "127.0.0.1", "port": 10000, "protocol": "udp" }]),
            dtls_parameters: json!({ "role": "auto", "fingerprints": [] }),
            id,
        })
    }

    async fn connect_transport(&self, transport_id: &str, dtls_parameters: Value) -> MediaResult<()> {
        if !dtls_parameters.is_object() {
            return Err(MediaError::InvalidParameters("dtlsParameters must be an object".to_string()));
        }
        let mut state = self.lock();
        let transport = state
            .transports
            .get_mut(transport_id)
            .ok_or_else(|| MediaError::ResourceNotFound(format!("transport {transport_id}")))?;
        if transport.connected {
            return Err(MediaError::TransportError("connect() already called".to_string()));
        }
        transport.connected = true;
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
        metadata: &ProducerMetadata,
    ) -> MediaResult<String> {
        if self.fail_produce.load(Ordering::Relaxed) {
            return Err(MediaError::ProducerError("engine rejected produce".to_string()));
        }
        if !rtp_parameters.is_object() {
            return Err(MediaError::InvalidParameters("rtpParameters must be an object".to_string()));
        }
        let mut state = self.lock();
        let transport = state
            .transports
            .get(transport_id)
            .ok_or_else(|| MediaError::ResourceNotFound(format!("transport {transport_id}")))?;
        if transport.direction != TransportDirection::Send {
            return Err(MediaError::TransportError("cannot produce on a receive transport".to_string()));
        }
        let session_id = transport.session_id.clone();
        let id = Uuid::new_v4().to_string();
        state.producers.insert(id.clone(), MemProducer {
            session_id,
            transport_id: transport_id.to_string(),
            kind,
            paused: metadata.paused,
            app_data: metadata.to_app_data(),
        });
        Ok(id)
    }

    fn can_consume(&self, session_id: &str, producer_id: &str, rtp_capabilities: &Value) -> bool {
        let state = self.lock();
        state
            .producers
            .get(producer_id)
            .is_some_and(|p| p.session_id == session_id && supports_kind(rtp_capabilities, p.kind))
    }

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: Value,
    ) -> MediaResult<ConsumerParams> {
        let mut state = self.lock();
        if !state.transports.contains_key(transport_id) {
            return Err(MediaError::ResourceNotFound(format!("transport {transport_id}")));
        }
        let producer = state
            .producers
            .get(producer_id)
            .ok_or_else(|| MediaError::ResourceNotFound(format!("producer {producer_id}")))?;
        if !supports_kind(&rtp_capabilities, producer.kind) {
            return Err(MediaError::ConsumerError("cannot consume this producer".to_string()));
        }
        let kind = producer.kind;
        let app_data = producer.app_data.clone();
        let id = Uuid::new_v4().to_string();
        state.consumers.insert(id.clone(), MemConsumer {
            transport_id: transport_id.to_string(),
            producer_id: producer_id.to_string(),
            paused: false,
        });
        Ok(ConsumerParams {
            id,
            producer_id: producer_id.to_string(),
            kind,
            rtp_parameters: json!({ "codecs": [{ "mimeType": format!("{}/{}", kind.as_str(), "memory") }] }),
            app_data,
        })
    }

    async fn pause_producer(&self, producer_id: &str) -> MediaResult<()> {
        set_producer_paused(&mut self.lock(), producer_id, true)
    }

    async fn resume_producer(&self, producer_id: &str) -> MediaResult<()> {
        set_producer_paused(&mut self.lock(), producer_id, false)
    }

    async fn pause_consumer(&self, consumer_id: &str) -> MediaResult<()> {
        set_consumer_paused(&mut self.lock(), consumer_id, true)
    }

    async fn resume_consumer(&self, consumer_id: &str) -> MediaResult<()> {
        set_consumer_paused(&mut self.lock(), consumer_id, false)
    }

    fn close_producer(&self, producer_id: &str) {
        let mut state = self.lock();
        let Some(producer) = state.producers.remove(producer_id) else {
            return;
        };
        let orphaned: Vec<String> = state
            .consumers
            .iter()
            .filter(|(_, c)| c.producer_id == producer_id)
            .map(|(id, _)| id.clone())
            .collect();
        for consumer_id in orphaned {
            state.consumers.remove(&consumer_id);
            let _ = self.events.send(EngineEvent::ConsumerClosed {
                session_id: producer.session_id.clone(),
                consumer_id,
            });
        }
    }

    fn close_consumer(&self, consumer_id: &str) {
        self.lock().consumers.remove(consumer_id);
    }

    fn close_transport(&self, transport_id: &str) {
        let mut state = self.lock();
        if state.transports.remove(transport_id).is_some() {
            state.producers.retain(|_, p| p.transport_id != transport_id);
            state.consumers.retain(|_, c| c.transport_id != transport_id);
        }
    }
}

fn set_producer_paused(state: &mut EngineState, producer_id: &str, paused: bool) -> MediaResult<()> {
    let producer = state
        .producers
        .get_mut(producer_id)
        .ok_or_else(|| MediaError::ResourceNotFound(format!("producer {producer_id}")))?;
    producer.paused = paused;
    if let Value::Object(map) = &mut producer.app_data {
        map.insert("paused".to_string(), Value::Bool(paused));
    }
    Ok(())
}

fn set_consumer_paused(state: &mut EngineState, consumer_id: &str, paused: bool) -> MediaResult<()> {
    let consumer = state
        .consumers
        .get_mut(consumer_id)
        .ok_or_else(|| MediaError::ResourceNotFound(format!("consumer {consumer_id}")))?;
    consumer.paused = paused;
    Ok(())
}
