#![forbid(unsafe_code)]

// Signaling session handler
// `Coordinator` is shared by every connection and owns the room registry, the media
// engine and host election. `SignalingSession` is bound to one connection and one
// session and turns control messages into registry and engine calls.
//
// Room locks are never held across an engine or store call: each operation does
// its bookkeeping in a registry call, awaits the engine, then commits in another.

use super::protocol::{
    ClientMessage, ClientRequest, ConsumeResponse, HostApplicationResponse, JoinResponse,
    ProduceResponse, ProducersResponse, RtpCapabilitiesResponse, ServerMessage,
};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::host::HostElection;
use crate::media::{
    EngineEvent, MediaEngine, MediaError, MediaKind, ProducerMetadata, SessionId, TransportDirection,
    TransportParams,
};
use crate::metrics::{Counter, ServerMetrics};
use crate::room::{ClientState, ConsumeStep, ConsumerRecord, ProducerRecord, RemovedProducer, RoomRegistry};
use crate::session::{SessionRecord, SessionStore};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Shared coordinator state
pub struct Coordinator {
    registry: RoomRegistry,
    engine: Arc<dyn MediaEngine>,
    host: Arc<HostElection>,
    metrics: ServerMetrics,
    /// Serializes router creation against router disposal, per session
    router_locks: StdMutex<HashMap<SessionId, Arc<tokio::sync::Mutex<()>>>>,
}

impl Coordinator {
    /// Builds the coordinator and spawns its background task, which runs the cleanup
    /// path for objects the engine closed on its own and tears down deleted sessions.
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        engine_events: mpsc::UnboundedReceiver<EngineEvent>,
        store: Arc<dyn SessionStore>,
        host_grace: Duration,
        metrics: ServerMetrics,
    ) -> Arc<Self> {
        let (host, expired) = HostElection::new(store, host_grace);
        let coordinator = Arc::new(Self {
            registry: RoomRegistry::new(),
            engine,
            host: Arc::new(host),
            metrics,
            router_locks: StdMutex::new(HashMap::new()),
        });
        spawn_event_loop(Arc::downgrade(&coordinator), engine_events, expired);
        coordinator
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    pub fn host_election(&self) -> &Arc<HostElection> {
        &self.host
    }

    fn router_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.router_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(session_id.to_string()).or_default().clone()
    }

    fn release_router_lock(&self, session_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.router_locks.lock().unwrap_or_else(|e| e.into_inner());
        drop(lock);
        // Only the map's own reference left
        if locks.get(session_id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(session_id);
        }
    }

    /// Creates the session's router unless it already exists
    async fn ensure_router(&self, session_id: &str) -> CoordinatorResult<()> {
        let lock = self.router_lock(session_id);
        let result = {
            let _guard = lock.lock().await;
            self.engine.create_router(session_id).await
        };
        self.release_router_lock(session_id, lock);
        result.map_err(CoordinatorError::from)
    }

    /// Disposes of the room and its router once the last client is gone
    async fn close_room_if_empty(&self, session_id: &str) {
        let lock = self.router_lock(session_id);
        {
            let _guard = lock.lock().await;
            if self.registry.remove_room_if_empty(session_id) {
                self.engine.close_router(session_id).await;
                info!("Closed router of session {}", session_id);
            }
        }
        self.release_router_lock(session_id, lock);
    }

    fn close_removed_producer(&self, removed: &RemovedProducer) {
        for consumer_id in &removed.consumer_ids {
            self.engine.close_consumer(consumer_id);
        }
        self.engine.close_producer(&removed.producer_id);
    }

    /// Full disconnect path for one client. A second call for the same client is a no-op.
    pub async fn remove_client(&self, session_id: &str, client_id: &str) {
        let Some(snapshot) = self.registry.remove_client(session_id, client_id) else {
            debug!("Client {} already gone from session {}", client_id, session_id);
            return;
        };

        // Producers and consumers before the transports they run on
        for producer_id in &snapshot.producers {
            self.engine.close_producer(producer_id);
        }
        for consumer_id in &snapshot.consumers {
            self.engine.close_consumer(consumer_id);
        }
        for transport_id in &snapshot.transports {
            self.engine.close_transport(transport_id);
        }

        let room_empty = self.registry.finish_client_removal(session_id, client_id);
        self.metrics.inc(Counter::Leaves);

        if snapshot.was_host {
            self.host.release(&self.registry, session_id, client_id).await;
        }
        if room_empty {
            self.close_room_if_empty(session_id).await;
        }
    }

    /// Deletes a session right away, cancelling any pending grace timer
    pub async fn end_session(&self, session_id: &str) -> CoordinatorResult<bool> {
        self.host.cancel_expiry(session_id);
        let deleted = self.host.store().delete_session(session_id).await?;
        if deleted {
            self.teardown_session(session_id).await;
        }
        Ok(deleted)
    }

    /// The session record is gone: tell the room, then disconnect everyone in it
    async fn teardown_session(&self, session_id: &str) {
        self.metrics.inc(Counter::SessionsDeleted);
        info!("Session {} deleted, tearing down its room", session_id);
        self.registry.broadcast_all(session_id, &ServerMessage::SessionDeleted {
            session_id: session_id.to_string(),
        });
        for client_id in self.registry.client_ids(session_id) {
            self.remove_client(session_id, &client_id).await;
        }
    }

    /// Runs the per-object cleanup path for something the engine closed by itself
    fn handle_engine_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::TransportClosed { session_id, transport_id } => {
                let Some(removed) = self.registry.remove_transport(&session_id, &transport_id) else {
                    return;
                };
                warn!(
                    "Transport {} of client {} in session {} closed by the media engine",
                    transport_id, removed.owner, session_id
                );
                for producer in &removed.producers {
                    self.close_removed_producer(producer);
                    // Peers heard about it from the registry; the owner did not
                    self.registry.notify_client(&session_id, &removed.owner, &ServerMessage::ProducerClosed {
                        producer_id: producer.producer_id.clone(),
                    });
                }
                for consumer_id in &removed.consumer_ids {
                    self.engine.close_consumer(consumer_id);
                }
                self.engine.close_transport(&transport_id);
                self.metrics.inc(Counter::EngineEvents);
            }
            EngineEvent::ProducerClosed { session_id, producer_id } => {
                let owner = self.registry.producer(&session_id, &producer_id).map(|p| p.owner);
                let Some(removed) = self.registry.remove_producer(&session_id, &producer_id) else {
                    return;
                };
                warn!("Producer {} in session {} closed by the media engine", producer_id, session_id);
                self.close_removed_producer(&removed);
                if let Some(owner) = owner {
                    self.registry.notify_client(&session_id, &owner, &ServerMessage::ProducerClosed {
                        producer_id: producer_id.clone(),
                    });
                }
                self.metrics.inc(Counter::EngineEvents);
            }
            EngineEvent::ConsumerClosed { session_id, consumer_id } => {
                if self.registry.remove_consumer(&session_id, &consumer_id) {
                    debug!("Consumer {} in session {} closed by the media engine", consumer_id, session_id);
                    self.engine.close_consumer(&consumer_id);
                    self.metrics.inc(Counter::EngineEvents);
                }
            }
        }
    }

    /// Stops pending grace timers (shutdown)
    pub fn shutdown(&self) {
        self.host.cancel_all();
    }
}

fn spawn_event_loop(
    coordinator: Weak<Coordinator>,
    mut engine_events: mpsc::UnboundedReceiver<EngineEvent>,
    mut expired: mpsc::UnboundedReceiver<String>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(event) = engine_events.recv() => {
                    let Some(coordinator) = coordinator.upgrade() else { break };
                    coordinator.handle_engine_event(event);
                }
                Some(session_id) = expired.recv() => {
                    let Some(coordinator) = coordinator.upgrade() else { break };
                    coordinator.teardown_session(&session_id).await;
                }
                else => break,
            }
        }
        debug!("Coordinator event loop finished");
    });
}

fn to_data<T: Serialize>(value: T) -> CoordinatorResult<Value> {
    serde_json::to_value(value).map_err(|e| CoordinatorError::InvalidRequest(e.to_string()))
}

fn ack() -> CoordinatorResult<Value> {
    Ok(json!({}))
}

/// One connection's view of the coordinator. A session is bound to a single
/// client id and a single room for its whole life.
pub struct SignalingSession {
    coordinator: Arc<Coordinator>,
    session_id: String,
    client_id: String,
    user_id: Option<String>,
    sender: mpsc::Sender<Arc<String>>,
    joined: bool,
    left: bool,
}

impl SignalingSession {
    /// `user_id` is the authenticated user, `None` for anonymous connections
    pub fn new(
        coordinator: Arc<Coordinator>,
        session_id: &str,
        user_id: Option<String>,
        sender: mpsc::Sender<Arc<String>>,
    ) -> Self {
        Self {
            coordinator,
            session_id: session_id.to_string(),
            client_id: Uuid::new_v4().to_string(),
            user_id,
            sender,
            joined: false,
            left: false,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn has_left(&self) -> bool {
        self.left
    }

    fn registry(&self) -> &RoomRegistry {
        &self.coordinator.registry
    }

    fn engine(&self) -> &dyn MediaEngine {
        self.coordinator.engine.as_ref()
    }

    fn require_active(&self) -> CoordinatorResult<()> {
        match self.registry().client_state(&self.session_id, &self.client_id) {
            Some(ClientState::Active) => Ok(()),
            _ => Err(CoordinatorError::ClientNotFound(self.client_id.clone())),
        }
    }

    /// Handles one request and builds its response
    pub async fn dispatch(&mut self, request: ClientRequest) -> ServerMessage {
        let id = request.id;
        let result = match request.message {
            ClientMessage::JoinStreamRoom => self.join_room().await.and_then(to_data),
            ClientMessage::GetRtpCapabilities => self.get_rtp_capabilities().and_then(to_data),
            ClientMessage::GetProducers => self.list_producers().and_then(to_data),
            ClientMessage::CreateTransport { direction } => {
                self.create_transport(direction).await.and_then(to_data)
            }
            ClientMessage::ConnectTransport { transport_id, dtls_parameters } => self
                .connect_transport(&transport_id, dtls_parameters)
                .await
                .and_then(|()| ack()),
            ClientMessage::Produce { transport_id, kind, rtp_parameters, app_data } => self
                .produce(&transport_id, kind, rtp_parameters, app_data)
                .await
                .and_then(to_data),
            ClientMessage::Consume { transport_id, producer_id, rtp_capabilities } => self
                .consume(&transport_id, &producer_id, rtp_capabilities)
                .await
                .and_then(to_data),
            ClientMessage::PauseProducer { producer_id, .. } => {
                self.pause_producer(&producer_id).await.and_then(|()| ack())
            }
            ClientMessage::ResumeProducer { producer_id, .. } => {
                self.resume_producer(&producer_id).await.and_then(|()| ack())
            }
            ClientMessage::PauseConsumer { consumer_id } => {
                self.pause_consumer(&consumer_id).await.and_then(|()| ack())
            }
            ClientMessage::ResumeConsumer { consumer_id } => {
                self.resume_consumer(&consumer_id).await.and_then(|()| ack())
            }
            ClientMessage::HostApplication => self.host_application().await.and_then(to_data),
            ClientMessage::Leave => self.leave().await.and_then(|()| ack()),
        };

        match result {
            Ok(data) => ServerMessage::ok(id, data),
            Err(err) => {
                self.report(&err);
                ServerMessage::error(id, &err)
            }
        }
    }

    fn report(&self, err: &CoordinatorError) {
        let metrics = &self.coordinator.metrics;
        metrics.inc(Counter::Errors);
        match err {
            CoordinatorError::Unauthorized(what) => {
                metrics.inc(Counter::Unauthorized);
                warn!(
                    "Unauthorized request from client {} in session {}: {} belongs to another client",
                    self.client_id, self.session_id, what
                );
            }
            CoordinatorError::StoreUnavailable(_) | CoordinatorError::EngineFailure(_) => {
                error!("Request from client {} in session {} failed: {}", self.client_id, self.session_id, err);
            }
            _ => debug!("Request from client {} in session {} failed: {}", self.client_id, self.session_id, err),
        }
    }

    /// Registers the client, makes sure the router exists and returns the producers
    /// it can consume right away. The session owner becomes host if the seat is free.
    pub async fn join_room(&mut self) -> CoordinatorResult<JoinResponse> {
        if self.left {
            return Err(CoordinatorError::ClientNotFound(self.client_id.clone()));
        }
        if self.joined {
            return Err(CoordinatorError::InvalidRequest("already joined".to_string()));
        }

        let record = self.coordinator.host.find_session(&self.session_id).await?;
        self.registry()
            .register_client(&self.session_id, &self.client_id, self.user_id.clone(), self.sender.clone())?;
        self.joined = true;

        let outcome = self.finish_join(&record).await;
        match outcome {
            Ok(response) => {
                self.coordinator.metrics.inc(Counter::Joins);
                Ok(response)
            }
            Err(e) => {
                warn!("Join of client {} to session {} failed: {}", self.client_id, self.session_id, e);
                self.disconnect().await;
                Err(e)
            }
        }
    }

    async fn finish_join(&self, record: &SessionRecord) -> CoordinatorResult<JoinResponse> {
        self.coordinator.ensure_router(&self.session_id).await?;
        let router_rtp_capabilities = self.get_router_capabilities()?;
        let producers = self.registry().activate_client(&self.session_id, &self.client_id)?;

        let became_host = self
            .coordinator
            .host
            .claim_on_join(self.registry(), record, &self.client_id, self.user_id.as_deref())
            .await?;
        if became_host {
            self.coordinator.metrics.inc(Counter::HostChanges);
        }

        info!(
            "Client {} joined session {} ({} producers available)",
            self.client_id,
            self.session_id,
            producers.len()
        );
        Ok(JoinResponse {
            id: self.client_id.clone(),
            router_rtp_capabilities,
            producers,
        })
    }

    fn get_router_capabilities(&self) -> CoordinatorResult<Value> {
        self.engine().rtp_capabilities(&self.session_id).map_err(|e| match e {
            MediaError::RouterNotFound(_) => CoordinatorError::RoomNotFound(self.session_id.clone()),
            other => other.into(),
        })
    }

    /// Pure read of the session router's capabilities
    pub fn get_rtp_capabilities(&self) -> CoordinatorResult<RtpCapabilitiesResponse> {
        Ok(RtpCapabilitiesResponse {
            rtp_capabilities: self.get_router_capabilities()?,
        })
    }

    pub fn list_producers(&self) -> CoordinatorResult<ProducersResponse> {
        self.require_active()?;
        Ok(ProducersResponse {
            producers: self.registry().list_producers(&self.session_id)?,
        })
    }

    pub async fn create_transport(&self, direction: TransportDirection) -> CoordinatorResult<TransportParams> {
        self.require_active()?;
        let params = self.engine().create_transport(&self.session_id, direction).await?;
        if let Err(e) = self
            .registry()
            .add_transport(&self.session_id, &self.client_id, &params.id, direction)
        {
            // Client left while the engine was working
            self.engine().close_transport(&params.id);
            return Err(e);
        }
        debug!("Client {} created {:?} transport {}", self.client_id, direction, params.id);
        Ok(params)
    }

    /// Establishes DTLS on an owned transport. Connecting again is acknowledged
    /// without another engine call.
    pub async fn connect_transport(&self, transport_id: &str, dtls_parameters: Value) -> CoordinatorResult<()> {
        if !self.registry().begin_connect(&self.session_id, &self.client_id, transport_id)? {
            debug!("Transport {} already connected or connecting", transport_id);
            return Ok(());
        }
        let result = self.engine().connect_transport(transport_id, dtls_parameters).await;
        self.registry()
            .complete_connect(&self.session_id, &self.client_id, transport_id, result.is_ok());
        result?;
        debug!("Client {} connected transport {}", self.client_id, transport_id);
        Ok(())
    }

    /// Creates a paused producer on an owned send transport and announces it.
    /// An earlier producer of the same kind is closed first.
    pub async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
        app_data: Option<Value>,
    ) -> CoordinatorResult<ProduceResponse> {
        let metadata = ProducerMetadata::from_client_app_data(&self.client_id, app_data)
            .map_err(|e| CoordinatorError::InvalidRequest(e.to_string()))?;

        let prior = self
            .registry()
            .begin_produce(&self.session_id, &self.client_id, transport_id, kind)?;
        if let Some(prior) = prior {
            if let Some(removed) = self.registry().remove_producer(&self.session_id, &prior) {
                debug!("Client {} replaces {} producer {}", self.client_id, kind.as_str(), prior);
                self.coordinator.close_removed_producer(&removed);
            }
        }

        let producer_id = self
            .engine()
            .produce(transport_id, kind, rtp_parameters, &metadata)
            .await?;

        let record = ProducerRecord {
            id: producer_id.clone(),
            owner: self.client_id.clone(),
            transport_id: transport_id.to_string(),
            kind,
            metadata,
        };
        match self.registry().commit_producer(&self.session_id, record) {
            Ok(displaced) => {
                // A concurrent produce of the same kind committed first
                if let Some(displaced) = displaced {
                    self.coordinator.close_removed_producer(&displaced);
                }
            }
            Err(e) => {
                self.engine().close_producer(&producer_id);
                return Err(e);
            }
        }

        self.coordinator.metrics.inc(Counter::ProducersCreated);
        Ok(ProduceResponse { id: producer_id })
    }

    /// Creates (or returns the existing) consumer of `producer_id` for this client
    pub async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: Value,
    ) -> CoordinatorResult<ConsumeResponse> {
        let step = self
            .registry()
            .begin_consume(&self.session_id, &self.client_id, transport_id, producer_id)?;
        if let ConsumeStep::Existing(params) = step {
            return Ok(ConsumeResponse { params });
        }

        if !self.engine().can_consume(&self.session_id, producer_id, &rtp_capabilities) {
            return Err(CoordinatorError::CannotConsume(producer_id.to_string()));
        }

        let params = self
            .engine()
            .consume(transport_id, producer_id, rtp_capabilities)
            .await?;

        let record = ConsumerRecord {
            id: params.id.clone(),
            owner: self.client_id.clone(),
            transport_id: transport_id.to_string(),
            producer_id: producer_id.to_string(),
            params: params.clone(),
        };
        match self.registry().commit_consumer(&self.session_id, record) {
            Ok(ConsumeStep::Create) => {
                self.coordinator.metrics.inc(Counter::ConsumersCreated);
                Ok(ConsumeResponse { params })
            }
            Ok(ConsumeStep::Existing(existing)) => {
                self.engine().close_consumer(&params.id);
                Ok(ConsumeResponse { params: existing })
            }
            Err(e) => {
                self.engine().close_consumer(&params.id);
                Err(e)
            }
        }
    }

    async fn set_producer_paused(&self, producer_id: &str, paused: bool) -> CoordinatorResult<()> {
        self.registry()
            .check_producer_owner(&self.session_id, &self.client_id, producer_id)?;
        if paused {
            self.engine().pause_producer(producer_id).await?;
        } else {
            self.engine().resume_producer(producer_id).await?;
        }
        self.registry()
            .set_producer_paused(&self.session_id, &self.client_id, producer_id, paused)
    }

    pub async fn pause_producer(&self, producer_id: &str) -> CoordinatorResult<()> {
        self.set_producer_paused(producer_id, true).await
    }

    pub async fn resume_producer(&self, producer_id: &str) -> CoordinatorResult<()> {
        self.set_producer_paused(producer_id, false).await
    }

    async fn set_consumer_paused(&self, consumer_id: &str, paused: bool) -> CoordinatorResult<()> {
        self.registry()
            .check_consumer_owner(&self.session_id, &self.client_id, consumer_id)?;
        if paused {
            self.engine().pause_consumer(consumer_id).await?;
        } else {
            self.engine().resume_consumer(consumer_id).await?;
        }
        self.registry()
            .announce_consumer_paused(&self.session_id, &self.client_id, consumer_id, paused)
    }

    pub async fn pause_consumer(&self, consumer_id: &str) -> CoordinatorResult<()> {
        self.set_consumer_paused(consumer_id, true).await
    }

    pub async fn resume_consumer(&self, consumer_id: &str) -> CoordinatorResult<()> {
        self.set_consumer_paused(consumer_id, false).await
    }

    /// Granted only when the session has no live host
    pub async fn host_application(&self) -> CoordinatorResult<HostApplicationResponse> {
        self.require_active()?;
        let granted = self
            .coordinator
            .host
            .apply(self.registry(), &self.session_id, &self.client_id, self.user_id.as_deref())
            .await?;
        if granted {
            self.coordinator.metrics.inc(Counter::HostChanges);
        }
        Ok(HostApplicationResponse { granted })
    }

    pub async fn leave(&mut self) -> CoordinatorResult<()> {
        if !self.joined || self.left {
            return Err(CoordinatorError::ClientNotFound(self.client_id.clone()));
        }
        self.disconnect().await;
        Ok(())
    }

    /// Connection lost (or left): tear down everything this client owns
    pub async fn disconnect(&mut self) {
        if self.left {
            return;
        }
        self.left = true;
        if self.joined {
            self.coordinator.remove_client(&self.session_id, &self.client_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MemoryEngine;
    use crate::session::MemorySessionStore;

    struct Harness {
        coordinator: Arc<Coordinator>,
        engine: Arc<MemoryEngine>,
        store: Arc<MemorySessionStore>,
    }

    fn harness() -> Harness {
        let (engine, events) = MemoryEngine::new();
        let engine = Arc::new(engine);
        let store = Arc::new(MemorySessionStore::new());
        store.insert("s", "owner");
        let coordinator = Coordinator::new(
            engine.clone(),
            events,
            store.clone(),
            Duration::from_secs(10),
            ServerMetrics::new(),
        );
        Harness { coordinator, engine, store }
    }

    fn connect(h: &Harness, user: Option<&str>) -> (SignalingSession, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(64);
        let session = SignalingSession::new(h.coordinator.clone(), "s", user.map(str::to_string), tx);
        (session, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Arc<String>>) -> Vec<Value> {
        let mut messages = Vec::new();
        while let Ok(json) = rx.try_recv() {
            messages.push(serde_json::from_str(&json).unwrap());
        }
        messages
    }

    fn types(messages: &[Value]) -> Vec<&str> {
        messages.iter().filter_map(|m| m["type"].as_str()).collect()
    }

    /// Lets the coordinator's background task catch up
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn caps_all() -> Value {
        json!({ "codecs": [{ "kind": "audio" }, { "kind": "video" }] })
    }

    fn rtp() -> Value {
        json!({ "codecs": [], "encodings": [] })
    }

    /// Joined client with a connected send transport
    async fn publisher(h: &Harness, user: Option<&str>) -> (SignalingSession, mpsc::Receiver<Arc<String>>, String) {
        let (mut session, rx) = connect(h, user);
        session.join_room().await.unwrap();
        let transport = session.create_transport(TransportDirection::Send).await.unwrap();
        session.connect_transport(&transport.id, json!({ "role": "client" })).await.unwrap();
        (session, rx, transport.id)
    }

    #[tokio::test]
    async fn test_host_handover_scenario() {
        let h = harness();
        let (mut a, mut a_rx) = connect(&h, Some("owner"));
        let join = a.join_room().await.unwrap();
        assert_eq!(join.id, a.client_id());
        assert!(join.producers.is_empty());
        assert_eq!(h.coordinator.registry().host("s").as_deref(), Some(a.client_id()));
        // The new host hears about itself too
        let a_msgs = drain(&mut a_rx);
        assert_eq!(a_msgs[0], json!({ "type": "new_host", "connId": a.client_id() }));

        let send = a.create_transport(TransportDirection::Send).await.unwrap();
        a.connect_transport(&send.id, json!({})).await.unwrap();
        let p1 = a.produce(&send.id, MediaKind::Video, rtp(), None).await.unwrap().id;

        let (mut b, mut b_rx) = connect(&h, None);
        let join = b.join_room().await.unwrap();
        assert_eq!(join.producers.len(), 1);
        assert_eq!(join.producers[0].producer_id, p1);
        assert_eq!(join.producers[0].client_id, a.client_id());
        assert_eq!(join.producers[0].app_data["paused"], true);

        let recv = b.create_transport(TransportDirection::Recv).await.unwrap();
        let consumed = b.consume(&recv.id, &p1, caps_all()).await.unwrap();
        assert_eq!(consumed.params.producer_id, p1);
        assert_eq!(consumed.params.kind, MediaKind::Video);
        drain(&mut b_rx);

        a.disconnect().await;
        assert_eq!(h.coordinator.registry().host("s"), None);
        assert_eq!(h.store.find_session("s").await.unwrap().unwrap().host_conn_id, None);
        let b_msgs = drain(&mut b_rx);
        assert_eq!(types(&b_msgs), vec!["producer_closed", "remove_client", "host_left"]);
        assert_eq!(b_msgs[2]["connId"], a.client_id());

        let result = b.consume(&recv.id, &p1, caps_all()).await;
        assert!(matches!(result, Err(CoordinatorError::ProducerNotFound(_))));
    }

    #[tokio::test]
    async fn test_consume_requires_compatible_capabilities() {
        let h = harness();
        let (a, _a_rx, send) = publisher(&h, Some("owner")).await;
        let p1 = a.produce(&send, MediaKind::Video, rtp(), None).await.unwrap().id;

        let (mut b, _b_rx) = connect(&h, None);
        b.join_room().await.unwrap();
        let recv = b.create_transport(TransportDirection::Recv).await.unwrap();

        let audio_only = json!({ "codecs": [{ "kind": "audio" }] });
        let result = b.consume(&recv.id, &p1, audio_only).await;
        assert!(matches!(result, Err(CoordinatorError::CannotConsume(ref id)) if *id == p1));
        assert_eq!(h.engine.consumer_count(), 0);
    }

    #[tokio::test]
    async fn test_consume_is_idempotent_per_pairing() {
        let h = harness();
        let (a, _a_rx, send) = publisher(&h, Some("owner")).await;
        let p1 = a.produce(&send, MediaKind::Audio, rtp(), None).await.unwrap().id;

        let (mut b, _b_rx) = connect(&h, None);
        b.join_room().await.unwrap();
        let recv = b.create_transport(TransportDirection::Recv).await.unwrap();

        let first = b.consume(&recv.id, &p1, caps_all()).await.unwrap();
        let second = b.consume(&recv.id, &p1, caps_all()).await.unwrap();
        assert_eq!(first.params, second.params);
        assert_eq!(h.engine.consumer_count(), 1);
        assert_eq!(h.coordinator.metrics().get(Counter::ConsumersCreated), 1);
    }

    #[tokio::test]
    async fn test_foreign_ids_are_unauthorized_and_change_nothing() {
        let h = harness();
        let (a, _a_rx, send) = publisher(&h, Some("owner")).await;
        let p1 = a.produce(&send, MediaKind::Video, rtp(), None).await.unwrap().id;
        let a_recv = a.create_transport(TransportDirection::Recv).await.unwrap();

        let (mut b, mut b_rx) = connect(&h, None);
        b.join_room().await.unwrap();
        drain(&mut b_rx);

        let requests = [
            json!({ "id": 1, "type": "connect_transport", "transportId": a_recv.id, "dtlsParameters": {} }),
            json!({ "id": 2, "type": "produce", "transportId": send, "kind": "audio", "rtpParameters": {} }),
            json!({ "id": 3, "type": "pause_producer", "producerId": p1, "kind": "video" }),
            json!({ "id": 4, "type": "resume_producer", "producerId": p1 }),
            json!({ "id": 5, "type": "consume", "transportId": a_recv.id, "producerId": p1, "rtpCapabilities": caps_all() }),
        ];
        for (i, request) in requests.into_iter().enumerate() {
            let response = b.dispatch(serde_json::from_value(request).unwrap()).await;
            let value = serde_json::to_value(&response).unwrap();
            assert_eq!(value["id"], i as u64 + 1);
            assert_eq!(value["error"]["code"], "unauthorized", "request {}", i + 1);
        }

        assert_eq!(
            h.coordinator.registry().transport_state("s", a.client_id(), &a_recv.id),
            Some(crate::room::TransportState::New)
        );
        assert_eq!(h.engine.producer_count(), 1);
        assert_eq!(h.engine.is_producer_paused(&p1), Some(true));
        assert_eq!(h.engine.consumer_count(), 0);
        assert_eq!(h.coordinator.metrics().get(Counter::Unauthorized), 5);
        assert!(drain(&mut b_rx).is_empty());
    }

    #[tokio::test]
    async fn test_consumer_pause_is_owner_only() {
        let h = harness();
        let (a, mut a_rx, send) = publisher(&h, Some("owner")).await;
        let p1 = a.produce(&send, MediaKind::Video, rtp(), None).await.unwrap().id;

        let (mut b, mut b_rx) = connect(&h, None);
        b.join_room().await.unwrap();
        let recv = b.create_transport(TransportDirection::Recv).await.unwrap();
        let consumer = b.consume(&recv.id, &p1, caps_all()).await.unwrap().params.id;
        drain(&mut a_rx);
        drain(&mut b_rx);

        assert!(matches!(a.pause_consumer(&consumer).await, Err(CoordinatorError::Unauthorized(_))));
        assert!(drain(&mut a_rx).is_empty());

        b.pause_consumer(&consumer).await.unwrap();
        assert_eq!(h.engine.is_consumer_paused(&consumer), Some(true));
        b.resume_consumer(&consumer).await.unwrap();
        assert_eq!(h.engine.is_consumer_paused(&consumer), Some(false));
        assert!(matches!(b.pause_consumer("nope").await, Err(CoordinatorError::ConsumerNotFound(_))));

        assert_eq!(
            drain(&mut a_rx),
            vec![
                json!({ "type": "consumer-paused", "consumerId": consumer }),
                json!({ "type": "consumer-resumed", "consumerId": consumer }),
            ]
        );
        assert!(drain(&mut b_rx).is_empty());
    }

    #[tokio::test]
    async fn test_pause_and_resume_broadcast_to_peers_only() {
        let h = harness();
        let (a, mut a_rx, send) = publisher(&h, Some("owner")).await;
        let p1 = a.produce(&send, MediaKind::Audio, rtp(), None).await.unwrap().id;
        let (mut b, mut b_rx) = connect(&h, None);
        b.join_room().await.unwrap();
        drain(&mut a_rx);
        drain(&mut b_rx);

        a.resume_producer(&p1).await.unwrap();
        a.pause_producer(&p1).await.unwrap();

        assert!(drain(&mut a_rx).is_empty());
        let b_msgs = drain(&mut b_rx);
        assert_eq!(
            b_msgs,
            vec![
                json!({ "type": "producer-resumed", "clientId": a.client_id(), "producerId": p1, "kind": "audio" }),
                json!({ "type": "producer-paused", "clientId": a.client_id(), "producerId": p1, "kind": "audio" }),
            ]
        );
        assert_eq!(h.engine.is_producer_paused(&p1), Some(true));
        let listed = b.list_producers().unwrap().producers;
        assert_eq!(listed[0].app_data["paused"], true);
    }

    #[tokio::test]
    async fn test_second_produce_of_same_kind_replaces_the_first() {
        let h = harness();
        let (mut b, mut b_rx) = connect(&h, None);
        b.join_room().await.unwrap();
        let (a, _a_rx, send) = publisher(&h, Some("owner")).await;
        drain(&mut b_rx);

        let first = a.produce(&send, MediaKind::Video, rtp(), None).await.unwrap().id;
        let second = a
            .produce(&send, MediaKind::Video, rtp(), Some(json!({ "label": "screen", "clientId": "spoof" })))
            .await
            .unwrap()
            .id;

        assert!(!h.engine.has_producer(&first));
        assert!(h.engine.has_producer(&second));
        assert_eq!(h.engine.producer_count(), 1);

        let b_msgs = drain(&mut b_rx);
        assert_eq!(types(&b_msgs), vec!["new_producer", "producer_closed", "new_producer"]);
        assert_eq!(b_msgs[1]["producerId"], first.as_str());
        assert_eq!(b_msgs[2]["appData"]["clientId"], a.client_id());
        assert_eq!(b_msgs[2]["appData"]["label"], "screen");
        assert_eq!(h.coordinator.registry().client_producers("s", a.client_id()), vec![second]);
    }

    #[tokio::test]
    async fn test_produce_needs_send_transport_and_survives_engine_failure() {
        let h = harness();
        let (a, _a_rx, send) = publisher(&h, Some("owner")).await;
        let (mut b, mut b_rx) = connect(&h, None);
        b.join_room().await.unwrap();
        drain(&mut b_rx);

        let recv = a.create_transport(TransportDirection::Recv).await.unwrap();
        let result = a.produce(&recv.id, MediaKind::Audio, rtp(), None).await;
        assert!(matches!(result, Err(CoordinatorError::InvalidRequest(_))));

        h.engine.set_fail_produce(true);
        let result = a.produce(&send, MediaKind::Audio, rtp(), None).await;
        assert!(matches!(result, Err(CoordinatorError::EngineFailure(_))));
        assert!(drain(&mut b_rx).is_empty());
        assert!(h.coordinator.registry().client_producers("s", a.client_id()).is_empty());

        let result = a.produce(&send, MediaKind::Audio, rtp(), Some(json!("not an object"))).await;
        assert!(matches!(result, Err(CoordinatorError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_connect_transport_is_idempotent() {
        let h = harness();
        let (a, _a_rx, send) = publisher(&h, Some("owner")).await;
        // The in-memory engine rejects a second connect, so success means it was not called
        a.connect_transport(&send, json!({})).await.unwrap();
        assert_eq!(
            h.coordinator.registry().transport_state("s", a.client_id(), &send),
            Some(crate::room::TransportState::Connected)
        );

        let recv = a.create_transport(TransportDirection::Recv).await.unwrap();
        let result = a.connect_transport(&recv.id, json!("bad")).await;
        assert!(matches!(result, Err(CoordinatorError::EngineFailure(_))));
        assert_eq!(
            h.coordinator.registry().transport_state("s", a.client_id(), &recv.id),
            Some(crate::room::TransportState::New)
        );
        assert!(matches!(
            a.connect_transport("missing", json!({})).await,
            Err(CoordinatorError::TransportNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_releases_everything() {
        let h = harness();
        let (mut a, _a_rx, send) = publisher(&h, Some("owner")).await;
        a.produce(&send, MediaKind::Audio, rtp(), None).await.unwrap();
        a.produce(&send, MediaKind::Video, rtp(), None).await.unwrap();
        let (mut b, _b_rx, b_send) = publisher(&h, None).await;
        let pb = b.produce(&b_send, MediaKind::Video, rtp(), None).await.unwrap().id;

        let a_recv = a.create_transport(TransportDirection::Recv).await.unwrap();
        a.consume(&a_recv.id, &pb, caps_all()).await.unwrap();
        let b_recv = b.create_transport(TransportDirection::Recv).await.unwrap();
        for producer in h.coordinator.registry().client_producers("s", a.client_id()) {
            b.consume(&b_recv.id, &producer, caps_all()).await.unwrap();
        }
        assert_eq!(h.engine.consumer_count(), 3);

        a.disconnect().await;
        a.disconnect().await;
        assert_eq!(h.coordinator.registry().client_state("s", a.client_id()), None);
        assert_eq!(h.engine.producer_count(), 1);
        assert_eq!(h.engine.consumer_count(), 0);
        assert_eq!(h.engine.transport_count(), 2);
        assert_eq!(h.coordinator.metrics().get(Counter::Leaves), 1);

        b.disconnect().await;
        assert!(!h.coordinator.registry().has_room("s"));
        assert_eq!(h.engine.router_count(), 0);
        assert_eq!(h.engine.transport_count(), 0);
        assert_eq!(h.engine.producer_count(), 0);
    }

    #[tokio::test]
    async fn test_leave_ends_the_session_handle() {
        let h = harness();
        let (mut a, _a_rx) = connect(&h, None);
        let response = a.dispatch(serde_json::from_str(r#"{"id":9,"type":"leave"}"#).unwrap()).await;
        assert_eq!(serde_json::to_value(&response).unwrap()["error"]["code"], "client_not_found");

        a.join_room().await.unwrap();
        let response = a.dispatch(serde_json::from_str(r#"{"id":10,"type":"leave"}"#).unwrap()).await;
        assert_eq!(response, ServerMessage::ok(Some(10), json!({})));
        assert!(a.has_left());

        let response = a.dispatch(serde_json::from_str(r#"{"id":11,"type":"get_producers"}"#).unwrap()).await;
        assert_eq!(serde_json::to_value(&response).unwrap()["error"]["code"], "client_not_found");
        assert!(matches!(a.join_room().await, Err(CoordinatorError::ClientNotFound(_))));
    }

    #[tokio::test]
    async fn test_join_failures() {
        let h = harness();
        let (tx, _rx) = mpsc::channel(8);
        let mut ghost = SignalingSession::new(h.coordinator.clone(), "missing", None, tx);
        assert!(matches!(ghost.join_room().await, Err(CoordinatorError::RoomNotFound(_))));
        assert!(!h.coordinator.registry().has_room("missing"));

        h.store.set_unavailable(true);
        let (mut a, _a_rx) = connect(&h, Some("owner"));
        assert!(matches!(a.join_room().await, Err(CoordinatorError::StoreUnavailable(_))));
        assert_eq!(h.coordinator.registry().client_count_for_room("s"), 0);

        h.store.set_unavailable(false);
        let (mut b, _b_rx) = connect(&h, None);
        b.join_room().await.unwrap();
        assert!(matches!(b.join_room().await, Err(CoordinatorError::InvalidRequest(_))));
        assert_eq!(h.coordinator.registry().host("s"), None);
    }

    #[tokio::test]
    async fn test_capabilities_need_a_router() {
        let h = harness();
        let (mut a, _a_rx) = connect(&h, None);
        assert!(matches!(a.get_rtp_capabilities(), Err(CoordinatorError::RoomNotFound(_))));
        a.join_room().await.unwrap();
        let caps = a.get_rtp_capabilities().unwrap().rtp_capabilities;
        assert_eq!(caps["codecs"].as_array().map(Vec::len), Some(2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_host_applications_have_one_winner() {
        let h = harness();
        let mut sessions = Vec::new();
        for i in 0..8 {
            let (mut session, rx) = connect(&h, Some(&format!("user-{i}")));
            session.join_room().await.unwrap();
            sessions.push((session, rx));
        }
        assert_eq!(h.coordinator.registry().host("s"), None);

        let handles: Vec<_> = sessions
            .into_iter()
            .map(|(session, rx)| {
                tokio::spawn(async move {
                    let granted = session.host_application().await.unwrap().granted;
                    (granted, session, rx)
                })
            })
            .collect();

        let mut winners = Vec::new();
        let mut keep = Vec::new();
        for handle in handles {
            let (granted, session, rx) = handle.await.unwrap();
            if granted {
                winners.push(session.client_id().to_string());
            }
            keep.push((session, rx));
        }
        assert_eq!(winners.len(), 1);
        assert_eq!(h.coordinator.registry().host("s").as_ref(), winners.first());
        let record = h.store.find_session("s").await.unwrap().unwrap();
        assert_eq!(record.host_conn_id.as_ref(), winners.first());
    }

    #[tokio::test]
    async fn test_anonymous_host_application_is_rejected() {
        let h = harness();
        let (mut a, _a_rx) = connect(&h, None);
        a.join_room().await.unwrap();
        let response = a.dispatch(serde_json::from_str(r#"{"id":1,"type":"host_application"}"#).unwrap()).await;
        assert_eq!(serde_json::to_value(&response).unwrap()["error"]["code"], "unauthorized");
    }

    #[tokio::test(start_paused = true)]
    async fn test_hostless_session_is_deleted_after_grace() {
        let h = harness();
        let (mut a, _a_rx) = connect(&h, Some("owner"));
        a.join_room().await.unwrap();
        let (mut b, mut b_rx, b_send) = publisher(&h, None).await;
        b.produce(&b_send, MediaKind::Audio, rtp(), None).await.unwrap();

        a.disconnect().await;
        assert!(types(&drain(&mut b_rx)).contains(&"host_left"));

        tokio::time::sleep(Duration::from_secs(11)).await;
        settle().await;

        let b_msgs = drain(&mut b_rx);
        assert_eq!(b_msgs, vec![json!({ "type": "session_deleted", "sessionId": "s" })]);
        assert_eq!(h.store.deletions(), 1);
        assert!(!h.coordinator.registry().has_room("s"));
        assert_eq!(h.engine.router_count(), 0);
        assert_eq!(h.engine.producer_count(), 0);
        assert_eq!(h.coordinator.metrics().get(Counter::SessionsDeleted), 1);

        // The connection still winds down normally
        b.disconnect().await;
        assert_eq!(h.store.deletions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_host_within_grace_keeps_the_session() {
        let h = harness();
        let (mut a, _a_rx) = connect(&h, Some("owner"));
        a.join_room().await.unwrap();
        let (mut b, mut b_rx) = connect(&h, Some("user-b"));
        b.join_room().await.unwrap();

        a.disconnect().await;
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(b.host_application().await.unwrap().granted);
        assert!(!b.host_application().await.unwrap().granted);

        tokio::time::sleep(Duration::from_secs(20)).await;
        settle().await;

        let b_msgs = drain(&mut b_rx);
        assert_eq!(types(&b_msgs), vec!["remove_client", "host_left", "new_host"]);
        assert_eq!(b_msgs[2]["connId"], b.client_id());
        assert_eq!(h.store.deletions(), 0);
        assert!(h.coordinator.registry().has_room("s"));
        assert_eq!(h.coordinator.metrics().get(Counter::HostChanges), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_owner_rejoining_reclaims_host() {
        let h = harness();
        let (mut a, _a_rx) = connect(&h, Some("owner"));
        a.join_room().await.unwrap();
        let (mut b, _b_rx) = connect(&h, None);
        b.join_room().await.unwrap();
        a.disconnect().await;

        let (mut a2, _a2_rx) = connect(&h, Some("owner"));
        a2.join_room().await.unwrap();
        assert_eq!(h.coordinator.registry().host("s").as_deref(), Some(a2.client_id()));

        tokio::time::sleep(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(h.store.deletions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_session_cancels_grace_timer() {
        let h = harness();
        let (mut a, _a_rx) = connect(&h, Some("owner"));
        a.join_room().await.unwrap();
        let (mut b, mut b_rx) = connect(&h, None);
        b.join_room().await.unwrap();
        a.disconnect().await;
        assert!(h.coordinator.host_election().has_pending_expiry("s"));
        drain(&mut b_rx);

        assert!(h.coordinator.end_session("s").await.unwrap());
        assert!(!h.coordinator.host_election().has_pending_expiry("s"));
        assert_eq!(types(&drain(&mut b_rx)), vec!["session_deleted"]);
        assert!(!h.coordinator.registry().has_room("s"));

        tokio::time::sleep(Duration::from_secs(20)).await;
        settle().await;
        assert_eq!(h.store.deletions(), 1);
        assert_eq!(h.coordinator.metrics().get(Counter::SessionsDeleted), 1);
        assert!(!h.coordinator.end_session("s").await.unwrap());
    }

    #[tokio::test]
    async fn test_join_racing_last_departure_keeps_the_router() {
        let h = harness();
        let registry = h.coordinator.registry();
        let (mut a, _a_rx) = connect(&h, None);
        a.join_room().await.unwrap();
        assert_eq!(h.engine.router_count(), 1);

        // Last client is gone from the room, disposal has not run yet
        registry.remove_client("s", a.client_id()).unwrap();
        assert!(registry.finish_client_removal("s", a.client_id()));

        let (mut b, _b_rx) = connect(&h, None);
        b.join_room().await.unwrap();

        h.coordinator.close_room_if_empty("s").await;
        assert!(registry.has_room("s"));
        assert_eq!(h.engine.router_count(), 1);
        let transport = b.create_transport(TransportDirection::Recv).await.unwrap();
        assert!(h.engine.has_transport(&transport.id));
        assert!(b.get_rtp_capabilities().is_ok());

        // Once the room really is disposed of, the next join builds a fresh one
        b.disconnect().await;
        assert!(!registry.has_room("s"));
        assert_eq!(h.engine.router_count(), 0);

        let (mut c, _c_rx) = connect(&h, None);
        c.join_room().await.unwrap();
        assert_eq!(h.engine.router_count(), 1);
        assert_eq!(registry.client_count_for_room("s"), 1);
    }

    #[tokio::test]
    async fn test_engine_closed_transport_runs_cleanup() {
        let h = harness();
        let (a, mut a_rx, send) = publisher(&h, Some("owner")).await;
        let p1 = a.produce(&send, MediaKind::Video, rtp(), None).await.unwrap().id;
        let (mut b, mut b_rx) = connect(&h, None);
        b.join_room().await.unwrap();
        let recv = b.create_transport(TransportDirection::Recv).await.unwrap();
        let consumer = b.consume(&recv.id, &p1, caps_all()).await.unwrap().params.id;
        drain(&mut a_rx);
        drain(&mut b_rx);

        h.engine.close_transport_externally(&send);
        settle().await;

        // The owner learns its producer is gone too
        assert_eq!(drain(&mut a_rx), vec![json!({ "type": "producer_closed", "producerId": p1 })]);

        assert!(h.coordinator.registry().producer("s", &p1).is_none());
        assert!(h.coordinator.registry().client_producers("s", a.client_id()).is_empty());
        assert_eq!(h.engine.is_consumer_paused(&consumer), None);
        assert_eq!(types(&drain(&mut b_rx)), vec!["producer_closed"]);
        assert!(matches!(
            a.produce(&send, MediaKind::Video, rtp(), None).await,
            Err(CoordinatorError::TransportNotFound(_))
        ));
        assert!(h.coordinator.metrics().get(Counter::EngineEvents) >= 1);

        // Client itself is unaffected
        assert_eq!(h.coordinator.registry().client_state("s", a.client_id()), Some(ClientState::Active));
    }
}
