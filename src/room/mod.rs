#![forbid(unsafe_code)]

// Room module - Room Registry
// Tracks, per session, the connected clients and which transports, producers and
// consumers each of them owns. Engine objects are referenced here by id only.

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::media::types::{
    ClientId, ConsumerId, ConsumerParams, MediaKind, ProducerId, ProducerMetadata, SessionId,
    TransportDirection, TransportId,
};
use crate::signaling::protocol::{ProducerDescriptor, ServerMessage};
use std::collections::HashMap;
use std::sync::RwLock as StdRwLock;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Lifecycle of a client inside its room. A removed client is gone for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Joining,
    Active,
    Leaving,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub struct TransportRecord {
    pub direction: TransportDirection,
    pub state: TransportState,
}

#[derive(Debug, Clone)]
pub struct ProducerRecord {
    pub id: ProducerId,
    pub owner: ClientId,
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub metadata: ProducerMetadata,
}

#[derive(Debug, Clone)]
pub struct ConsumerRecord {
    pub id: ConsumerId,
    pub owner: ClientId,
    pub transport_id: TransportId,
    pub producer_id: ProducerId,
    pub params: ConsumerParams,
}

/// Client connected to a room
pub struct Client {
    pub id: ClientId,
    pub user_id: Option<String>,
    sender: mpsc::Sender<Arc<String>>,
    state: ClientState,
    transports: HashMap<TransportId, TransportRecord>,
    audio_producer: Option<ProducerId>,
    video_producer: Option<ProducerId>,
    /// producer id -> consumer id; one consumer per pairing
    consumers: HashMap<ProducerId, ConsumerId>,
}

impl Client {
    fn producer_slot(&mut self, kind: MediaKind) -> &mut Option<ProducerId> {
        match kind {
            MediaKind::Audio => &mut self.audio_producer,
            MediaKind::Video => &mut self.video_producer,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    fn is_live(&self) -> bool {
        self.state != ClientState::Leaving
    }
}

/// Everything a departing client owned, in the order it has to be closed
#[derive(Debug, Clone, Default)]
pub struct ClientSnapshot {
    pub client_id: ClientId,
    pub user_id: Option<String>,
    pub was_host: bool,
    pub producers: Vec<ProducerId>,
    /// The client's own consumers plus peers' consumers of its producers
    pub consumers: Vec<ConsumerId>,
    pub transports: Vec<TransportId>,
}

/// A producer taken out of the room together with the consumers that fed from it
#[derive(Debug, Clone, PartialEq)]
pub struct RemovedProducer {
    pub producer_id: ProducerId,
    pub consumer_ids: Vec<ConsumerId>,
}

/// A transport taken out of the room together with everything that ran over it
#[derive(Debug, Clone)]
pub struct RemovedTransport {
    pub owner: ClientId,
    pub producers: Vec<RemovedProducer>,
    pub consumer_ids: Vec<ConsumerId>,
}

/// Outcome of the bookkeeping half of `consume`
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumeStep {
    /// The pairing already exists; nothing to create
    Existing(ConsumerParams),
    Create,
}

/// Room state
pub struct Room {
    pub id: SessionId,
    clients: HashMap<ClientId, Client>,
    producers: HashMap<ProducerId, ProducerRecord>,
    consumers: HashMap<ConsumerId, ConsumerRecord>,
    transport_owners: HashMap<TransportId, ClientId>,
    host: Option<ClientId>,
    /// Set once the room has been taken out of the registry
    closed: bool,
}

impl Room {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            clients: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
            transport_owners: HashMap::new(),
            host: None,
            closed: false,
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    fn deliver(&self, message: &ServerMessage, mut filter: impl FnMut(&str) -> bool) {
        let json = match serde_json::to_string(message) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!("Failed to serialize broadcast message: {}", e);
                return;
            }
        };
        for (id, client) in &self.clients {
            if client.state != ClientState::Active || !filter(id.as_str()) {
                continue;
            }
            match client.sender.try_send(json.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Channel full for client {} in room {}, dropping message", id, self.id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Channel closed for client {} in room {} (disconnected)", id, self.id);
                }
            }
        }
    }

    /// Broadcast a message to all active clients except the sender
    fn broadcast_except(&self, sender_id: &str, message: &ServerMessage) {
        self.deliver(message, |id| id != sender_id);
    }

    /// Broadcast a message to all active clients
    fn broadcast_all(&self, message: &ServerMessage) {
        self.deliver(message, |_| true);
    }

    fn active_client_mut(&mut self, client_id: &str) -> CoordinatorResult<&mut Client> {
        match self.clients.get_mut(client_id) {
            Some(client) if client.state == ClientState::Active => Ok(client),
            _ => Err(CoordinatorError::ClientNotFound(client_id.to_string())),
        }
    }

    fn active_client(&self, client_id: &str) -> CoordinatorResult<&Client> {
        match self.clients.get(client_id) {
            Some(client) if client.state == ClientState::Active => Ok(client),
            _ => Err(CoordinatorError::ClientNotFound(client_id.to_string())),
        }
    }

    /// Ownership check for a transport id
    fn owned_transport(&self, client_id: &str, transport_id: &str) -> CoordinatorResult<&TransportRecord> {
        let client = self.active_client(client_id)?;
        match self.transport_owners.get(transport_id) {
            None => Err(CoordinatorError::TransportNotFound(transport_id.to_string())),
            Some(owner) if owner != client_id => {
                Err(CoordinatorError::Unauthorized(format!("transport {transport_id}")))
            }
            Some(_) => client
                .transports
                .get(transport_id)
                .ok_or_else(|| CoordinatorError::TransportNotFound(transport_id.to_string())),
        }
    }

    fn producer_descriptors(&self) -> Vec<ProducerDescriptor> {
        self.producers
            .values()
            .map(|p| ProducerDescriptor {
                producer_id: p.id.clone(),
                client_id: p.owner.clone(),
                kind: p.kind,
                app_data: p.metadata.to_app_data(),
            })
            .collect()
    }

    fn detach_consumer(&mut self, consumer_id: &str) -> Option<ConsumerRecord> {
        let record = self.consumers.remove(consumer_id)?;
        if let Some(owner) = self.clients.get_mut(&record.owner) {
            if owner.consumers.get(&record.producer_id).map(String::as_str) == Some(consumer_id) {
                owner.consumers.remove(&record.producer_id);
            }
        }
        Some(record)
    }

    /// Takes a producer and every consumer of it out of the room and tells the peers
    fn detach_producer(&mut self, producer_id: &str) -> Option<RemovedProducer> {
        let record = self.producers.remove(producer_id)?;
        if let Some(owner) = self.clients.get_mut(&record.owner) {
            let slot = owner.producer_slot(record.kind);
            if slot.as_deref() == Some(producer_id) {
                *slot = None;
            }
        }

        let orphaned: Vec<ConsumerId> = self
            .consumers
            .values()
            .filter(|c| c.producer_id == producer_id)
            .map(|c| c.id.clone())
            .collect();
        for consumer_id in &orphaned {
            self.detach_consumer(consumer_id);
        }

        self.broadcast_except(&record.owner, &ServerMessage::ProducerClosed {
            producer_id: producer_id.to_string(),
        });

        Some(RemovedProducer {
            producer_id: producer_id.to_string(),
            consumer_ids: orphaned,
        })
    }
}

/// Manages all rooms.
///
/// The outer HashMap is protected by a std::sync::RwLock held only for brief
/// lookups and inserts. Each room sits behind its own std::sync::Mutex; every
/// method here is synchronous, so no room lock is ever held across an await.
pub struct RoomRegistry {
    rooms: StdRwLock<HashMap<SessionId, Arc<StdMutex<Room>>>>,
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: StdRwLock::new(HashMap::new()),
        }
    }

    /// Gets a room lock by ID (brief outer read lock)
    fn get_room(&self, session_id: &str) -> CoordinatorResult<Arc<StdMutex<Room>>> {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms
            .get(session_id)
            .cloned()
            .ok_or_else(|| CoordinatorError::RoomNotFound(session_id.to_string()))
    }

    /// Runs `f` with the room locked
    fn with_room<T>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut Room) -> CoordinatorResult<T>,
    ) -> CoordinatorResult<T> {
        let room_lock = self.get_room(session_id)?;
        let mut room = room_lock.lock().unwrap_or_else(|e| e.into_inner());
        if room.closed {
            return Err(CoordinatorError::RoomNotFound(session_id.to_string()));
        }
        f(&mut room)
    }

    /// Gets or creates a room. Idempotent.
    pub fn get_or_create_room(&self, session_id: &str) -> Arc<StdMutex<Room>> {
        {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            if let Some(room) = rooms.get(session_id) {
                return room.clone();
            }
        }
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        rooms
            .entry(session_id.to_string())
            .or_insert_with(|| {
                info!("Created room {}", session_id);
                Arc::new(StdMutex::new(Room::new(session_id)))
            })
            .clone()
    }

    pub fn has_room(&self, session_id: &str) -> bool {
        self.rooms.read().unwrap_or_else(|e| e.into_inner()).contains_key(session_id)
    }

    /// Adds a client in the `Joining` state, creating the room on first use
    pub fn register_client(
        &self,
        session_id: &str,
        client_id: &str,
        user_id: Option<String>,
        sender: mpsc::Sender<Arc<String>>,
    ) -> CoordinatorResult<()> {
        loop {
            let room_lock = self.get_or_create_room(session_id);
            let mut room = room_lock.lock().unwrap_or_else(|e| e.into_inner());
            // Lost a race with removal of an empty room; retry on a fresh one
            if room.closed {
                continue;
            }
            if room.clients.contains_key(client_id) {
                return Err(CoordinatorError::InvalidRequest(format!("client {client_id} already joined")));
            }
            room.clients.insert(client_id.to_string(), Client {
                id: client_id.to_string(),
                user_id,
                sender,
                state: ClientState::Joining,
                transports: HashMap::new(),
                audio_producer: None,
                video_producer: None,
                consumers: HashMap::new(),
            });
            info!("Client {} joining room {} ({} clients)", client_id, session_id, room.clients.len());
            return Ok(());
        }
    }

    /// Moves a joining client to `Active` and returns the producers it should consume.
    /// Both happen under one lock, so the client sees every producer exactly once:
    /// either in this list or as a later `new_producer` broadcast.
    pub fn activate_client(&self, session_id: &str, client_id: &str) -> CoordinatorResult<Vec<ProducerDescriptor>> {
        self.with_room(session_id, |room| {
            let client = room
                .clients
                .get_mut(client_id)
                .filter(|c| c.state == ClientState::Joining)
                .ok_or_else(|| CoordinatorError::ClientNotFound(client_id.to_string()))?;
            client.state = ClientState::Active;
            Ok(room.producer_descriptors())
        })
    }

    pub fn list_producers(&self, session_id: &str) -> CoordinatorResult<Vec<ProducerDescriptor>> {
        self.with_room(session_id, |room| Ok(room.producer_descriptors()))
    }

    /// Starts removing a client: marks it `Leaving`, takes its objects (and peers'
    /// consumers of its producers) out of the room, clears the host seat if it held
    /// it and notifies the others. Returns `None` if the client is unknown or already
    /// leaving. The entry itself stays until [`RoomRegistry::finish_client_removal`].
    pub fn remove_client(&self, session_id: &str, client_id: &str) -> Option<ClientSnapshot> {
        self.with_room(session_id, |room| {
            let client = match room.clients.get_mut(client_id) {
                Some(client) if client.is_live() => client,
                _ => return Ok(None),
            };
            client.state = ClientState::Leaving;
            let user_id = client.user_id.clone();
            let transports: Vec<TransportId> = client.transports.keys().cloned().collect();
            let own_consumers: Vec<ConsumerId> = client.consumers.values().cloned().collect();
            let own_producers: Vec<ProducerId> =
                [client.audio_producer.clone(), client.video_producer.clone()].into_iter().flatten().collect();

            let mut snapshot = ClientSnapshot {
                client_id: client_id.to_string(),
                user_id,
                ..ClientSnapshot::default()
            };

            for producer_id in &own_producers {
                if let Some(removed) = room.detach_producer(producer_id) {
                    snapshot.producers.push(removed.producer_id);
                    snapshot.consumers.extend(removed.consumer_ids);
                }
            }
            for consumer_id in own_consumers {
                if room.detach_consumer(&consumer_id).is_some() {
                    snapshot.consumers.push(consumer_id);
                }
            }
            for transport_id in &transports {
                room.transport_owners.remove(transport_id);
            }
            if let Some(client) = room.clients.get_mut(client_id) {
                client.transports.clear();
            }
            snapshot.transports = transports;

            if room.host.as_deref() == Some(client_id) {
                room.host = None;
                snapshot.was_host = true;
            }

            room.broadcast_except(client_id, &ServerMessage::RemoveClient {
                client_id: client_id.to_string(),
            });

            info!(
                "Client {} leaving room {} ({} producers, {} consumers, {} transports)",
                client_id,
                session_id,
                snapshot.producers.len(),
                snapshot.consumers.len(),
                snapshot.transports.len()
            );
            Ok(Some(snapshot))
        })
        .ok()
        .flatten()
    }

    /// Drops a leaving client's entry. Returns true if the room is now empty.
    pub fn finish_client_removal(&self, session_id: &str, client_id: &str) -> bool {
        self.with_room(session_id, |room| {
            room.clients.remove(client_id);
            debug!("Client {} gone from room {}", client_id, session_id);
            Ok(room.clients.is_empty())
        })
        .unwrap_or(false)
    }

    /// Removes the room if nobody is in it. Returns true if it was removed.
    pub fn remove_room_if_empty(&self, session_id: &str) -> bool {
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        let Some(room_lock) = rooms.get(session_id).cloned() else {
            return false;
        };
        let mut room = room_lock.lock().unwrap_or_else(|e| e.into_inner());
        if !room.clients.is_empty() {
            return false;
        }
        room.closed = true;
        rooms.remove(session_id);
        info!("Room {} is empty, cleaning up", session_id);
        true
    }

    // -- transports --

    pub fn add_transport(
        &self,
        session_id: &str,
        client_id: &str,
        transport_id: &str,
        direction: TransportDirection,
    ) -> CoordinatorResult<()> {
        self.with_room(session_id, |room| {
            let client = room.active_client_mut(client_id)?;
            client.transports.insert(transport_id.to_string(), TransportRecord {
                direction,
                state: TransportState::New,
            });
            room.transport_owners.insert(transport_id.to_string(), client_id.to_string());
            Ok(())
        })
    }

    /// Ownership check for a transport
    pub fn check_transport_owner(&self, session_id: &str, client_id: &str, transport_id: &str) -> CoordinatorResult<TransportDirection> {
        self.with_room(session_id, |room| {
            room.owned_transport(client_id, transport_id).map(|t| t.direction)
        })
    }

    /// Marks a transport as connecting. Returns false if a connect already happened
    /// or is in flight, in which case the engine must not be called again.
    pub fn begin_connect(&self, session_id: &str, client_id: &str, transport_id: &str) -> CoordinatorResult<bool> {
        self.with_room(session_id, |room| {
            room.owned_transport(client_id, transport_id)?;
            let record = room
                .active_client_mut(client_id)?
                .transports
                .get_mut(transport_id)
                .ok_or_else(|| CoordinatorError::TransportNotFound(transport_id.to_string()))?;
            if record.state != TransportState::New {
                return Ok(false);
            }
            record.state = TransportState::Connecting;
            Ok(true)
        })
    }

    /// Records the engine's answer to a connect started by `begin_connect`
    pub fn complete_connect(&self, session_id: &str, client_id: &str, transport_id: &str, connected: bool) {
        let _ = self.with_room(session_id, |room| {
            if let Some(record) = room
                .clients
                .get_mut(client_id)
                .and_then(|c| c.transports.get_mut(transport_id))
            {
                record.state = if connected { TransportState::Connected } else { TransportState::New };
            }
            Ok(())
        });
    }

    pub fn transport_state(&self, session_id: &str, client_id: &str, transport_id: &str) -> Option<TransportState> {
        self.with_room(session_id, |room| {
            Ok(room
                .clients
                .get(client_id)
                .and_then(|c| c.transports.get(transport_id))
                .map(|t| t.state))
        })
        .ok()
        .flatten()
    }

    /// Takes a transport closed by the engine out of the room, with its producers and consumers
    pub fn remove_transport(&self, session_id: &str, transport_id: &str) -> Option<RemovedTransport> {
        self.with_room(session_id, |room| {
            let Some(owner) = room.transport_owners.remove(transport_id) else {
                return Ok(None);
            };
            if let Some(client) = room.clients.get_mut(&owner) {
                client.transports.remove(transport_id);
            }

            let producer_ids: Vec<ProducerId> = room
                .producers
                .values()
                .filter(|p| p.transport_id == transport_id)
                .map(|p| p.id.clone())
                .collect();
            let producers: Vec<RemovedProducer> =
                producer_ids.iter().filter_map(|id| room.detach_producer(id)).collect();

            let consumer_ids: Vec<ConsumerId> = room
                .consumers
                .values()
                .filter(|c| c.transport_id == transport_id)
                .map(|c| c.id.clone())
                .collect();
            for consumer_id in &consumer_ids {
                room.detach_consumer(consumer_id);
            }

            Ok(Some(RemovedTransport {
                owner,
                producers,
                consumer_ids,
            }))
        })
        .ok()
        .flatten()
    }

    // -- producers --

    /// Checks that `produce` may run on `transport_id` and returns the client's
    /// current producer of `kind`, which has to be closed first
    pub fn begin_produce(
        &self,
        session_id: &str,
        client_id: &str,
        transport_id: &str,
        kind: MediaKind,
    ) -> CoordinatorResult<Option<ProducerId>> {
        self.with_room(session_id, |room| {
            let transport = room.owned_transport(client_id, transport_id)?;
            if transport.direction != TransportDirection::Send {
                return Err(CoordinatorError::InvalidRequest(format!(
                    "transport {transport_id} is not a send transport"
                )));
            }
            let client = room.active_client_mut(client_id)?;
            Ok(client.producer_slot(kind).clone())
        })
    }

    /// Records a producer created by the engine and announces it to the other clients.
    /// A producer of the same kind still held by the client is displaced and returned.
    pub fn commit_producer(&self, session_id: &str, record: ProducerRecord) -> CoordinatorResult<Option<RemovedProducer>> {
        self.with_room(session_id, |room| {
            room.owned_transport(&record.owner, &record.transport_id)?;
            let client = room.active_client_mut(&record.owner)?;
            let previous = client.producer_slot(record.kind).replace(record.id.clone());

            let displaced = previous.and_then(|id| room.detach_producer(&id));

            room.broadcast_except(&record.owner, &ServerMessage::NewProducer {
                producer_id: record.id.clone(),
                kind: record.kind,
                app_data: record.metadata.to_app_data(),
            });
            info!("Client {} producing {} ({}) in room {}", record.owner, record.id, record.kind.as_str(), session_id);
            room.producers.insert(record.id.clone(), record);
            Ok(displaced)
        })
    }

    /// Ownership check for a producer; returns its kind
    pub fn check_producer_owner(&self, session_id: &str, client_id: &str, producer_id: &str) -> CoordinatorResult<MediaKind> {
        self.with_room(session_id, |room| {
            room.active_client(client_id)?;
            match room.producers.get(producer_id) {
                None => Err(CoordinatorError::ProducerNotFound(producer_id.to_string())),
                Some(p) if p.owner != client_id => {
                    Err(CoordinatorError::Unauthorized(format!("producer {producer_id}")))
                }
                Some(p) => Ok(p.kind),
            }
        })
    }

    /// Stores the pause flag and tells the other clients
    pub fn set_producer_paused(
        &self,
        session_id: &str,
        client_id: &str,
        producer_id: &str,
        paused: bool,
    ) -> CoordinatorResult<()> {
        self.with_room(session_id, |room| {
            let record = room
                .producers
                .get_mut(producer_id)
                .filter(|p| p.owner == client_id)
                .ok_or_else(|| CoordinatorError::ProducerNotFound(producer_id.to_string()))?;
            record.metadata.paused = paused;
            let kind = record.kind;

            let message = if paused {
                ServerMessage::ProducerPaused {
                    client_id: client_id.to_string(),
                    producer_id: producer_id.to_string(),
                    kind,
                }
            } else {
                ServerMessage::ProducerResumed {
                    client_id: client_id.to_string(),
                    producer_id: producer_id.to_string(),
                    kind,
                }
            };
            room.broadcast_except(client_id, &message);
            Ok(())
        })
    }

    pub fn producer(&self, session_id: &str, producer_id: &str) -> Option<ProducerRecord> {
        self.with_room(session_id, |room| Ok(room.producers.get(producer_id).cloned()))
            .ok()
            .flatten()
    }

    /// Takes a producer out of the room (engine closed it, or it was replaced)
    pub fn remove_producer(&self, session_id: &str, producer_id: &str) -> Option<RemovedProducer> {
        self.with_room(session_id, |room| Ok(room.detach_producer(producer_id)))
            .ok()
            .flatten()
    }

    // -- consumers --

    pub fn begin_consume(
        &self,
        session_id: &str,
        client_id: &str,
        transport_id: &str,
        producer_id: &str,
    ) -> CoordinatorResult<ConsumeStep> {
        self.with_room(session_id, |room| {
            room.owned_transport(client_id, transport_id)?;
            if !room.producers.contains_key(producer_id) {
                return Err(CoordinatorError::ProducerNotFound(producer_id.to_string()));
            }
            let existing = room
                .active_client(client_id)?
                .consumers
                .get(producer_id)
                .and_then(|consumer_id| room.consumers.get(consumer_id));
            Ok(match existing {
                Some(record) => ConsumeStep::Existing(record.params.clone()),
                None => ConsumeStep::Create,
            })
        })
    }

    /// Records a consumer created by the engine. If the pairing was established in
    /// the meantime the stored consumer wins and `Existing` is returned; the caller
    /// then closes the one it just made.
    pub fn commit_consumer(&self, session_id: &str, record: ConsumerRecord) -> CoordinatorResult<ConsumeStep> {
        self.with_room(session_id, |room| {
            if !room.producers.contains_key(&record.producer_id) {
                return Err(CoordinatorError::ProducerNotFound(record.producer_id.clone()));
            }
            room.owned_transport(&record.owner, &record.transport_id)?;
            let existing = room
                .active_client(&record.owner)?
                .consumers
                .get(&record.producer_id)
                .and_then(|consumer_id| room.consumers.get(consumer_id));
            if let Some(existing) = existing {
                return Ok(ConsumeStep::Existing(existing.params.clone()));
            }
            room.active_client_mut(&record.owner)?
                .consumers
                .insert(record.producer_id.clone(), record.id.clone());
            debug!("Client {} consuming {} as {}", record.owner, record.producer_id, record.id);
            room.consumers.insert(record.id.clone(), record);
            Ok(ConsumeStep::Create)
        })
    }

    /// Ownership check for a consumer
    pub fn check_consumer_owner(&self, session_id: &str, client_id: &str, consumer_id: &str) -> CoordinatorResult<()> {
        self.with_room(session_id, |room| {
            room.active_client(client_id)?;
            match room.consumers.get(consumer_id) {
                None => Err(CoordinatorError::ConsumerNotFound(consumer_id.to_string())),
                Some(c) if c.owner != client_id => {
                    Err(CoordinatorError::Unauthorized(format!("consumer {consumer_id}")))
                }
                Some(_) => Ok(()),
            }
        })
    }

    /// Tells the other clients that a consumer was paused or resumed. The consumer
    /// must still belong to `client_id`.
    pub fn announce_consumer_paused(
        &self,
        session_id: &str,
        client_id: &str,
        consumer_id: &str,
        paused: bool,
    ) -> CoordinatorResult<()> {
        self.with_room(session_id, |room| {
            if !room.consumers.get(consumer_id).is_some_and(|c| c.owner == client_id) {
                return Err(CoordinatorError::ConsumerNotFound(consumer_id.to_string()));
            }
            let message = if paused {
                ServerMessage::ConsumerPaused { consumer_id: consumer_id.to_string() }
            } else {
                ServerMessage::ConsumerResumed { consumer_id: consumer_id.to_string() }
            };
            room.broadcast_except(client_id, &message);
            Ok(())
        })
    }

    pub fn remove_consumer(&self, session_id: &str, consumer_id: &str) -> bool {
        self.with_room(session_id, |room| Ok(room.detach_consumer(consumer_id).is_some()))
            .unwrap_or(false)
    }

    // -- host --

    pub fn host(&self, session_id: &str) -> Option<ClientId> {
        self.with_room(session_id, |room| Ok(room.host.clone())).ok().flatten()
    }

    /// A client that is joining or active (not leaving, not gone)
    pub fn is_live_client(&self, session_id: &str, client_id: &str) -> bool {
        self.with_room(session_id, |room| {
            Ok(room.clients.get(client_id).is_some_and(Client::is_live))
        })
        .unwrap_or(false)
    }

    /// Gives the host seat to `client_id` and announces it to everyone, the new
    /// host included. Never overwrites another holder; returns false instead.
    pub fn set_host(&self, session_id: &str, client_id: &str) -> CoordinatorResult<bool> {
        self.with_room(session_id, |room| {
            match room.clients.get(client_id) {
                Some(client) if client.is_live() => {}
                _ => return Err(CoordinatorError::ClientNotFound(client_id.to_string())),
            }
            match room.host.as_deref() {
                Some(current) if current == client_id => return Ok(true),
                Some(_) => return Ok(false),
                None => {}
            }
            room.host = Some(client_id.to_string());
            room.broadcast_all(&ServerMessage::NewHost {
                conn_id: client_id.to_string(),
            });
            info!("Client {} is now host of room {}", client_id, session_id);
            Ok(true)
        })
    }

    // -- room-wide --

    /// Sends a message to one active client of the room
    pub fn notify_client(&self, session_id: &str, client_id: &str, message: &ServerMessage) {
        let _ = self.with_room(session_id, |room| {
            room.deliver(message, |id| id == client_id);
            Ok(())
        });
    }

    pub fn broadcast_all(&self, session_id: &str, message: &ServerMessage) {
        let _ = self.with_room(session_id, |room| {
            room.broadcast_all(message);
            Ok(())
        });
    }

    pub fn client_ids(&self, session_id: &str) -> Vec<ClientId> {
        self.with_room(session_id, |room| Ok(room.clients.keys().cloned().collect()))
            .unwrap_or_default()
    }

    pub fn client_state(&self, session_id: &str, client_id: &str) -> Option<ClientState> {
        self.with_room(session_id, |room| Ok(room.clients.get(client_id).map(|c| c.state)))
            .ok()
            .flatten()
    }

    pub fn client_producers(&self, session_id: &str, client_id: &str) -> Vec<ProducerId> {
        self.with_room(session_id, |room| {
            Ok(room
                .clients
                .get(client_id)
                .map(|c| [c.audio_producer.clone(), c.video_producer.clone()].into_iter().flatten().collect())
                .unwrap_or_default())
        })
        .unwrap_or_default()
    }

    /// Gets current room count
    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Gets total client count across all rooms
    pub fn total_client_count(&self) -> usize {
        let room_locks: Vec<Arc<StdMutex<Room>>> = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.values().cloned().collect()
        };
        room_locks
            .iter()
            .map(|lock| lock.lock().unwrap_or_else(|e| e.into_inner()).client_count())
            .sum()
    }

    pub fn client_count_for_room(&self, session_id: &str) -> usize {
        self.with_room(session_id, |room| Ok(room.client_count())).unwrap_or(0)
    }
}
