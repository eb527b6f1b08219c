#![forbid(unsafe_code)]

// Common types and error handling for the media engine adapter.
// Engine parameters (ICE, DTLS, RTP) cross this boundary as opaque JSON.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub type SessionId = String;
pub type ClientId = String;
pub type TransportId = String;
pub type ProducerId = String;
pub type ConsumerId = String;

/// Custom error type for media engine operations
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Worker error: {0}")]
    WorkerError(String),

    #[error("Router error: {0}")]
    RouterError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Producer error: {0}")]
    ProducerError(String),

    #[error("Consumer error: {0}")]
    ConsumerError(String),

    #[error("Router not found for session: {0}")]
    RouterNotFound(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
}

/// Result type alias for media operations
pub type MediaResult<T> = Result<T, MediaError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

/// Connection parameters of a freshly created transport, returned to the client as-is
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub id: TransportId,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
}

/// Parameters the client needs to attach a consumer to its receive transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerParams {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    pub app_data: Value,
}

/// Typed producer metadata. Replaces free-form appData as the source of
/// ownership and pause state; client extras are carried alongside.
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerMetadata {
    pub owner_client_id: ClientId,
    pub paused: bool,
    pub extra: Map<String, Value>,
}

const RESERVED_APP_DATA_KEYS: [&str; 3] = ["clientId", "paused", "id"];

impl ProducerMetadata {
    /// Builds metadata for a new producer from client-supplied appData.
    /// Anything but an object (or null) is rejected; reserved keys are dropped.
    pub fn from_client_app_data(owner_client_id: &str, app_data: Option<Value>) -> MediaResult<Self> {
        let mut extra = match app_data {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map,
            Some(other) => {
                return Err(MediaError::InvalidParameters(format!(
                    "appData must be an object, got {other}"
                )))
            }
        };
        for key in RESERVED_APP_DATA_KEYS {
            extra.remove(key);
        }
        Ok(Self {
            owner_client_id: owner_client_id.to_string(),
            paused: true,
            extra,
        })
    }

    /// Wire form: `{"clientId", "paused", ...extras}`
    pub fn to_app_data(&self) -> Value {
        let mut map = self.extra.clone();
        map.insert("clientId".to_string(), Value::String(self.owner_client_id.clone()));
        map.insert("paused".to_string(), Value::Bool(self.paused));
        Value::Object(map)
    }
}

/// Asynchronous notifications from the engine about objects it closed on its own
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    TransportClosed { session_id: SessionId, transport_id: TransportId },
    ProducerClosed { session_id: SessionId, producer_id: ProducerId },
    ConsumerClosed { session_id: SessionId, consumer_id: ConsumerId },
}
