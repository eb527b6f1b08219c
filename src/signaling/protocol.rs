#![forbid(unsafe_code)]

// Signaling protocol - Message types for WebSocket communication

use crate::error::CoordinatorError;
use crate::media::types::{ConsumerParams, MediaKind, TransportDirection};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A client request. `id` is echoed back on the matching response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRequest {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(flatten)]
    pub message: ClientMessage,
}

/// Client-to-Server messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join the session the connection was opened for
    JoinStreamRoom,
    GetRtpCapabilities,
    /// Current producers of the room, same shape as the join response
    GetProducers,
    CreateTransport {
        direction: TransportDirection,
    },
    #[serde(rename_all = "camelCase")]
    ConnectTransport {
        transport_id: String,
        dtls_parameters: Value,
    },
    #[serde(rename_all = "camelCase")]
    Produce {
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: Value,
        #[serde(default)]
        app_data: Option<Value>,
    },
    #[serde(rename_all = "camelCase")]
    Consume {
        transport_id: String,
        producer_id: String,
        rtp_capabilities: Value,
    },
    /// Pause a producer (mute). `kind` is informational; the stored kind is authoritative.
    #[serde(rename_all = "camelCase")]
    PauseProducer {
        producer_id: String,
        #[serde(default)]
        kind: Option<MediaKind>,
    },
    #[serde(rename_all = "camelCase")]
    ResumeProducer {
        producer_id: String,
        #[serde(default)]
        kind: Option<MediaKind>,
    },
    #[serde(rename_all = "camelCase")]
    PauseConsumer {
        consumer_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ResumeConsumer {
        consumer_id: String,
    },
    /// Ask to become host of a session that currently has none
    HostApplication,
    /// Leave the room; same effect as closing the connection
    Leave,
}

/// Server-to-Client messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Reply to a request; exactly one of `data` / `error` is set
    #[serde(rename = "response")]
    Response {
        id: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },
    /// New producer available from another client
    #[serde(rename = "new_producer", rename_all = "camelCase")]
    NewProducer {
        producer_id: String,
        kind: MediaKind,
        app_data: Value,
    },
    #[serde(rename = "producer-paused", rename_all = "camelCase")]
    ProducerPaused {
        client_id: String,
        producer_id: String,
        kind: MediaKind,
    },
    #[serde(rename = "producer-resumed", rename_all = "camelCase")]
    ProducerResumed {
        client_id: String,
        producer_id: String,
        kind: MediaKind,
    },
    #[serde(rename = "consumer-paused", rename_all = "camelCase")]
    ConsumerPaused {
        consumer_id: String,
    },
    #[serde(rename = "consumer-resumed", rename_all = "camelCase")]
    ConsumerResumed {
        consumer_id: String,
    },
    /// Producer left the room; consumers of it are gone
    #[serde(rename = "producer_closed", rename_all = "camelCase")]
    ProducerClosed {
        producer_id: String,
    },
    /// Client left the room
    #[serde(rename = "remove_client", rename_all = "camelCase")]
    RemoveClient {
        client_id: String,
    },
    #[serde(rename = "new_host", rename_all = "camelCase")]
    NewHost {
        conn_id: String,
    },
    #[serde(rename = "host_left", rename_all = "camelCase")]
    HostLeft {
        conn_id: String,
    },
    /// The host never came back; the session is gone
    #[serde(rename = "session_deleted", rename_all = "camelCase")]
    SessionDeleted {
        session_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl ServerMessage {
    pub fn ok(id: Option<u64>, data: Value) -> Self {
        ServerMessage::Response {
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<u64>, err: &CoordinatorError) -> Self {
        ServerMessage::Response {
            id,
            data: None,
            error: Some(ErrorBody {
                code: err.code().to_string(),
                message: err.to_string(),
            }),
        }
    }
}

/// Producer information as listed to joining clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerDescriptor {
    pub producer_id: String,
    pub client_id: String,
    pub kind: MediaKind,
    pub app_data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinResponse {
    /// Connection id assigned to this client
    pub id: String,
    pub router_rtp_capabilities: Value,
    pub producers: Vec<ProducerDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilitiesResponse {
    pub rtp_capabilities: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducersResponse {
    pub producers: Vec<ProducerDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProduceResponse {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumeResponse {
    pub params: ConsumerParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostApplicationResponse {
    pub granted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_parsing() {
        let req: ClientRequest = serde_json::from_value(json!({
            "id": 7,
            "type": "connect_transport",
            "transportId": "t1",
            "dtlsParameters": { "role": "client" }
        }))
        .unwrap();
        assert_eq!(req.id, Some(7));
        assert!(matches!(
            req.message,
            ClientMessage::ConnectTransport { ref transport_id, .. } if transport_id == "t1"
        ));

        let req: ClientRequest = serde_json::from_str(r#"{"type":"join_stream_room"}"#).unwrap();
        assert_eq!(req.id, None);
        assert!(matches!(req.message, ClientMessage::JoinStreamRoom));

        let req: ClientRequest =
            serde_json::from_str(r#"{"id":1,"type":"pause_producer","producerId":"p1","kind":"video"}"#).unwrap();
        assert!(matches!(req.message, ClientMessage::PauseProducer { kind: Some(MediaKind::Video), .. }));
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let result = serde_json::from_str::<ClientRequest>(r#"{"id":1,"type":"restart_everything"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_broadcast_wire_names() {
        let msg = ServerMessage::ProducerPaused {
            client_id: "c1".into(),
            producer_id: "p1".into(),
            kind: MediaKind::Audio,
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({ "type": "producer-paused", "clientId": "c1", "producerId": "p1", "kind": "audio" })
        );

        let msg = ServerMessage::NewHost { conn_id: "c2".into() };
        assert_eq!(serde_json::to_value(&msg).unwrap(), json!({ "type": "new_host", "connId": "c2" }));
    }

    #[test]
    fn test_error_response_shape() {
        let err = CoordinatorError::TransportNotFound("t9".into());
        let value = serde_json::to_value(ServerMessage::error(Some(3), &err)).unwrap();
        assert_eq!(value["type"], "response");
        assert_eq!(value["id"], 3);
        assert_eq!(value["error"]["code"], "transport_not_found");
        assert!(value.get("data").is_none());
    }
}
