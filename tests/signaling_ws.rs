// End-to-end signaling over a real WebSocket, backed by the in-memory engine and store

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use stream_coordinator::auth::jwt::create_token;
use stream_coordinator::config::ServerConfig;
use stream_coordinator::media::MemoryEngine;
use stream_coordinator::metrics::ServerMetrics;
use stream_coordinator::session::MemorySessionStore;
use stream_coordinator::signaling::{Coordinator, SignalingServer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const SECRET: &str = "integration-secret-at-least-32-bytes";

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server() -> SocketAddr {
    let (engine, events) = MemoryEngine::new();
    let store = Arc::new(MemorySessionStore::new());
    store.insert("s", "owner");

    let coordinator = Coordinator::new(
        Arc::new(engine),
        events,
        store,
        Duration::from_secs(10),
        ServerMetrics::new(),
    );
    let config = ServerConfig {
        jwt_secret: Some(SECRET.to_string()),
        ..ServerConfig::default()
    };
    let server = SignalingServer::new(coordinator, &config);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server.serve_listener(listener));
    addr
}

async fn open(addr: SocketAddr, user: Option<&str>) -> Ws {
    let url = match user {
        Some(user) => {
            let token = create_token(user, user, SECRET).unwrap();
            format!("ws://{addr}/ws/s?token={token}")
        }
        None => format!("ws://{addr}/ws/s"),
    };
    let (ws, _) = connect_async(url).await.unwrap();
    ws
}

async fn next_json(ws: &mut Ws) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a message")
            .expect("connection closed")
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Sends a request and returns its response; broadcasts seen meanwhile go to `events`
async fn request(ws: &mut Ws, id: u64, mut body: Value, events: &mut Vec<Value>) -> Value {
    body["id"] = json!(id);
    ws.send(Message::text(body.to_string())).await.unwrap();
    loop {
        let msg = next_json(ws).await;
        if msg["type"] == "response" && msg["id"] == id {
            return msg;
        }
        events.push(msg);
    }
}

async fn http_get(addr: SocketAddr, path: &str) -> String {
    http_request(addr, "GET", path, None).await
}

async fn http_request(addr: SocketAddr, method: &str, path: &str, bearer: Option<&str>) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let auth = bearer
        .map(|token| format!("Authorization: Bearer {token}\r\n"))
        .unwrap_or_default();
    let req = format!("{method} {path} HTTP/1.1\r\nHost: {addr}\r\n{auth}Connection: close\r\n\r\n");
    stream.write_all(req.as_bytes()).await.unwrap();
    let mut body = String::new();
    stream.read_to_string(&mut body).await.unwrap();
    body
}

#[tokio::test]
async fn test_publish_consume_and_host_failover() {
    let addr = start_server().await;
    let mut a_events = Vec::new();
    let mut b_events = Vec::new();

    let mut a = open(addr, Some("owner")).await;
    let joined = request(&mut a, 1, json!({ "type": "join_stream_room" }), &mut a_events).await;
    let a_id = joined["data"]["id"].as_str().unwrap().to_string();
    assert!(joined["data"]["routerRtpCapabilities"]["codecs"].is_array());
    assert_eq!(a_events, vec![json!({ "type": "new_host", "connId": a_id })]);

    let transport = request(&mut a, 2, json!({ "type": "create_transport", "direction": "send" }), &mut a_events).await;
    let send_id = transport["data"]["id"].as_str().unwrap().to_string();
    assert!(transport["data"]["iceParameters"].is_object());

    let connected = request(
        &mut a,
        3,
        json!({ "type": "connect_transport", "transportId": send_id, "dtlsParameters": { "role": "client" } }),
        &mut a_events,
    )
    .await;
    assert_eq!(connected["data"], json!({}));

    let produced = request(
        &mut a,
        4,
        json!({ "type": "produce", "transportId": send_id, "kind": "video", "rtpParameters": {}, "appData": { "label": "cam" } }),
        &mut a_events,
    )
    .await;
    let p1 = produced["data"]["id"].as_str().unwrap().to_string();

    let mut b = open(addr, None).await;
    let joined = request(&mut b, 1, json!({ "type": "join_stream_room" }), &mut b_events).await;
    let producers = joined["data"]["producers"].as_array().unwrap();
    assert_eq!(producers.len(), 1);
    assert_eq!(producers[0]["producerId"], p1.as_str());
    assert_eq!(producers[0]["appData"]["clientId"], a_id.as_str());
    assert_eq!(producers[0]["appData"]["label"], "cam");

    let transport = request(&mut b, 2, json!({ "type": "create_transport", "direction": "recv" }), &mut b_events).await;
    let recv_id = transport["data"]["id"].as_str().unwrap().to_string();
    let caps = json!({ "codecs": [{ "kind": "audio" }, { "kind": "video" }] });
    let consumed = request(
        &mut b,
        3,
        json!({ "type": "consume", "transportId": recv_id, "producerId": p1, "rtpCapabilities": caps }),
        &mut b_events,
    )
    .await;
    assert_eq!(consumed["data"]["params"]["producerId"], p1.as_str());
    assert_eq!(consumed["data"]["params"]["kind"], "video");

    // B may not touch A's producer
    let denied = request(&mut b, 4, json!({ "type": "pause_producer", "producerId": p1 }), &mut b_events).await;
    assert_eq!(denied["error"]["code"], "unauthorized");

    let resumed = request(&mut a, 5, json!({ "type": "resume_producer", "producerId": p1, "kind": "video" }), &mut a_events).await;
    assert_eq!(resumed["data"], json!({}));
    assert_eq!(
        next_json(&mut b).await,
        json!({ "type": "producer-resumed", "clientId": a_id, "producerId": p1, "kind": "video" })
    );

    a.close(None).await.unwrap();

    let mut seen = Vec::new();
    while seen.len() < 3 {
        seen.push(next_json(&mut b).await);
    }
    let kinds: Vec<&str> = seen.iter().filter_map(|m| m["type"].as_str()).collect();
    assert_eq!(kinds, vec!["producer_closed", "remove_client", "host_left"]);
    assert_eq!(seen[2]["connId"], a_id.as_str());

    let gone = request(
        &mut b,
        5,
        json!({ "type": "consume", "transportId": recv_id, "producerId": p1, "rtpCapabilities": caps }),
        &mut b_events,
    )
    .await;
    assert_eq!(gone["error"]["code"], "producer_not_found");
}

#[tokio::test]
async fn test_bad_input_gets_error_responses() {
    let addr = start_server().await;
    let mut events = Vec::new();
    let mut ws = open(addr, None).await;

    ws.send(Message::text(r#"{"id":7,"type":"warp_drive"}"#)).await.unwrap();
    let response = next_json(&mut ws).await;
    assert_eq!(response["id"], 7);
    assert_eq!(response["error"]["code"], "invalid_request");

    let response = request(&mut ws, 8, json!({ "type": "get_producers" }), &mut events).await;
    assert_eq!(response["error"]["code"], "client_not_found");

    let response = request(&mut ws, 9, json!({ "type": "join_stream_room" }), &mut events).await;
    assert!(response["data"]["id"].is_string());
    let response = request(&mut ws, 10, json!({ "type": "host_application" }), &mut events).await;
    assert_eq!(response["error"]["code"], "unauthorized");
}

#[tokio::test]
async fn test_upgrade_rejects_invalid_token() {
    let addr = start_server().await;
    let result = connect_async(format!("ws://{addr}/ws/s?token=garbage")).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_unknown_session_cannot_be_joined() {
    let addr = start_server().await;
    let (mut ws, _) = connect_async(format!("ws://{addr}/ws/nope")).await.unwrap();
    let mut events = Vec::new();
    let response = request(&mut ws, 1, json!({ "type": "join_stream_room" }), &mut events).await;
    assert_eq!(response["error"]["code"], "room_not_found");
}

#[tokio::test]
async fn test_health_and_metrics_endpoints() {
    let addr = start_server().await;
    let mut ws = open(addr, Some("owner")).await;
    let mut events = Vec::new();
    request(&mut ws, 1, json!({ "type": "join_stream_room" }), &mut events).await;

    let health = http_get(addr, "/health").await;
    assert!(health.starts_with("HTTP/1.1 200"));
    assert!(health.contains(r#""clients":1"#));
    assert!(health.contains(r#""rooms":1"#));

    let metrics = http_get(addr, "/metrics").await;
    assert!(metrics.contains("coordinator_joins_total 1"));
    assert!(metrics.contains("coordinator_host_changes_total 1"));
    assert!(metrics.contains("coordinator_connections_active 1"));
}

#[tokio::test]
async fn test_owner_can_end_session_over_http() {
    let addr = start_server().await;
    let mut ws = open(addr, None).await;
    let mut events = Vec::new();
    request(&mut ws, 1, json!({ "type": "join_stream_room" }), &mut events).await;

    let anonymous = http_request(addr, "DELETE", "/sessions/s", None).await;
    assert!(anonymous.starts_with("HTTP/1.1 401"));

    let intruder = create_token("intruder", "intruder", SECRET).unwrap();
    let forbidden = http_request(addr, "DELETE", "/sessions/s", Some(&intruder)).await;
    assert!(forbidden.starts_with("HTTP/1.1 403"));

    let owner = create_token("owner", "owner", SECRET).unwrap();
    let deleted = http_request(addr, "DELETE", "/sessions/s", Some(&owner)).await;
    assert!(deleted.starts_with("HTTP/1.1 204"));
    assert_eq!(next_json(&mut ws).await, json!({ "type": "session_deleted", "sessionId": "s" }));

    let gone = http_request(addr, "DELETE", "/sessions/s", Some(&owner)).await;
    assert!(gone.starts_with("HTTP/1.1 404"));

    let response = request(&mut ws, 2, json!({ "type": "get_producers" }), &mut events).await;
    assert_eq!(response["error"]["code"], "client_not_found");
}
