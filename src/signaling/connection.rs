#![forbid(unsafe_code)]

// WebSocket connection handler for individual clients

use super::handler::{Coordinator, SignalingSession};
use super::protocol::{ClientRequest, ServerMessage};
use crate::error::CoordinatorError;
use crate::metrics::Counter;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};

/// Bounded channel capacity per client.
/// At 100 msg/s rate limit, 64 slots = 640ms of burst buffer.
/// Messages queued beyond this are stale — drop them early.
const CHANNEL_CAPACITY: usize = 64;

/// Idle timeout — close connection if no message received within this duration.
/// Prevents Slowloris-style attacks that hold semaphore permits indefinitely.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300); // 5 minutes

/// Token bucket rate limiter: max tokens (burst capacity).
const RATE_LIMIT_MAX_TOKENS: u64 = 100;
/// Token bucket: refill rate in tokens per second.
const RATE_LIMIT_REFILL_RATE: u64 = 100;
/// Internal: 1 token in microseconds (for integer math).
const TOKEN_US: u64 = 1_000_000;
/// Internal: max tokens in microseconds.
const MAX_TOKENS_US: u64 = RATE_LIMIT_MAX_TOKENS * TOKEN_US;

/// Serialize a ServerMessage and send it through the channel as pre-serialized JSON.
fn send_json(sender: &mpsc::Sender<Arc<String>>, msg: &ServerMessage) -> anyhow::Result<()> {
    let json = Arc::new(serde_json::to_string(msg)?);
    sender.try_send(json).map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}

/// Token bucket state of one connection
struct RateLimiter {
    tokens_us: u64,
    last_refill: Instant,
    warned: bool,
}

impl RateLimiter {
    fn new() -> Self {
        Self {
            tokens_us: MAX_TOKENS_US,
            last_refill: Instant::now(),
            warned: false,
        }
    }

    /// Takes one token. Returns false when the bucket is empty.
    fn try_acquire(&mut self) -> bool {
        let now = Instant::now();
        let elapsed_us = u64::try_from(now.duration_since(self.last_refill).as_micros()).unwrap_or(u64::MAX);
        self.last_refill = now;
        // RATE_LIMIT_REFILL_RATE tokens per second = that many token-microseconds per microsecond
        self.tokens_us = self
            .tokens_us
            .saturating_add(elapsed_us.saturating_mul(RATE_LIMIT_REFILL_RATE))
            .min(MAX_TOKENS_US);

        if self.tokens_us >= TOKEN_US {
            self.tokens_us -= TOKEN_US;
            self.warned = false;
            true
        } else {
            false
        }
    }
}

/// Request id of a message that failed to parse, so the error can still be matched
fn salvage_request_id(text: &str) -> Option<u64> {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| v.get("id").and_then(serde_json::Value::as_u64))
}

/// Handles a single WebSocket connection bound to `session_id`
pub async fn handle_connection(
    socket: WebSocket,
    coordinator: Arc<Coordinator>,
    session_id: String,
    user_id: Option<String>,
    _permit: OwnedSemaphorePermit,
) {
    let metrics = coordinator.metrics().clone();
    metrics.inc(Counter::Connections);
    let _conn_guard = metrics.connection_active_guard();

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Bounded channel for sending messages to this client
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);

    let mut session = SignalingSession::new(coordinator, &session_id, user_id, tx.clone());
    let client_id = session.client_id().to_string();
    info!("New WebSocket connection {} for session {}", client_id, session_id);

    // Spawn task to send messages to client
    let send_client_id = client_id.clone();
    let send_metrics = metrics.clone();
    let send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            send_metrics.inc(Counter::MessagesSent);
            if ws_sender.send(Message::Text((*json).clone().into())).await.is_err() {
                break;
            }
        }
        debug!("Send task finished for client: {}", send_client_id);
    });

    let mut limiter = RateLimiter::new();

    loop {
        // Idle timeout: close connection if no message within IDLE_TIMEOUT
        let msg = match tokio::time::timeout(IDLE_TIMEOUT, ws_receiver.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_))) | Ok(None) => break, // Stream error or closed
            Err(_) => {
                warn!("Idle timeout for client {}", client_id);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                metrics.inc(Counter::MessagesReceived);

                if !limiter.try_acquire() {
                    if !limiter.warned {
                        limiter.warned = true;
                        warn!("Rate limit exceeded for client {}", client_id);
                        let err = CoordinatorError::InvalidRequest(format!(
                            "Rate limit exceeded: max {RATE_LIMIT_REFILL_RATE} messages/second"
                        ));
                        let _ = send_json(&tx, &ServerMessage::error(salvage_request_id(&text), &err));
                    }
                    continue;
                }

                let response = match serde_json::from_str::<ClientRequest>(&text) {
                    Ok(request) => {
                        let start = Instant::now();
                        let response = session.dispatch(request).await;
                        metrics.observe_message_handling(start.elapsed());
                        response
                    }
                    Err(e) => {
                        warn!("Invalid message format from client {}: {}", client_id, e);
                        metrics.inc(Counter::Errors);
                        let err = CoordinatorError::InvalidRequest(format!("Invalid message format: {e}"));
                        ServerMessage::error(salvage_request_id(&text), &err)
                    }
                };

                if let Err(e) = send_json(&tx, &response) {
                    warn!("Failed to queue response for client {}: {}", client_id, e);
                    // If channel is closed, send task has exited — break
                    if tx.is_closed() {
                        break;
                    }
                }

                if session.has_left() {
                    info!("Client {} left session {}", client_id, session_id);
                    break;
                }
            }
            Message::Close(_) => {
                info!("Client {} closed connection", client_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // WebSocket ping/pong handled automatically
            }
            _ => {
                warn!("Unexpected message type from client {}", client_id);
            }
        }
    }

    // Same teardown whether the client left, timed out or vanished
    session.disconnect().await;
    drop(session);

    // _conn_guard dropped here → connections_active decremented
    // _permit dropped here → release semaphore

    drop(tx);
    let _ = send_task.await;

    info!("Connection handler finished for client: {}", client_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limiter_allows_burst_then_limits() {
        let mut limiter = RateLimiter::new();
        for _ in 0..RATE_LIMIT_MAX_TOKENS {
            assert!(limiter.try_acquire());
        }
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn test_rate_limiter_refills() {
        let mut limiter = RateLimiter::new();
        limiter.tokens_us = 0;
        limiter.last_refill = Instant::now() - Duration::from_millis(50);
        // 50ms at 100 tokens/s is 5 tokens
        for _ in 0..5 {
            assert!(limiter.try_acquire());
        }
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn test_salvage_request_id() {
        assert_eq!(salvage_request_id(r#"{"id":4,"type":"nonsense"}"#), Some(4));
        assert_eq!(salvage_request_id(r#"{"type":"produce"}"#), None);
        assert_eq!(salvage_request_id("not json"), None);
    }
}
