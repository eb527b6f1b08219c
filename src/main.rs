#![forbid(unsafe_code)]

use anyhow::Result;
use std::sync::Arc;
use stream_coordinator::config::ServerConfig;
use stream_coordinator::db;
use stream_coordinator::media::MediaServer;
use stream_coordinator::metrics::ServerMetrics;
use stream_coordinator::session::{MemorySessionStore, PgSessionStore, SessionStore};
use stream_coordinator::signaling::{Coordinator, SignalingServer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stream_coordinator=debug,mediasoup=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Stream coordinator - Starting server");

    let config = ServerConfig::from_env()?;
    config.log_summary();

    let (media_server, engine_events) = MediaServer::new(config.media_config()).await?;
    let media_server = Arc::new(media_server);
    info!("Media server initialized");

    // Session ownership records: Postgres when configured, process memory otherwise
    let store: Arc<dyn SessionStore> = match db::connect(config.database_url.as_deref()).await? {
        Some(pool) => Arc::new(PgSessionStore::new(pool)),
        None => {
            let memory = MemorySessionStore::new();
            for (session_id, owner) in &config.seed_sessions {
                memory.insert(session_id, owner);
            }
            if config.seed_sessions.is_empty() {
                warn!("In-memory session store is empty: every join answers room_not_found. Set DATABASE_URL or SEED_SESSIONS");
            } else {
                info!("Seeded {} sessions into the in-memory store", config.seed_sessions.len());
            }
            Arc::new(memory)
        }
    };

    let coordinator = Coordinator::new(
        media_server.clone(),
        engine_events,
        store,
        config.host_grace,
        ServerMetrics::new(),
    );

    let signaling_server = SignalingServer::new(coordinator.clone(), &config);

    // Run server with graceful shutdown
    tokio::select! {
        result = signaling_server.serve(config.port) => {
            if let Err(e) = result {
                tracing::error!("Signaling server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    coordinator.shutdown();
    media_server.shutdown().await;

    info!("Server shutdown complete");
    Ok(())
}
