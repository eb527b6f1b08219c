#![forbid(unsafe_code)]

// Server configuration read from the environment

use crate::media::MediaConfig;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_MAX_CONNECTIONS: usize = 10_000;
const DEFAULT_HOST_GRACE_SECS: u64 = 10;
const DEFAULT_RTC_MIN_PORT: u16 = 10000;
const DEFAULT_RTC_MAX_PORT: u16 = 10100;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub announce_ip: IpAddr,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub media_workers: usize,
    pub max_connections: usize,
    pub host_grace: Duration,
    pub jwt_secret: Option<String>,
    pub database_url: Option<String>,
    pub metrics_token: Option<String>,
    /// `(session id, owner user id)` pairs loaded into the in-memory session store
    pub seed_sessions: Vec<(String, String)>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            announce_ip: IpAddr::from([127, 0, 0, 1]),
            rtc_min_port: DEFAULT_RTC_MIN_PORT,
            rtc_max_port: DEFAULT_RTC_MAX_PORT,
            media_workers: num_cpus::get(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            host_grace: Duration::from_secs(DEFAULT_HOST_GRACE_SECS),
            jwt_secret: None,
            database_url: None,
            metrics_token: None,
            seed_sessions: Vec::new(),
        }
    }
}

fn parsed<T: std::str::FromStr>(vars: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = vars(name)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring unparseable {}={}", name, raw);
            None
        }
    }
}

/// Parses `SEED_SESSIONS`: comma-separated `session_id:owner_user_id` pairs
fn parse_seed_sessions(raw: &str) -> anyhow::Result<Vec<(String, String)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once(':') {
            Some((id, owner)) if !id.is_empty() && !owner.is_empty() => Ok((id.to_string(), owner.to_string())),
            _ => Err(anyhow::anyhow!("Invalid SEED_SESSIONS entry: {entry}")),
        })
        .collect()
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from any variable source
    pub fn from_lookup(vars: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();

        let announce_ip = match vars("ANNOUNCE_IP") {
            Some(ip) => ip.parse().map_err(|_| anyhow::anyhow!("Invalid ANNOUNCE_IP: {ip}"))?,
            None => defaults.announce_ip,
        };

        let rtc_min_port = parsed(&vars, "RTC_MIN_PORT").unwrap_or(defaults.rtc_min_port);
        let rtc_max_port = parsed(&vars, "RTC_MAX_PORT").unwrap_or(defaults.rtc_max_port);
        if rtc_min_port > rtc_max_port {
            anyhow::bail!("RTC_MIN_PORT ({rtc_min_port}) is above RTC_MAX_PORT ({rtc_max_port})");
        }

        let mut media_workers = parsed(&vars, "MEDIA_WORKERS").unwrap_or(defaults.media_workers);
        if media_workers == 0 {
            warn!("MEDIA_WORKERS=0 would leave no media workers, using {}", defaults.media_workers);
            media_workers = defaults.media_workers;
        }

        let mut max_connections = parsed(&vars, "MAX_CONNECTIONS").unwrap_or(defaults.max_connections);
        if max_connections == 0 {
            warn!("MAX_CONNECTIONS=0 would reject all connections, using default {}", DEFAULT_MAX_CONNECTIONS);
            max_connections = DEFAULT_MAX_CONNECTIONS;
        }

        let host_grace = parsed(&vars, "HOST_GRACE_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.host_grace);

        let non_empty = |name: &str| vars(name).filter(|v| !v.is_empty());
        let seed_sessions = match non_empty("SEED_SESSIONS") {
            Some(raw) => parse_seed_sessions(&raw)?,
            None => Vec::new(),
        };

        Ok(Self {
            port: parsed(&vars, "PORT").unwrap_or(defaults.port),
            announce_ip,
            rtc_min_port,
            rtc_max_port,
            media_workers,
            max_connections,
            host_grace,
            jwt_secret: non_empty("JWT_SECRET"),
            database_url: non_empty("DATABASE_URL"),
            metrics_token: non_empty("METRICS_TOKEN"),
            seed_sessions,
        })
    }

    /// Media engine settings derived from this configuration
    pub fn media_config(&self) -> MediaConfig {
        let mut media_config = MediaConfig::default();
        media_config.worker_config.num_workers = self.media_workers;
        media_config.webrtc_transport_config = media_config
            .webrtc_transport_config
            .with_public_ip(self.announce_ip)
            .with_port_range(self.rtc_min_port..=self.rtc_max_port);
        media_config
    }

    pub fn log_summary(&self) {
        info!("Listening port: {}", self.port);
        info!("Announced IP: {}, RTC ports {}-{}", self.announce_ip, self.rtc_min_port, self.rtc_max_port);
        info!("Media workers: {}", self.media_workers);
        info!("Max connections: {}", self.max_connections);
        info!("Host grace period: {:?}", self.host_grace);
        if self.jwt_secret.is_some() {
            info!("JWT authentication enabled");
        } else {
            info!("JWT_SECRET not set, all connections are anonymous");
        }
    }
}
