#![forbid(unsafe_code)]

// Coordinator metrics: lock-free AtomicU64 counters and a Prometheus-compatible histogram.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

/// Fixed histogram bucket boundaries (in microseconds for internal storage).
const BUCKET_BOUNDS_US: [u64; 10] = [
    1_000,
    5_000,
    10_000,
    25_000,
    50_000,
    100_000,
    250_000,
    500_000,
    1_000_000,
    5_000_000,
];

const BUCKET_LABELS: [&str; 10] = ["0.001", "0.005", "0.01", "0.025", "0.05", "0.1", "0.25", "0.5", "1", "5"];

/// Prometheus-compatible cumulative histogram with fixed buckets.
pub struct Histogram {
    /// bucket[i] counts observations <= BUCKET_BOUNDS_US[i]
    buckets: [AtomicU64; 10],
    count: AtomicU64,
    sum_us: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, duration: Duration) {
        let us = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.sum_us.fetch_add(us, Relaxed);
        self.count.fetch_add(1, Relaxed);
        for (bucket, &bound) in self.buckets.iter().zip(BUCKET_BOUNDS_US.iter()) {
            if us <= bound {
                bucket.fetch_add(1, Relaxed);
            }
        }
    }

    /// Render in Prometheus text exposition format.
    fn render(&self, name: &str, help: &str, out: &mut String) {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} histogram");
        for (bucket, label) in self.buckets.iter().zip(BUCKET_LABELS.iter()) {
            let _ = writeln!(out, "{name}_bucket{{le=\"{label}\"}} {}", bucket.load(Relaxed));
        }
        let count = self.count.load(Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
        let sum_us = self.sum_us.load(Relaxed);
        let _ = writeln!(out, "{name}_sum {}.{:06}", sum_us / 1_000_000, sum_us % 1_000_000);
        let _ = writeln!(out, "{name}_count {count}");
    }
}

/// Monotonic counters kept by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Connections,
    MessagesReceived,
    MessagesSent,
    Errors,
    Unauthorized,
    RoomsCreated,
    Joins,
    Leaves,
    ProducersCreated,
    ConsumersCreated,
    HostChanges,
    SessionsDeleted,
    EngineEvents,
}

impl Counter {
    const ALL: [Counter; 13] = [
        Counter::Connections,
        Counter::MessagesReceived,
        Counter::MessagesSent,
        Counter::Errors,
        Counter::Unauthorized,
        Counter::RoomsCreated,
        Counter::Joins,
        Counter::Leaves,
        Counter::ProducersCreated,
        Counter::ConsumersCreated,
        Counter::HostChanges,
        Counter::SessionsDeleted,
        Counter::EngineEvents,
    ];

    fn name(self) -> &'static str {
        match self {
            Counter::Connections => "coordinator_connections_total",
            Counter::MessagesReceived => "coordinator_messages_received_total",
            Counter::MessagesSent => "coordinator_messages_sent_total",
            Counter::Errors => "coordinator_errors_total",
            Counter::Unauthorized => "coordinator_unauthorized_total",
            Counter::RoomsCreated => "coordinator_rooms_created_total",
            Counter::Joins => "coordinator_joins_total",
            Counter::Leaves => "coordinator_leaves_total",
            Counter::ProducersCreated => "coordinator_producers_created_total",
            Counter::ConsumersCreated => "coordinator_consumers_created_total",
            Counter::HostChanges => "coordinator_host_changes_total",
            Counter::SessionsDeleted => "coordinator_sessions_deleted_total",
            Counter::EngineEvents => "coordinator_engine_events_total",
        }
    }

    fn help(self) -> &'static str {
        match self {
            Counter::Connections => "Total WebSocket connections",
            Counter::MessagesReceived => "Total messages received from clients",
            Counter::MessagesSent => "Total messages sent to clients",
            Counter::Errors => "Total error responses",
            Counter::Unauthorized => "Requests rejected by the ownership check",
            Counter::RoomsCreated => "Total rooms created",
            Counter::Joins => "Total room joins",
            Counter::Leaves => "Total room leaves",
            Counter::ProducersCreated => "Total producers created",
            Counter::ConsumersCreated => "Total consumers created",
            Counter::HostChanges => "Times a client became host",
            Counter::SessionsDeleted => "Sessions deleted after the host grace period",
            Counter::EngineEvents => "Objects closed by the media engine on its own",
        }
    }
}

/// Server-wide metrics using lock-free atomics.
#[derive(Clone)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

struct Inner {
    counters: [AtomicU64; Counter::ALL.len()],
    connections_active: AtomicU64,
    message_handling: Histogram,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                counters: std::array::from_fn(|_| AtomicU64::new(0)),
                connections_active: AtomicU64::new(0),
                message_handling: Histogram::new(),
            }),
        }
    }

    pub fn inc(&self, counter: Counter) {
        self.inner.counters[counter as usize].fetch_add(1, Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.inner.counters[counter as usize].load(Relaxed)
    }

    /// Increments connections_active and returns an RAII guard that decrements on drop.
    pub fn connection_active_guard(&self) -> ConnectionGuard {
        self.inner.connections_active.fetch_add(1, Relaxed);
        ConnectionGuard { inner: self.inner.clone() }
    }

    pub fn connections_active(&self) -> u64 {
        self.inner.connections_active.load(Relaxed)
    }

    pub fn observe_message_handling(&self, duration: Duration) {
        self.inner.message_handling.observe(duration);
    }

    /// Render all metrics in Prometheus text exposition format.
    /// Room and client gauges are computed on demand by the registry.
    pub fn render_prometheus(&self, rooms_active: usize, clients_active: usize) -> String {
        let mut out = String::with_capacity(4096);

        for counter in Counter::ALL {
            render_metric(&mut out, "counter", counter.name(), counter.help(), self.get(counter));
        }

        render_metric(&mut out, "gauge", "coordinator_connections_active", "Currently open WebSocket connections", self.connections_active());
        render_metric(&mut out, "gauge", "coordinator_rooms_active", "Rooms with at least one client", rooms_active as u64);
        render_metric(&mut out, "gauge", "coordinator_clients_active", "Clients across all rooms", clients_active as u64);

        self.inner.message_handling.render(
            "coordinator_message_handling_seconds",
            "Message handling latency in seconds",
            &mut out,
        );

        out
    }
}

/// RAII guard that decrements `connections_active` on drop.
pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections_active.fetch_sub(1, Relaxed);
    }
}

fn render_metric(out: &mut String, kind: &str, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
    let _ = writeln!(out, "{name} {value}");
}
