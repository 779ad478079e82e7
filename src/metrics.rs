#![forbid(unsafe_code)]

// Server metrics — lock-free AtomicU64 counters and a Prometheus-compatible
// histogram for request handling latency.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

/// Fixed histogram bucket boundaries (in microseconds for internal storage).
const BUCKET_BOUNDS_US: [u64; 10] = [
    1_000,      // 1ms
    5_000,      // 5ms
    10_000,     // 10ms
    25_000,     // 25ms
    50_000,     // 50ms
    100_000,    // 100ms
    250_000,    // 250ms
    500_000,    // 500ms
    1_000_000,  // 1s
    5_000_000,  // 5s
];

/// Prometheus-compatible cumulative histogram with fixed buckets.
pub struct Histogram {
    /// Cumulative bucket counters — bucket[i] counts observations <= BUCKET_BOUNDS_US[i]
    buckets: [AtomicU64; 10],
    /// +Inf bucket (total count)
    count: AtomicU64,
    /// Sum of all observations in microseconds
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

    /// Record a duration observation.
    pub fn observe(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.sum_us.fetch_add(us, Relaxed);
        self.count.fetch_add(1, Relaxed);
        for (i, &bound) in BUCKET_BOUNDS_US.iter().enumerate() {
            if us <= bound {
                self.buckets[i].fetch_add(1, Relaxed);
            }
        }
    }

    /// Render in Prometheus text exposition format.
    fn render(&self, name: &str, help: &str, out: &mut String) {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} histogram");

        let labels = [
            "0.001", "0.005", "0.01", "0.025", "0.05",
            "0.1", "0.25", "0.5", "1", "5",
        ];
        for (i, label) in labels.iter().enumerate() {
            let val = self.buckets[i].load(Relaxed);
            let _ = writeln!(out, "{name}_bucket{{le=\"{label}\"}} {val}");
        }
        let count = self.count.load(Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
        let sum_us = self.sum_us.load(Relaxed);
        // Convert microseconds to seconds with 6 decimal places
        let _ = writeln!(out, "{name}_sum {}.{:06}", sum_us / 1_000_000, sum_us % 1_000_000);
        let _ = writeln!(out, "{name}_count {count}");
    }
}

/// Server-wide metrics using lock-free atomics.
#[derive(Clone)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

struct Inner {
    // Monotonic counters
    connections_total: AtomicU64,
    messages_received_total: AtomicU64,
    messages_sent_total: AtomicU64,
    errors_total: AtomicU64,
    channels_created_total: AtomicU64,
    clients_authorized_total: AtomicU64,
    clients_rejected_total: AtomicU64,
    producers_created_total: AtomicU64,
    consumers_created_total: AtomicU64,

    // Gauge
    connections_active: AtomicU64,

    // Histogram
    request_handling: Histogram,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                connections_total: AtomicU64::new(0),
                messages_received_total: AtomicU64::new(0),
                messages_sent_total: AtomicU64::new(0),
                errors_total: AtomicU64::new(0),
                channels_created_total: AtomicU64::new(0),
                clients_authorized_total: AtomicU64::new(0),
                clients_rejected_total: AtomicU64::new(0),
                producers_created_total: AtomicU64::new(0),
                consumers_created_total: AtomicU64::new(0),
                connections_active: AtomicU64::new(0),
                request_handling: Histogram::new(),
            }),
        }
    }

    pub fn inc_connections_total(&self) {
        self.inner.connections_total.fetch_add(1, Relaxed);
    }

    pub fn inc_messages_received(&self) {
        self.inner.messages_received_total.fetch_add(1, Relaxed);
    }

    pub fn inc_messages_sent(&self) {
        self.inner.messages_sent_total.fetch_add(1, Relaxed);
    }

    pub fn inc_errors(&self) {
        self.inner.errors_total.fetch_add(1, Relaxed);
    }

    pub fn inc_channels_created(&self) {
        self.inner.channels_created_total.fetch_add(1, Relaxed);
    }

    pub fn inc_clients_authorized(&self) {
        self.inner.clients_authorized_total.fetch_add(1, Relaxed);
    }

    pub fn inc_clients_rejected(&self) {
        self.inner.clients_rejected_total.fetch_add(1, Relaxed);
    }

    pub fn inc_producers_created(&self) {
        self.inner.producers_created_total.fetch_add(1, Relaxed);
    }

    pub fn inc_consumers_created(&self) {
        self.inner.consumers_created_total.fetch_add(1, Relaxed);
    }

    pub fn observe_request_handling(&self, duration: Duration) {
        self.inner.request_handling.observe(duration);
    }

    /// RAII guard for the active-connections gauge.
    pub fn connection_active_guard(&self) -> ConnectionGuard {
        self.inner.connections_active.fetch_add(1, Relaxed);
        ConnectionGuard {
            metrics: self.clone(),
        }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render_prometheus(&self, channels: usize, active_clients: usize) -> String {
        let mut out = String::with_capacity(2048);

        let counters: [(&str, &str, u64); 9] = [
            ("partyline_connections_total", "Total WebSocket connections accepted", self.inner.connections_total.load(Relaxed)),
            ("partyline_messages_received_total", "Total signaling messages received", self.inner.messages_received_total.load(Relaxed)),
            ("partyline_messages_sent_total", "Total signaling messages sent", self.inner.messages_sent_total.load(Relaxed)),
            ("partyline_errors_total", "Total request errors", self.inner.errors_total.load(Relaxed)),
            ("partyline_channels_created_total", "Total channels created", self.inner.channels_created_total.load(Relaxed)),
            ("partyline_clients_authorized_total", "Total pending clients authorized", self.inner.clients_authorized_total.load(Relaxed)),
            ("partyline_clients_rejected_total", "Total pending clients rejected", self.inner.clients_rejected_total.load(Relaxed)),
            ("partyline_producers_created_total", "Total audio producers created", self.inner.producers_created_total.load(Relaxed)),
            ("partyline_consumers_created_total", "Total audio consumers created", self.inner.consumers_created_total.load(Relaxed)),
        ];
        for (name, help, value) in counters {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} counter");
            let _ = writeln!(out, "{name} {value}");
        }

        let gauges: [(&str, &str, u64); 3] = [
            ("partyline_connections_active", "Currently open WebSocket connections", self.inner.connections_active.load(Relaxed)),
            ("partyline_channels", "Current channel count", channels as u64),
            ("partyline_clients_active", "Currently active clients", active_clients as u64),
        ];
        for (name, help, value) in gauges {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} gauge");
            let _ = writeln!(out, "{name} {value}");
        }

        self.inner.request_handling.render(
            "partyline_request_handling_seconds",
            "Signaling request handling latency",
            &mut out,
        );

        out
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the active-connections gauge on drop.
pub struct ConnectionGuard {
    metrics: ServerMetrics,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.metrics.inner.connections_active.fetch_sub(1, Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_buckets_are_cumulative() {
        let histogram = Histogram::new();
        histogram.observe(Duration::from_millis(3));
        histogram.observe(Duration::from_millis(60));

        let mut out = String::new();
        histogram.render("test_hist", "help", &mut out);
        assert!(out.contains("test_hist_bucket{le=\"0.005\"} 1"));
        assert!(out.contains("test_hist_bucket{le=\"0.1\"} 2"));
        assert!(out.contains("test_hist_count 2"));
    }

    #[test]
    fn connection_guard_tracks_gauge() {
        let metrics = ServerMetrics::new();
        {
            let _guard = metrics.connection_active_guard();
            let rendered = metrics.render_prometheus(1, 0);
            assert!(rendered.contains("partyline_connections_active 1"));
        }
        let rendered = metrics.render_prometheus(1, 0);
        assert!(rendered.contains("partyline_connections_active 0"));
    }

    #[test]
    fn render_includes_registry_gauges() {
        let metrics = ServerMetrics::new();
        metrics.inc_channels_created();
        let rendered = metrics.render_prometheus(3, 7);
        assert!(rendered.contains("partyline_channels 3"));
        assert!(rendered.contains("partyline_clients_active 7"));
        assert!(rendered.contains("partyline_channels_created_total 1"));
    }
}
