//! Metrics collection
//!
//! Prometheus-compatible counters, gauges and a latency histogram shared by the
//! connection handlers, the membership prober and the garbage collector.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Histogram bucket boundaries for latency measurements (in milliseconds)
const LATENCY_BUCKETS: [f64; 11] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
];

/// A simple histogram implementation for latency tracking
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: Vec<f64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new() -> Self {
        Self::with_buckets(&LATENCY_BUCKETS)
    }

    pub fn with_buckets(boundaries: &[f64]) -> Self {
        let buckets = (0..=boundaries.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            boundaries: boundaries.to_vec(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        let bucket_idx = self
            .boundaries
            .iter()
            .position(|&boundary| value <= boundary)
            .unwrap_or(self.boundaries.len());

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        // Stored as microseconds for precision
        self.sum
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative bucket counts, ending with the +Inf bucket
    pub fn get_buckets(&self) -> Vec<(f64, u64)> {
        let mut cumulative = 0u64;
        let mut result = Vec::with_capacity(self.boundaries.len() + 1);

        for (i, &boundary) in self.boundaries.iter().enumerate() {
            cumulative += self.buckets[i].load(Ordering::Relaxed);
            result.push((boundary, cumulative));
        }

        cumulative += self.buckets[self.boundaries.len()].load(Ordering::Relaxed);
        result.push((f64::INFINITY, cumulative));

        result
    }

    pub fn sum(&self) -> f64 {
        self.sum.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Master metrics registry, shared through an `Arc`
#[derive(Debug)]
pub struct MetricsRegistry {
    // Client-facing protocol
    pub connections_total: Counter,
    pub active_connections: Gauge,
    pub uploads_total: Counter,
    pub deletes_total: Counter,
    pub retrievals_total: Counter,
    pub request_errors_total: Counter,
    pub degraded_uploads_total: Counter,
    pub request_latency: Histogram,

    // Membership
    pub probes_total: Counter,
    pub probe_failures_total: Counter,
    pub node_conflicts_total: Counter,
    pub nodes_online: Gauge,

    // Garbage collection
    pub gc_cycles_total: Counter,
    pub placements_reclaimed_total: Counter,
    pub files_purged_total: Counter,

    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            connections_total: Counter::new(),
            active_connections: Gauge::new(),
            uploads_total: Counter::new(),
            deletes_total: Counter::new(),
            retrievals_total: Counter::new(),
            request_errors_total: Counter::new(),
            degraded_uploads_total: Counter::new(),
            request_latency: Histogram::new(),
            probes_total: Counter::new(),
            probe_failures_total: Counter::new(),
            node_conflicts_total: Counter::new(),
            nodes_online: Gauge::new(),
            gc_cycles_total: Counter::new(),
            placements_reclaimed_total: Counter::new(),
            files_purged_total: Counter::new(),
            start_time: Instant::now(),
        }
    }

    pub fn record_request(&self, duration: Duration, success: bool) {
        self.request_latency
            .observe(duration.as_secs_f64() * 1000.0);
        if !success {
            self.request_errors_total.inc();
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();

        let counters: [(&str, &str, &Counter); 12] = [
            ("rfs_connections_total", "Accepted client connections", &self.connections_total),
            ("rfs_uploads_total", "Committed uploads", &self.uploads_total),
            ("rfs_deletes_total", "Soft-deleted files", &self.deletes_total),
            ("rfs_retrievals_total", "Served retrievals", &self.retrievals_total),
            ("rfs_request_errors_total", "Failed client requests", &self.request_errors_total),
            ("rfs_degraded_uploads_total", "Uploads below the target replication factor", &self.degraded_uploads_total),
            ("rfs_probes_total", "Membership probes sent", &self.probes_total),
            ("rfs_probe_failures_total", "Membership probes that failed", &self.probe_failures_total),
            ("rfs_node_conflicts_total", "Node id/address conflicts repaired", &self.node_conflicts_total),
            ("rfs_gc_cycles_total", "Garbage collection cycles", &self.gc_cycles_total),
            ("rfs_placements_reclaimed_total", "Chunk placements removed from nodes", &self.placements_reclaimed_total),
            ("rfs_files_purged_total", "Deleted files purged from metadata", &self.files_purged_total),
        ];
        for (name, help, counter) in counters {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} counter", name);
            let _ = writeln!(out, "{} {}", name, counter.get());
        }

        let gauges: [(&str, &str, u64); 3] = [
            ("rfs_active_connections", "Open client connections", self.active_connections.get()),
            ("rfs_nodes_online", "Storage nodes currently online", self.nodes_online.get()),
            ("rfs_uptime_seconds", "Master uptime in seconds", self.uptime_seconds()),
        ];
        for (name, help, value) in gauges {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} gauge", name);
            let _ = writeln!(out, "{} {}", name, value);
        }

        out.push_str("# HELP rfs_request_duration_ms Client request duration in milliseconds\n");
        out.push_str("# TYPE rfs_request_duration_ms histogram\n");
        for (le, count) in self.request_latency.get_buckets() {
            let le = if le.is_infinite() {
                "+Inf".to_string()
            } else {
                le.to_string()
            };
            let _ = writeln!(out, "rfs_request_duration_ms_bucket{{le=\"{}\"}} {}", le, count);
        }
        let _ = writeln!(out, "rfs_request_duration_ms_sum {}", self.request_latency.sum());
        let _ = writeln!(out, "rfs_request_duration_ms_count {}", self.request_latency.count());

        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
