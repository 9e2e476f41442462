//! In-process metrics: counters, gauges, a latency reservoir, and a
//! derived health score. `summary()` does no I/O — it is a pure snapshot.

use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

const LATENCY_RESERVOIR_CAPACITY: usize = 512;

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    conflicts_resolved: AtomicU64,
    breaker_trips: AtomicU64,
    lock_takeovers: AtomicU64,
    network_errors: AtomicU64,
}

#[derive(Debug, Default)]
struct QueueGauge {
    current: AtomicU64,
    peak: AtomicU64,
    // running sum/count for the average, not a true windowed mean.
    sum: AtomicU64,
    samples: AtomicU64,
}

/// Fixed-capacity ring buffer of the most recent latency samples, in
/// milliseconds. Oldest samples are evicted once capacity is reached,
/// same eviction shape as a bounded in-memory event sink.
#[derive(Debug, Default)]
struct LatencyReservoir {
    samples: Mutex<Vec<u64>>,
    next_slot: AtomicU64,
}

impl LatencyReservoir {
    fn record(&self, millis: u64) {
        let mut samples = self.samples.lock().expect("latency reservoir mutex poisoned");
        if samples.len() < LATENCY_RESERVOIR_CAPACITY {
            samples.push(millis);
        } else {
            let slot = (self.next_slot.fetch_add(1, Ordering::Relaxed) as usize)
                % LATENCY_RESERVOIR_CAPACITY;
            samples[slot] = millis;
        }
    }

    fn percentiles(&self) -> (u64, u64, u64) {
        let mut sorted = self.samples.lock().expect("latency reservoir mutex poisoned").clone();
        if sorted.is_empty() {
            return (0, 0, 0);
        }
        sorted.sort_unstable();
        (percentile(&sorted, 0.50), percentile(&sorted, 0.95), percentile(&sorted, 0.99))
    }
}

fn percentile(sorted: &[u64], p: f64) -> u64 {
    let rank = ((sorted.len() as f64 - 1.0) * p).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

/// Process-local metrics for one [`crate::sync_engine::SyncEngine`] instance.
/// Not a global/static — the host constructs and owns one per engine.
#[derive(Debug, Default)]
pub struct Metrics {
    counters: Counters,
    queue: QueueGauge,
    latency: LatencyReservoir,
}

#[derive(Debug, Serialize)]
pub struct OperationsSnapshot {
    pub enqueued: u64,
    pub processed: u64,
    pub failed: u64,
    pub retries: u64,
    pub conflicts_resolved: u64,
    pub breaker_trips: u64,
    pub lock_takeovers: u64,
}

#[derive(Debug, Serialize)]
pub struct LatencySnapshot {
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub sample_count: u64,
}

#[derive(Debug, Serialize)]
pub struct QueueSnapshot {
    pub current_depth: u64,
    pub peak_depth: u64,
    pub avg_depth: f64,
}

#[derive(Debug, Serialize)]
pub struct NetworkSnapshot {
    pub errors: u64,
    pub health_score: f64,
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub operations: OperationsSnapshot,
    pub latency: LatencySnapshot,
    pub queue: QueueSnapshot,
    pub network: NetworkSnapshot,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_enqueued(&self) {
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processed(&self) {
        self.counters.processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Convenience for the common success path: counts the op processed
    /// and feeds its latency into the reservoir in one call.
    pub fn record_success(&self, latency: std::time::Duration) {
        self.record_processed();
        self.record_latency_ms(latency.as_millis() as u64);
    }

    pub fn record_failed(&self) {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.counters.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conflict_resolved(&self) {
        self.counters.conflicts_resolved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_breaker_trip(&self) {
        self.counters.breaker_trips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_takeover(&self) {
        self.counters.lock_takeovers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_network_error(&self) {
        self.counters.network_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_latency_ms(&self, millis: u64) {
        self.latency.record(millis);
    }

    /// Updates the queue depth gauge; tracks peak and feeds the running
    /// average. Call on every enqueue and every process/removal.
    pub fn set_queue_depth(&self, depth: u64) {
        self.queue.current.store(depth, Ordering::Relaxed);
        self.queue.peak.fetch_max(depth, Ordering::Relaxed);
        self.queue.sum.fetch_add(depth, Ordering::Relaxed);
        self.queue.samples.fetch_add(1, Ordering::Relaxed);
    }

    /// `100 * success_rate - penalty(network_errors)`, clamped to `[0, 100]`.
    /// Scores below 50 during a circuit trip are expected, not a bug.
    pub fn health_score(&self) -> f64 {
        let processed = self.counters.processed.load(Ordering::Relaxed);
        let failed = self.counters.failed.load(Ordering::Relaxed);
        let total = processed + failed;
        let success_rate = if total == 0 { 1.0 } else { processed as f64 / total as f64 };

        let network_errors = self.counters.network_errors.load(Ordering::Relaxed);
        let penalty = (network_errors as f64).sqrt() * 5.0;

        (100.0 * success_rate - penalty).clamp(0.0, 100.0)
    }

    /// No-I/O snapshot of every counter, gauge, and derived metric.
    pub fn summary(&self) -> MetricsSnapshot {
        let (p50, p95, p99) = self.latency.percentiles();
        let sample_count =
            self.latency.samples.lock().expect("latency reservoir mutex poisoned").len() as u64;

        let samples = self.queue.samples.load(Ordering::Relaxed);
        let avg_depth = if samples == 0 {
            0.0
        } else {
            self.queue.sum.load(Ordering::Relaxed) as f64 / samples as f64
        };

        MetricsSnapshot {
            operations: OperationsSnapshot {
                enqueued: self.counters.enqueued.load(Ordering::Relaxed),
                processed: self.counters.processed.load(Ordering::Relaxed),
                failed: self.counters.failed.load(Ordering::Relaxed),
                retries: self.counters.retries.load(Ordering::Relaxed),
                conflicts_resolved: self.counters.conflicts_resolved.load(Ordering::Relaxed),
                breaker_trips: self.counters.breaker_trips.load(Ordering::Relaxed),
                lock_takeovers: self.counters.lock_takeovers.load(Ordering::Relaxed),
            },
            latency: LatencySnapshot { p50_ms: p50, p95_ms: p95, p99_ms: p99, sample_count },
            queue: QueueSnapshot {
                current_depth: self.queue.current.load(Ordering::Relaxed),
                peak_depth: self.queue.peak.load(Ordering::Relaxed),
                avg_depth,
            },
            network: NetworkSnapshot {
                errors: self.counters.network_errors.load(Ordering::Relaxed),
                health_score: self.health_score(),
            },
        }
    }

    /// `summary()` as a grouped `serde_json::Value`, for hosts that want a
    /// schema-free snapshot instead of the typed struct.
    pub fn summary_json(&self) -> JsonValue {
        let snapshot = self.summary();
        json!({
            "operations": snapshot.operations,
            "latency": snapshot.latency,
            "queue": snapshot.queue,
            "network": snapshot.network,
        })
    }
}
