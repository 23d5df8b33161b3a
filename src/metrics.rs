//! Pipeline metrics aggregation
//!
//! This module owns every process-wide counter: events processed, filtered
//! and stored, the processing-time distribution, and the supplementary
//! failure counters. All recording operations are atomic so pipeline
//! workers never block on, or lose, an observation. Derived values
//! (filter rate, throughput, efficiency) are computed at read time.

use chrono::Utc;
use log::trace;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::events::Timestamp;

/// Upper bucket bounds of the processing-time histogram, in microseconds
const HISTOGRAM_BOUNDS_MICROS: [u64; 4] = [10_000, 50_000, 100_000, 500_000];

/// Number of histogram buckets (bounds plus one overflow bucket)
pub const HISTOGRAM_BUCKETS: usize = HISTOGRAM_BOUNDS_MICROS.len() + 1;

/// Point-in-time view of the aggregate counters
///
/// Produced by [`MetricsAggregator::snapshot`]; all derived values are
/// computed here, never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    /// Events that reached a filter decision
    pub total_processed: u64,
    /// Events dropped by the filter engine
    pub total_filtered: u64,
    /// Events successfully written to the query store
    pub total_stored: u64,
    /// Frames the normalizer rejected
    pub parse_failures: u64,
    /// Kept events lost after publish retry exhaustion
    pub forward_failures: u64,
    /// Queued events abandoned when shutdown exceeded its grace period
    pub dropped_on_shutdown: u64,
    /// Times the read loop had to wait on a full worker queue
    pub saturation_waits: u64,
    /// Mean processing time in milliseconds
    pub avg_processing_ms: f64,
    /// Fastest recorded event in milliseconds (0 when empty)
    pub min_processing_ms: f64,
    /// Slowest recorded event in milliseconds
    pub max_processing_ms: f64,
    /// total_filtered / total_processed, in [0, 1]
    pub filter_rate: f64,
    /// total_processed per minute since start or last reset
    pub throughput_per_minute: f64,
    /// total_stored / total_processed, in [0, 1]
    pub efficiency: f64,
    /// Processing-time distribution (<=10ms, <=50ms, <=100ms, <=500ms, over)
    pub histogram: [u64; HISTOGRAM_BUCKETS],
    /// When this snapshot was taken
    pub timestamp: Timestamp,
}

/// Sole owner of the aggregate counters
///
/// Cheap to share (`Arc`); every other component holds a handle and records
/// observations without ever mutating state directly.
#[derive(Debug)]
pub struct MetricsAggregator {
    processed: AtomicU64,
    filtered: AtomicU64,
    stored: AtomicU64,
    parse_failures: AtomicU64,
    forward_failures: AtomicU64,
    dropped_on_shutdown: AtomicU64,
    saturation_waits: AtomicU64,
    duration_sum_micros: AtomicU64,
    duration_min_micros: AtomicU64,
    duration_max_micros: AtomicU64,
    histogram: [AtomicU64; HISTOGRAM_BUCKETS],
    /// Epoch millis of process start or the last reset, for throughput
    window_started_ms: AtomicI64,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self {
            processed: AtomicU64::new(0),
            filtered: AtomicU64::new(0),
            stored: AtomicU64::new(0),
            parse_failures: AtomicU64::new(0),
            forward_failures: AtomicU64::new(0),
            dropped_on_shutdown: AtomicU64::new(0),
            saturation_waits: AtomicU64::new(0),
            duration_sum_micros: AtomicU64::new(0),
            duration_min_micros: AtomicU64::new(u64::MAX),
            duration_max_micros: AtomicU64::new(0),
            histogram: std::array::from_fn(|_| AtomicU64::new(0)),
            window_started_ms: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }

    /// Record one decided event and its processing time
    pub fn record_processed(&self, duration: Duration) {
        let micros = duration.as_micros() as u64;
        trace!("Recording processed event: {}us", micros);

        self.processed.fetch_add(1, Ordering::Relaxed);
        self.duration_sum_micros.fetch_add(micros, Ordering::Relaxed);
        self.duration_min_micros.fetch_min(micros, Ordering::Relaxed);
        self.duration_max_micros.fetch_max(micros, Ordering::Relaxed);
        self.histogram[Self::bucket_index(micros)].fetch_add(1, Ordering::Relaxed);
    }

    /// Record one dropped event
    ///
    /// Call after the matching `record_processed` so a snapshot can never
    /// observe more filtered than processed events.
    pub fn record_filtered(&self) {
        self.filtered.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one event successfully written to the query store
    pub fn record_stored(&self) {
        self.stored.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one frame the normalizer rejected
    pub fn record_parse_failure(&self) {
        self.parse_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one kept event lost after publish retry exhaustion
    pub fn record_forward_failure(&self) {
        self.forward_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record queued events abandoned at shutdown
    pub fn record_dropped_on_shutdown(&self, count: u64) {
        if count > 0 {
            self.dropped_on_shutdown.fetch_add(count, Ordering::Relaxed);
        }
    }

    /// Record one backpressure wait on a full worker queue
    pub fn record_saturation_wait(&self) {
        self.saturation_waits.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a consistent point-in-time view of all counters
    pub fn snapshot(&self) -> StatsSnapshot {
        // Filtered and stored are read before processed so concurrent
        // writers (which increment processed first) can only make the
        // snapshot conservative, never contradictory.
        let filtered = self.filtered.load(Ordering::Relaxed);
        let stored = self.stored.load(Ordering::Relaxed);
        let parse_failures = self.parse_failures.load(Ordering::Relaxed);
        let forward_failures = self.forward_failures.load(Ordering::Relaxed);
        let dropped_on_shutdown = self.dropped_on_shutdown.load(Ordering::Relaxed);
        let saturation_waits = self.saturation_waits.load(Ordering::Relaxed);
        let sum_micros = self.duration_sum_micros.load(Ordering::Relaxed);
        let min_micros = self.duration_min_micros.load(Ordering::Relaxed);
        let max_micros = self.duration_max_micros.load(Ordering::Relaxed);
        let histogram = std::array::from_fn(|i| self.histogram[i].load(Ordering::Relaxed));
        let processed = self.processed.load(Ordering::Relaxed);

        // A reset racing an in-flight event could still leave a stray
        // filtered/stored increment; clamp so rates stay within [0, 1].
        let filtered = filtered.min(processed);
        let stored = stored.min(processed);

        let avg_processing_ms = if processed > 0 {
            (sum_micros as f64 / processed as f64) / 1000.0
        } else {
            0.0
        };
        let min_processing_ms = if min_micros == u64::MAX {
            0.0
        } else {
            min_micros as f64 / 1000.0
        };
        let max_processing_ms = max_micros as f64 / 1000.0;
        let filter_rate = if processed > 0 {
            filtered as f64 / processed as f64
        } else {
            0.0
        };
        let efficiency = if processed > 0 {
            stored as f64 / processed as f64
        } else {
            0.0
        };

        let now_ms = Utc::now().timestamp_millis();
        let started_ms = self.window_started_ms.load(Ordering::Relaxed);
        // Floor the window at one second so throughput right after a
        // reset is finite.
        let elapsed_ms = (now_ms - started_ms).max(1_000) as f64;
        let throughput_per_minute = processed as f64 / (elapsed_ms / 60_000.0);

        StatsSnapshot {
            total_processed: processed,
            total_filtered: filtered,
            total_stored: stored,
            parse_failures,
            forward_failures,
            dropped_on_shutdown,
            saturation_waits,
            avg_processing_ms,
            min_processing_ms,
            max_processing_ms,
            filter_rate,
            throughput_per_minute,
            efficiency,
            histogram,
            timestamp: Utc::now(),
        }
    }

    /// Zero every counter and restart the throughput window
    ///
    /// In-flight connections and queued events are unaffected.
    pub fn reset(&self) {
        // Dependent counters are zeroed before processed for the same
        // snapshot-consistency reason as the read ordering above.
        self.filtered.store(0, Ordering::Relaxed);
        self.stored.store(0, Ordering::Relaxed);
        self.parse_failures.store(0, Ordering::Relaxed);
        self.forward_failures.store(0, Ordering::Relaxed);
        self.dropped_on_shutdown.store(0, Ordering::Relaxed);
        self.saturation_waits.store(0, Ordering::Relaxed);
        self.duration_sum_micros.store(0, Ordering::Relaxed);
        self.duration_min_micros.store(u64::MAX, Ordering::Relaxed);
        self.duration_max_micros.store(0, Ordering::Relaxed);
        for bucket in &self.histogram {
            bucket.store(0, Ordering::Relaxed);
        }
        self.processed.store(0, Ordering::Relaxed);
        self.window_started_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn bucket_index(micros: u64) -> usize {
        HISTOGRAM_BOUNDS_MICROS
            .iter()
            .position(|bound| micros <= *bound)
            .unwrap_or(HISTOGRAM_BOUNDS_MICROS.len())
    }
}

/// Measures one event's processing time and records it on finish
pub struct ProcessingTimer {
    start_time: Instant,
    metrics: Arc<MetricsAggregator>,
}

impl ProcessingTimer {
    /// Start timing one event
    pub fn start(metrics: Arc<MetricsAggregator>) -> Self {
        Self {
            start_time: Instant::now(),
            metrics,
        }
    }

    /// Finish timing and record the sample
    pub fn finish(self) {
        let duration = self.start_time.elapsed();
        self.metrics.record_processed(duration);
    }
}
