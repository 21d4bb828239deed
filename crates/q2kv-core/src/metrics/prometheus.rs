//! Sink counters and Prometheus text export.

use crate::error::FaultKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Histogram bucket boundaries in milliseconds for cycle duration.
/// Converts to seconds: [0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
const CYCLE_DURATION_BUCKETS_MS: [u64; 7] = [5, 10, 50, 100, 500, 1000, 5000];

/// Default metric name prefix.
pub const DEFAULT_PREFIX: &str = "q2kv";

/// Counters describing batch sink activity.
#[derive(Debug, Default)]
pub struct SinkCounter {
    // === BATCH OUTCOMES ===
    /// Cycles that found the source empty on the first take
    batch_empty: AtomicU64,
    /// Cycles that ran out of events before reaching batch size
    batch_underflow: AtomicU64,
    /// Cycles that took a full batch
    batch_complete: AtomicU64,

    // === EVENTS ===
    /// Events taken, whether or not the cycle committed
    event_drain_attempt: AtomicU64,
    /// Events taken by committed cycles
    event_drain_success: AtomicU64,
    /// Mutations handed to the writer
    mutations_submitted: AtomicU64,

    // === CONNECTIONS ===
    connection_created: AtomicU64,
    connection_closed: AtomicU64,
    connection_failed: AtomicU64,

    // === FAULTS ===
    rollbacks: AtomicU64,
    /// Indexed by position in `FaultKind::ALL`
    errors: [AtomicU64; 6],

    // === HISTOGRAM: cycle_duration_seconds ===
    cycle_duration_sum_ms: AtomicU64,
    cycle_duration_count: AtomicU64,
    /// Buckets: [5ms, 10ms, 50ms, 100ms, 500ms, 1s, 5s, +Inf]
    cycle_duration_buckets: [AtomicU64; 8],
}

fn fault_index(kind: FaultKind) -> usize {
    match kind {
        FaultKind::Configuration => 0,
        FaultKind::Connection => 1,
        FaultKind::Source => 2,
        FaultKind::Serialization => 3,
        FaultKind::WriteRejection => 4,
        FaultKind::Fatal => 5,
    }
}

impl SinkCounter {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    // === RECORDING ===

    /// Record a cycle that found the source empty.
    pub fn record_batch_empty(&self) {
        self.batch_empty.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a cycle that took fewer events than the batch size.
    pub fn record_batch_underflow(&self) {
        self.batch_underflow.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a cycle that took a full batch.
    pub fn record_batch_complete(&self) {
        self.batch_complete.fetch_add(1, Ordering::Relaxed);
    }

    /// Add events taken in a cycle.
    pub fn add_drain_attempts(&self, count: u64) {
        self.event_drain_attempt.fetch_add(count, Ordering::Relaxed);
    }

    /// Add events of a committed cycle.
    pub fn add_drain_successes(&self, count: u64) {
        self.event_drain_success.fetch_add(count, Ordering::Relaxed);
    }

    /// Add mutations submitted to the writer.
    pub fn add_mutations_submitted(&self, count: u64) {
        self.mutations_submitted.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a store connection opened.
    pub fn record_connection_created(&self) {
        self.connection_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a store connection closed.
    pub fn record_connection_closed(&self) {
        self.connection_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed attempt to connect.
    pub fn record_connection_failed(&self) {
        self.connection_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a rolled back transaction.
    pub fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a fault.
    pub fn record_error(&self, kind: FaultKind) {
        self.errors[fault_index(kind)].fetch_add(1, Ordering::Relaxed);
    }

    /// Record the duration of one cycle.
    pub fn record_cycle(&self, duration: Duration) {
        let duration_ms = duration.as_millis() as u64;
        self.cycle_duration_sum_ms
            .fetch_add(duration_ms, Ordering::Relaxed);
        self.cycle_duration_count.fetch_add(1, Ordering::Relaxed);

        // Buckets are cumulative (le = less than or equal)
        for (i, &bucket_ms) in CYCLE_DURATION_BUCKETS_MS.iter().enumerate() {
            if duration_ms <= bucket_ms {
                self.cycle_duration_buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.cycle_duration_buckets[7].fetch_add(1, Ordering::Relaxed);
    }

    // === GETTERS ===

    /// Cycles that found the source empty.
    pub fn batch_empty_count(&self) -> u64 {
        self.batch_empty.load(Ordering::Relaxed)
    }

    /// Cycles that took fewer events than the batch size.
    pub fn batch_underflow_count(&self) -> u64 {
        self.batch_underflow.load(Ordering::Relaxed)
    }

    /// Cycles that took a full batch.
    pub fn batch_complete_count(&self) -> u64 {
        self.batch_complete.load(Ordering::Relaxed)
    }

    /// Events taken, committed or not.
    pub fn event_drain_attempt_count(&self) -> u64 {
        self.event_drain_attempt.load(Ordering::Relaxed)
    }

    /// Events taken by committed cycles.
    pub fn event_drain_success_count(&self) -> u64 {
        self.event_drain_success.load(Ordering::Relaxed)
    }

    /// Mutations handed to the writer.
    pub fn mutations_submitted_count(&self) -> u64 {
        self.mutations_submitted.load(Ordering::Relaxed)
    }

    /// Store connections opened.
    pub fn connection_created_count(&self) -> u64 {
        self.connection_created.load(Ordering::Relaxed)
    }

    /// Store connections closed.
    pub fn connection_closed_count(&self) -> u64 {
        self.connection_closed.load(Ordering::Relaxed)
    }

    /// Failed connection attempts.
    pub fn connection_failed_count(&self) -> u64 {
        self.connection_failed.load(Ordering::Relaxed)
    }

    /// Rolled back transactions.
    pub fn rollback_count(&self) -> u64 {
        self.rollbacks.load(Ordering::Relaxed)
    }

    /// Faults of one kind.
    pub fn errors_by_kind(&self, kind: FaultKind) -> u64 {
        self.errors[fault_index(kind)].load(Ordering::Relaxed)
    }

    /// Faults of all kinds.
    pub fn errors_total(&self) -> u64 {
        self.errors.iter().map(|e| e.load(Ordering::Relaxed)).sum()
    }

    /// Cycle duration histogram data for export.
    pub fn cycle_duration_histogram(&self) -> CycleDurationHistogram {
        let mut buckets = [(0.0, 0); 7];
        for (i, &bucket_ms) in CYCLE_DURATION_BUCKETS_MS.iter().enumerate() {
            buckets[i] = (
                bucket_ms as f64 / 1000.0,
                self.cycle_duration_buckets[i].load(Ordering::Relaxed),
            );
        }
        CycleDurationHistogram {
            sum_seconds: self.cycle_duration_sum_ms.load(Ordering::Relaxed) as f64 / 1000.0,
            count: self.cycle_duration_count.load(Ordering::Relaxed),
            buckets,
            inf_bucket: self.cycle_duration_buckets[7].load(Ordering::Relaxed),
        }
    }

    /// Export all metrics in Prometheus text format.
    ///
    /// # Example
    /// ```
    /// use q2kv_core::metrics::SinkCounter;
    ///
    /// let counter = SinkCounter::new();
    /// counter.record_batch_complete();
    /// let text = counter.export_prometheus_text();
    /// assert!(text.contains("q2kv_batch_complete_total 1"));
    /// ```
    pub fn export_prometheus_text(&self) -> String {
        self.export_prometheus_text_with_prefix(DEFAULT_PREFIX)
    }

    /// Export metrics in Prometheus text format with custom prefix.
    pub fn export_prometheus_text_with_prefix(&self, prefix: &str) -> String {
        let mut output = String::with_capacity(4096);

        // === COUNTERS ===

        let counters = [
            (
                "batch_empty_total",
                "Cycles that found the source empty",
                self.batch_empty_count(),
            ),
            (
                "batch_underflow_total",
                "Cycles that took fewer events than the batch size",
                self.batch_underflow_count(),
            ),
            (
                "batch_complete_total",
                "Cycles that took a full batch",
                self.batch_complete_count(),
            ),
            (
                "event_drain_attempt_total",
                "Events taken from the source",
                self.event_drain_attempt_count(),
            ),
            (
                "event_drain_success_total",
                "Events taken by committed cycles",
                self.event_drain_success_count(),
            ),
            (
                "mutations_submitted_total",
                "Mutations submitted to the writer",
                self.mutations_submitted_count(),
            ),
            (
                "connection_created_total",
                "Store connections opened",
                self.connection_created_count(),
            ),
            (
                "connection_closed_total",
                "Store connections closed",
                self.connection_closed_count(),
            ),
            (
                "connection_failed_total",
                "Failed store connection attempts",
                self.connection_failed_count(),
            ),
            (
                "rollbacks_total",
                "Source transactions rolled back",
                self.rollback_count(),
            ),
            (
                "errors_total",
                "Faults encountered",
                self.errors_total(),
            ),
        ];
        for (name, help, value) in counters {
            push_counter(&mut output, prefix, name, help, value);
        }

        output.push_str(&format!("# HELP {}_errors Faults by kind\n", prefix));
        output.push_str(&format!("# TYPE {}_errors counter\n", prefix));
        for kind in FaultKind::ALL {
            output.push_str(&format!(
                "{}_errors{{kind=\"{}\"}} {}\n",
                prefix,
                kind.as_label(),
                self.errors_by_kind(kind)
            ));
        }
        output.push('\n');

        // === HISTOGRAMS ===

        let histogram = self.cycle_duration_histogram();
        output.push_str(&format!(
            "# HELP {}_cycle_duration_seconds Duration of sink cycles\n",
            prefix
        ));
        output.push_str(&format!(
            "# TYPE {}_cycle_duration_seconds histogram\n",
            prefix
        ));
        for (le, count) in histogram.buckets {
            output.push_str(&format!(
                "{}_cycle_duration_seconds_bucket{{le=\"{}\"}} {}\n",
                prefix, le, count
            ));
        }
        output.push_str(&format!(
            "{}_cycle_duration_seconds_bucket{{le=\"+Inf\"}} {}\n",
            prefix, histogram.inf_bucket
        ));
        output.push_str(&format!(
            "{}_cycle_duration_seconds_sum {}\n",
            prefix, histogram.sum_seconds
        ));
        output.push_str(&format!(
            "{}_cycle_duration_seconds_count {}\n",
            prefix, histogram.count
        ));

        output
    }
}

fn push_counter(output: &mut String, prefix: &str, name: &str, help: &str, value: u64) {
    output.push_str(&format!("# HELP {}_{} {}\n", prefix, name, help));
    output.push_str(&format!("# TYPE {}_{} counter\n", prefix, name));
    output.push_str(&format!("{}_{} {}\n", prefix, name, value));
    output.push('\n');
}

/// Cycle duration histogram data for export.
#[derive(Debug, Clone)]
pub struct CycleDurationHistogram {
    /// Sum of all observations in seconds
    pub sum_seconds: f64,
    /// Total count of observations
    pub count: u64,
    /// Bucket counts: (le_boundary_seconds, count)
    pub buckets: [(f64, u64); 7],
    /// +Inf bucket count
    pub inf_bucket: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_counters() {
        let counter = SinkCounter::new();

        counter.record_batch_empty();
        counter.record_batch_underflow();
        counter.record_batch_underflow();
        counter.record_batch_complete();
        counter.add_drain_attempts(13);
        counter.add_drain_successes(10);
        counter.add_mutations_submitted(10);

        assert_eq!(counter.batch_empty_count(), 1);
        assert_eq!(counter.batch_underflow_count(), 2);
        assert_eq!(counter.batch_complete_count(), 1);
        assert_eq!(counter.event_drain_attempt_count(), 13);
        assert_eq!(counter.event_drain_success_count(), 10);
        assert_eq!(counter.mutations_submitted_count(), 10);
    }

    #[test]
    fn test_connection_counters() {
        let counter = SinkCounter::new();
        counter.record_connection_created();
        counter.record_connection_closed();
        counter.record_connection_failed();
        counter.record_connection_failed();

        assert_eq!(counter.connection_created_count(), 1);
        assert_eq!(counter.connection_closed_count(), 1);
        assert_eq!(counter.connection_failed_count(), 2);
    }

    #[test]
    fn test_errors_by_kind() {
        let counter = SinkCounter::new();
        counter.record_error(FaultKind::WriteRejection);
        counter.record_error(FaultKind::WriteRejection);
        counter.record_error(FaultKind::Source);

        assert_eq!(counter.errors_by_kind(FaultKind::WriteRejection), 2);
        assert_eq!(counter.errors_by_kind(FaultKind::Source), 1);
        assert_eq!(counter.errors_by_kind(FaultKind::Fatal), 0);
        assert_eq!(counter.errors_total(), 3);
    }

    #[test]
    fn test_histogram_buckets() {
        let counter = SinkCounter::new();
        counter.record_cycle(Duration::from_millis(3));
        counter.record_cycle(Duration::from_millis(75));
        counter.record_cycle(Duration::from_secs(10));

        let histogram = counter.cycle_duration_histogram();
        assert_eq!(histogram.count, 3);
        assert_eq!(histogram.buckets[0], (0.005, 1));
        assert_eq!(histogram.buckets[3], (0.1, 2));
        assert_eq!(histogram.buckets[6], (5.0, 2));
        assert_eq!(histogram.inf_bucket, 3);
        assert!((histogram.sum_seconds - 10.078).abs() < 1e-9);
    }

    #[test]
    fn test_prometheus_text_export() {
        let counter = SinkCounter::new();
        counter.record_batch_complete();
        counter.add_drain_attempts(100);
        counter.record_error(FaultKind::Serialization);
        counter.record_cycle(Duration::from_millis(250));

        let output = counter.export_prometheus_text();

        assert!(output.contains("# TYPE q2kv_batch_complete_total counter"));
        assert!(output.contains("q2kv_batch_complete_total 1"));
        assert!(output.contains("q2kv_event_drain_attempt_total 100"));
        assert!(output.contains("q2kv_errors{kind=\"serialization\"} 1"));
        assert!(output.contains("q2kv_errors{kind=\"write_rejection\"} 0"));
        assert!(output.contains("q2kv_cycle_duration_seconds_bucket{le=\"0.5\"} 1"));
        assert!(output.contains("q2kv_cycle_duration_seconds_bucket{le=\"0.1\"} 0"));
        assert!(output.contains("q2kv_cycle_duration_seconds_sum 0.25"));
        assert!(output.contains("q2kv_cycle_duration_seconds_count 1"));
    }

    #[test]
    fn test_prometheus_text_export_with_prefix() {
        let counter = SinkCounter::new();
        counter.record_batch_empty();

        let output = counter.export_prometheus_text_with_prefix("flume_sink");
        assert!(output.contains("# HELP flume_sink_batch_empty_total"));
        assert!(output.contains("flume_sink_batch_empty_total 1"));
        assert!(output.contains("flume_sink_cycle_duration_seconds_bucket"));
    }

    #[test]
    fn test_prometheus_text_format_validity() {
        let counter = SinkCounter::new();
        counter.record_cycle(Duration::from_millis(15));

        for line in counter.export_prometheus_text().lines() {
            if line.starts_with("# HELP ") {
                assert!(line.contains("q2kv_"));
            } else if line.starts_with("# TYPE ") {
                assert!(line.ends_with("counter") || line.ends_with("histogram"));
            } else if !line.is_empty() {
                assert!(line.starts_with("q2kv_"));
            }
        }
    }
}
