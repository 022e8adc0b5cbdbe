//! Metrics Recorder Trait
//!
//! Abstraction over metric emission so pipeline components can be tested
//! against an in-memory recorder:
//! - Production: DogStatsD client (`datadog` feature) or no-op
//! - Tests: `SimulatedMetrics`, which keeps everything for assertions

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Trait for recording metrics
pub trait MetricsRecorder: Send + Sync + 'static {
    /// Increment a counter by 1
    fn incr(&self, name: &str, tags: &[&str]);

    /// Record a histogram/distribution value
    fn histogram(&self, name: &str, value: f64, tags: &[&str]);

    /// Set a gauge value
    fn gauge(&self, name: &str, value: f64, tags: &[&str]);

    /// Record a timing in milliseconds
    fn timing(&self, name: &str, duration_ms: f64, tags: &[&str]);

    // Convenience methods with default implementations

    /// An event accepted by the ingest endpoint
    fn record_event_ingested(&self, event_type: &str) {
        let type_tag = format!("event_type:{}", event_type.to_lowercase());
        self.incr("ingest.events", &[&type_tag]);
    }

    /// A batch of aggregate records closed by one partition
    fn record_windows_emitted(&self, partition: usize, count: usize) {
        if count > 0 {
            let partition_tag = format!("partition:{}", partition);
            self.incr("aggregator.emits", &[&partition_tag]);
            self.histogram("aggregator.emit.batch_size", count as f64, &[&partition_tag]);
        }
    }

    /// An event dropped because its window had already closed
    fn record_late_event(&self, partition: usize) {
        let partition_tag = format!("partition:{}", partition);
        self.incr("aggregator.late_events", &[&partition_tag]);
    }

    /// Outcome of a push to one connection (delivered, failed, timeout, closed, no_recipient)
    fn record_delivery(&self, outcome: &str) {
        let outcome_tag = format!("outcome:{}", outcome);
        self.incr("gateway.deliveries", &[&outcome_tag]);
    }

    /// A delivery discarded by the dispatcher's backpressure policy
    fn record_dispatch_dropped(&self, policy: &str) {
        let policy_tag = format!("policy:{}", policy);
        self.incr("gateway.dispatch.dropped", &[&policy_tag]);
    }

    /// Record a connection event (established, closed, superseded)
    fn record_connection(&self, event: &str) {
        let event_tag = format!("event:{}", event);
        self.incr("connection.events", &[&event_tag]);
    }

    /// Update active connections gauge
    fn set_connections(&self, count: usize) {
        self.gauge("connections.active", count as f64, &[]);
    }
}

/// No-op metrics recorder - zero overhead when metrics are disabled
#[derive(Clone, Default)]
pub struct NoopMetrics;

impl MetricsRecorder for NoopMetrics {
    #[inline]
    fn incr(&self, _name: &str, _tags: &[&str]) {}
    #[inline]
    fn histogram(&self, _name: &str, _value: f64, _tags: &[&str]) {}
    #[inline]
    fn gauge(&self, _name: &str, _value: f64, _tags: &[&str]) {}
    #[inline]
    fn timing(&self, _name: &str, _duration_ms: f64, _tags: &[&str]) {}
}

/// Recorded metric for tests
#[derive(Debug, Clone)]
pub struct RecordedMetric {
    pub name: String,
    pub value: f64,
    pub tags: Vec<String>,
    pub metric_type: MetricType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Histogram,
    Gauge,
    Timing,
}

/// In-memory recorder - keeps every metric for verification
#[derive(Default)]
pub struct SimulatedMetrics {
    recorded: Mutex<Vec<RecordedMetric>>,
    ingested: AtomicU64,
    late_events: AtomicU64,
    connection_count: AtomicU64,
}

impl SimulatedMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all recorded metrics
    pub fn get_recorded(&self) -> Vec<RecordedMetric> {
        self.recorded.lock().clone()
    }

    /// Get metrics by name
    pub fn get_by_name(&self, name: &str) -> Vec<RecordedMetric> {
        self.recorded
            .lock()
            .iter()
            .filter(|m| m.name == name)
            .cloned()
            .collect()
    }

    /// Count of counter increments carrying `tag`
    pub fn count_tagged(&self, name: &str, tag: &str) -> usize {
        self.recorded
            .lock()
            .iter()
            .filter(|m| m.name == name && m.tags.iter().any(|t| t == tag))
            .count()
    }

    pub fn ingested(&self) -> u64 {
        self.ingested.load(Ordering::SeqCst)
    }

    pub fn late_events(&self) -> u64 {
        self.late_events.load(Ordering::SeqCst)
    }

    /// Get total connection events
    pub fn connection_count(&self) -> u64 {
        self.connection_count.load(Ordering::SeqCst)
    }

    /// Clear all recorded metrics
    pub fn clear(&self) {
        self.recorded.lock().clear();
        self.ingested.store(0, Ordering::SeqCst);
        self.late_events.store(0, Ordering::SeqCst);
        self.connection_count.store(0, Ordering::SeqCst);
    }

    /// Whether a metric with this name and type was recorded
    pub fn assert_metric(&self, name: &str, metric_type: MetricType) -> bool {
        self.recorded
            .lock()
            .iter()
            .any(|m| m.name == name && m.metric_type == metric_type)
    }

    fn push(&self, name: &str, value: f64, tags: &[&str], metric_type: MetricType) {
        self.recorded.lock().push(RecordedMetric {
            name: name.to_string(),
            value,
            tags: tags.iter().map(|s| s.to_string()).collect(),
            metric_type,
        });
    }
}

impl MetricsRecorder for SimulatedMetrics {
    fn incr(&self, name: &str, tags: &[&str]) {
        self.push(name, 1.0, tags, MetricType::Counter);
    }

    fn histogram(&self, name: &str, value: f64, tags: &[&str]) {
        self.push(name, value, tags, MetricType::Histogram);
    }

    fn gauge(&self, name: &str, value: f64, tags: &[&str]) {
        self.push(name, value, tags, MetricType::Gauge);
    }

    fn timing(&self, name: &str, duration_ms: f64, tags: &[&str]) {
        self.push(name, duration_ms, tags, MetricType::Timing);
    }

    fn record_event_ingested(&self, event_type: &str) {
        self.ingested.fetch_add(1, Ordering::SeqCst);
        let type_tag = format!("event_type:{}", event_type.to_lowercase());
        self.incr("ingest.events", &[&type_tag]);
    }

    fn record_late_event(&self, partition: usize) {
        self.late_events.fetch_add(1, Ordering::SeqCst);
        let partition_tag = format!("partition:{}", partition);
        self.incr("aggregator.late_events", &[&partition_tag]);
    }

    fn record_connection(&self, event: &str) {
        self.connection_count.fetch_add(1, Ordering::SeqCst);
        let event_tag = format!("event:{}", event);
        self.incr("connection.events", &[&event_tag]);
    }
}

/// Arc wrapper for trait object usage
pub type SharedMetrics = Arc<dyn MetricsRecorder>;

/// Create a no-op metrics recorder
pub fn noop_metrics() -> SharedMetrics {
    Arc::new(NoopMetrics)
}

/// Create a simulated metrics recorder for testing
pub fn simulated_metrics() -> Arc<SimulatedMetrics> {
    Arc::new(SimulatedMetrics::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulated_metrics_records() {
        let metrics = SimulatedMetrics::new();

        metrics.incr("test.counter", &["tag:value"]);
        metrics.histogram("test.histogram", 42.0, &[]);
        metrics.gauge("test.gauge", 100.0, &[]);
        metrics.timing("test.timing", 5.5, &[]);

        let recorded = metrics.get_recorded();
        assert_eq!(recorded.len(), 4);
        assert!(metrics.assert_metric("test.counter", MetricType::Counter));
        assert!(metrics.assert_metric("test.histogram", MetricType::Histogram));
        assert!(metrics.assert_metric("test.gauge", MetricType::Gauge));
        assert!(metrics.assert_metric("test.timing", MetricType::Timing));
    }

    #[test]
    fn test_window_emits_skip_empty_batches() {
        let metrics = SimulatedMetrics::new();

        metrics.record_windows_emitted(0, 0);
        assert!(metrics.get_recorded().is_empty());

        metrics.record_windows_emitted(2, 5);
        let sizes = metrics.get_by_name("aggregator.emit.batch_size");
        assert_eq!(sizes.len(), 1);
        assert_eq!(sizes[0].value, 5.0);
        assert_eq!(sizes[0].tags, vec!["partition:2".to_string()]);
    }

    #[test]
    fn test_delivery_outcomes_are_tagged() {
        let metrics = SimulatedMetrics::new();

        metrics.record_delivery("delivered");
        metrics.record_delivery("delivered");
        metrics.record_delivery("failed");

        assert_eq!(metrics.count_tagged("gateway.deliveries", "outcome:delivered"), 2);
        assert_eq!(metrics.count_tagged("gateway.deliveries", "outcome:failed"), 1);
    }

    #[test]
    fn test_simulated_counters_and_clear() {
        let metrics = SimulatedMetrics::new();

        metrics.record_event_ingested("CLICK");
        metrics.record_late_event(1);
        metrics.record_connection("established");

        assert_eq!(metrics.ingested(), 1);
        assert_eq!(metrics.late_events(), 1);
        assert_eq!(metrics.connection_count(), 1);
        assert_eq!(metrics.count_tagged("ingest.events", "event_type:click"), 1);

        metrics.clear();
        assert_eq!(metrics.ingested(), 0);
        assert!(metrics.get_recorded().is_empty());
    }

    #[test]
    fn test_noop_metrics_no_panic() {
        let metrics = NoopMetrics;

        metrics.incr("test", &[]);
        metrics.histogram("test", 1.0, &[]);
        metrics.gauge("test", 1.0, &[]);
        metrics.timing("test", 1.0, &[]);
        metrics.record_event_ingested("click");
        metrics.record_delivery("failed");
        metrics.set_connections(3);
    }
}
