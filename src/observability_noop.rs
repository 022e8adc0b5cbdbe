//! No-op observability backend
//!
//! Used when the `datadog` feature is disabled. Exposes the same API as the
//! Datadog module; metrics compile away and logging goes to a plain
//! `tracing-subscriber` fmt layer.

#[path = "observability/recorder.rs"]
pub mod recorder;
#[path = "observability/spans.rs"]
pub mod spans;

pub use recorder::{
    noop_metrics, simulated_metrics, MetricType, MetricsRecorder, NoopMetrics, RecordedMetric,
    SharedMetrics, SimulatedMetrics,
};

use crate::config::{LogFormat, LoggingConfig};
use std::time::Instant;

/// No-op metrics client - compiles to nothing
#[derive(Clone, Copy, Default)]
pub struct Metrics;

impl Metrics {
    #[inline(always)]
    pub fn new(_config: &DatadogConfig) -> Self {
        Metrics
    }

    #[inline(always)]
    pub fn timer(&self, _name: &'static str) -> Timer {
        Timer {
            _start: Instant::now(),
        }
    }
}

impl MetricsRecorder for Metrics {
    #[inline(always)]
    fn incr(&self, _name: &str, _tags: &[&str]) {}
    #[inline(always)]
    fn histogram(&self, _name: &str, _value: f64, _tags: &[&str]) {}
    #[inline(always)]
    fn gauge(&self, _name: &str, _value: f64, _tags: &[&str]) {}
    #[inline(always)]
    fn timing(&self, _name: &str, _duration_ms: f64, _tags: &[&str]) {}
}

/// No-op timer - records nothing on drop
pub struct Timer {
    _start: Instant,
}

/// No-op configuration
#[derive(Clone, Default)]
pub struct DatadogConfig;

impl DatadogConfig {
    #[inline(always)]
    pub fn from_env() -> Self {
        DatadogConfig
    }
}

/// Plain fmt subscriber honouring `RUST_LOG` and the configured format
pub fn init_tracing(
    _config: &DatadogConfig,
    logging: &LoggingConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.filter));

    match logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).try_init(),
    }
}

/// No-op shutdown
#[inline(always)]
pub fn shutdown() {}
