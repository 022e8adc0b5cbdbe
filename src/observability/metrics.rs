//! DogStatsD Metrics Client
//!
//! Thread-safe, non-blocking UDP metrics client for Datadog.
//! Gracefully degrades if the Datadog agent is unavailable.

use dogstatsd::{Client, Options};
use std::sync::Arc;
use std::time::Instant;

use super::config::DatadogConfig;
use super::recorder::MetricsRecorder;

/// Metrics client wrapper with graceful degradation
#[derive(Clone)]
pub struct Metrics {
    client: Arc<Option<Client>>,
    prefix: String,
    global_tags: Vec<String>,
}

impl Metrics {
    /// Create a new metrics client from configuration
    pub fn new(config: &DatadogConfig) -> Self {
        let client = match Client::new(Options {
            to_addr: config.statsd_addr.to_string(),
            ..Default::default()
        }) {
            Ok(c) => {
                tracing::info!("DogStatsD client connected to {}", config.statsd_addr);
                Some(c)
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to create DogStatsD client: {}. Metrics disabled.",
                    e
                );
                None
            }
        };

        Metrics {
            client: Arc::new(client),
            prefix: config.metric_prefix.clone(),
            global_tags: config.formatted_tags(),
        }
    }

    #[inline]
    pub fn incr(&self, name: &str, tags: &[&str]) {
        if let Some(ref client) = *self.client {
            let metric_name = format!("{}.{}", self.prefix, name);
            let _ = client.incr(&metric_name, self.merge_tags(tags));
        }
    }

    #[inline]
    pub fn histogram(&self, name: &str, value: f64, tags: &[&str]) {
        if let Some(ref client) = *self.client {
            let metric_name = format!("{}.{}", self.prefix, name);
            let _ = client.histogram(&metric_name, value.to_string(), self.merge_tags(tags));
        }
    }

    #[inline]
    pub fn gauge(&self, name: &str, value: f64, tags: &[&str]) {
        if let Some(ref client) = *self.client {
            let metric_name = format!("{}.{}", self.prefix, name);
            let _ = client.gauge(&metric_name, value.to_string(), self.merge_tags(tags));
        }
    }

    #[inline]
    pub fn timing(&self, name: &str, duration_ms: f64, tags: &[&str]) {
        if let Some(ref client) = *self.client {
            let metric_name = format!("{}.{}", self.prefix, name);
            let _ = client.timing(&metric_name, duration_ms as i64, self.merge_tags(tags));
        }
    }

    /// Create a timer that records duration on drop
    #[inline]
    pub fn timer(&self, name: &'static str) -> Timer {
        Timer {
            metrics: self.clone(),
            name,
            tags: Vec::new(),
            start: Instant::now(),
        }
    }

    fn merge_tags(&self, tags: &[&str]) -> Vec<String> {
        self.global_tags
            .iter()
            .cloned()
            .chain(tags.iter().map(|s| s.to_string()))
            .collect()
    }
}

/// RAII timer that records duration when dropped
pub struct Timer {
    metrics: Metrics,
    name: &'static str,
    tags: Vec<String>,
    start: Instant,
}

impl Timer {
    pub fn with_tag(mut self, tag: String) -> Self {
        self.tags.push(tag);
        self
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        let tag_refs: Vec<&str> = self.tags.iter().map(|s| s.as_str()).collect();
        self.metrics.timing(self.name, duration_ms, &tag_refs);
    }
}

impl MetricsRecorder for Metrics {
    #[inline]
    fn incr(&self, name: &str, tags: &[&str]) {
        Metrics::incr(self, name, tags)
    }

    #[inline]
    fn histogram(&self, name: &str, value: f64, tags: &[&str]) {
        Metrics::histogram(self, name, value, tags)
    }

    #[inline]
    fn gauge(&self, name: &str, value: f64, tags: &[&str]) {
        Metrics::gauge(self, name, value, tags)
    }

    #[inline]
    fn timing(&self, name: &str, duration_ms: f64, tags: &[&str]) {
        Metrics::timing(self, name, duration_ms, tags)
    }
}
