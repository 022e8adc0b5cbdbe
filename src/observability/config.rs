//! Datadog configuration, read from the standard `DD_*` environment variables.

use std::net::SocketAddr;

#[derive(Debug, Clone)]
pub struct DatadogConfig {
    pub service_name: String,
    pub env: String,
    pub version: String,
    pub statsd_addr: SocketAddr,
    pub trace_addr: String,
    pub trace_sample_rate: f64,
    pub logs_injection: bool,
    pub metric_prefix: String,
    pub tags: Vec<(String, String)>,
}

impl Default for DatadogConfig {
    fn default() -> Self {
        DatadogConfig {
            service_name: "realtime-analytics".to_string(),
            env: "development".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            statsd_addr: SocketAddr::from(([127, 0, 0, 1], 8125)),
            trace_addr: "http://127.0.0.1:8126".to_string(),
            trace_sample_rate: 1.0,
            logs_injection: false,
            metric_prefix: "realtime_analytics".to_string(),
            tags: Vec::new(),
        }
    }
}

impl DatadogConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        DatadogConfig {
            service_name: env_or("DD_SERVICE", defaults.service_name),
            env: env_or("DD_ENV", defaults.env),
            version: env_or("DD_VERSION", defaults.version),
            statsd_addr: std::env::var("DD_DOGSTATSD_URL")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.statsd_addr),
            trace_addr: env_or("DD_TRACE_AGENT_URL", defaults.trace_addr),
            trace_sample_rate: std::env::var("DD_TRACE_SAMPLE_RATE")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(|r: f64| r.clamp(0.0, 1.0))
                .unwrap_or(defaults.trace_sample_rate),
            logs_injection: std::env::var("DD_LOGS_INJECTION")
                .map(|s| s == "true" || s == "1")
                .unwrap_or(defaults.logs_injection),
            metric_prefix: env_or("DD_METRIC_PREFIX", defaults.metric_prefix),
            tags: std::env::var("DD_TAGS")
                .map(|s| parse_tags(&s))
                .unwrap_or_default(),
        }
    }

    /// Global tags as `key:value` strings, including service/env/version
    pub fn formatted_tags(&self) -> Vec<String> {
        let mut tags = vec![
            format!("service:{}", self.service_name),
            format!("env:{}", self.env),
            format!("version:{}", self.version),
        ];
        tags.extend(self.tags.iter().map(|(k, v)| format!("{}:{}", k, v)));
        tags
    }
}

fn env_or(name: &str, default: String) -> String {
    std::env::var(name).unwrap_or(default)
}

fn parse_tags(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|pair| {
            let (k, v) = pair.trim().split_once(':')?;
            if k.is_empty() {
                return None;
            }
            Some((k.to_string(), v.to_string()))
        })
        .collect()
}
