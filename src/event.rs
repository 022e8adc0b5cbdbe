//! Wire types shared by every stage of the pipeline.

use crate::time::Timestamp;
use serde::{Deserialize, Serialize};

/// A discrete per-subscriber event as accepted by the ingest endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_type: String,
    #[serde(alias = "userId")]
    pub subscriber_id: String,
    /// Event time. Missing on the wire means "stamp on arrival".
    #[serde(default)]
    pub timestamp: Option<Timestamp>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Optional numeric payload folded into `sum`/`max`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

impl Event {
    pub fn new(
        event_type: impl Into<String>,
        subscriber_id: impl Into<String>,
        timestamp: Timestamp,
    ) -> Self {
        Event {
            event_type: event_type.into(),
            subscriber_id: subscriber_id.into(),
            timestamp: Some(timestamp),
            metadata: serde_json::Value::Null,
            value: None,
        }
    }

    pub fn with_value(mut self, value: f64) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Event time, falling back to zero for events that were never stamped.
    /// Ingest always stamps, so the fallback only matters for hand-built events.
    #[inline]
    pub fn event_time(&self) -> Timestamp {
        self.timestamp.unwrap_or(Timestamp::ZERO)
    }

    /// Reject events that cannot be routed or counted.
    pub fn validate(&self) -> Result<(), String> {
        if self.subscriber_id.trim().is_empty() {
            return Err("subscriberId is required".to_string());
        }
        if self.event_type.trim().is_empty() {
            return Err("eventType is required".to_string());
        }
        if let Some(v) = self.value {
            if !v.is_finite() {
                return Err("value must be a finite number".to_string());
            }
        }
        Ok(())
    }
}

/// Summary of one closed tumbling window for one group key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateRecord {
    pub metric_id: String,
    pub window_start: Timestamp,
    pub window_end: Timestamp,
    pub count: u64,
    pub sum: f64,
    pub max: f64,
}

impl AggregateRecord {
    /// Structured text form pushed to clients and published on the log.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_accepts_legacy_user_id_field() {
        let raw = r#"{"eventType":"click","userId":"alex_doe","timestamp":1000,"metadata":"meta-1"}"#;
        let event: Event = serde_json::from_str(raw).unwrap();
        assert_eq!(event.subscriber_id, "alex_doe");
        assert_eq!(event.event_time(), Timestamp(1000));
        assert_eq!(event.metadata, json!("meta-1"));
        assert_eq!(event.value, None);
    }

    #[test]
    fn test_event_accepts_rfc3339_timestamp() {
        let raw = r#"{"eventType":"click","subscriberId":"u1","timestamp":"1970-01-01T00:00:01.5Z"}"#;
        let event: Event = serde_json::from_str(raw).unwrap();
        assert_eq!(event.event_time(), Timestamp(1500));
        assert_eq!(serde_json::to_value(&event).unwrap()["timestamp"], json!(1500));
    }

    #[test]
    fn test_event_without_timestamp_parses() {
        let raw = r#"{"eventType":"view","subscriberId":"u1"}"#;
        let event: Event = serde_json::from_str(raw).unwrap();
        assert!(event.timestamp.is_none());
        assert_eq!(event.metadata, serde_json::Value::Null);
    }

    #[test]
    fn test_validate_rejects_missing_identity() {
        let event = Event::new("click", "  ", Timestamp(1));
        assert!(event.validate().is_err());

        let event = Event::new("", "u1", Timestamp(1));
        assert!(event.validate().is_err());

        let event = Event::new("click", "u1", Timestamp(1)).with_value(f64::NAN);
        assert!(event.validate().is_err());

        assert!(Event::new("click", "u1", Timestamp(1)).validate().is_ok());
    }

    #[test]
    fn test_aggregate_json_is_structured_and_stable() {
        let record = AggregateRecord {
            metric_id: "u1".to_string(),
            window_start: Timestamp(0),
            window_end: Timestamp(60_000),
            count: 2,
            sum: 0.0,
            max: 0.0,
        };
        assert_eq!(
            record.to_json().unwrap(),
            r#"{"metricId":"u1","windowStart":0,"windowEnd":60000,"count":2,"sum":0.0,"max":0.0}"#
        );
    }
}
