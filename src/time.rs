//! Event-time primitives
//!
//! All windowing runs on the timestamp carried by the event itself, never on
//! the wall clock of the process that happens to observe it.

use chrono::DateTime;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Timestamp in milliseconds since the Unix epoch.
///
/// Always serialized as integer milliseconds. Accepted on input as integer
/// milliseconds, decimal seconds (`1700000000.25`) or an RFC 3339 string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn from_millis(ms: u64) -> Self {
        Timestamp(ms)
    }

    pub fn from_secs(secs: u64) -> Self {
        Timestamp(secs.saturating_mul(1000))
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Current wall-clock time. Only used to stamp events that arrive without one.
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Timestamp(millis)
    }

    /// Start of the epoch-aligned window of `size_ms` containing this timestamp
    pub fn window_start(&self, size_ms: u64) -> Timestamp {
        debug_assert!(size_ms > 0, "window size must be positive");
        Timestamp((self.0 / size_ms) * size_ms)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(TimestampVisitor)
    }
}

struct TimestampVisitor;

impl<'de> Visitor<'de> for TimestampVisitor {
    type Value = Timestamp;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("epoch milliseconds, decimal epoch seconds or an RFC 3339 string")
    }

    fn visit_u64<E: de::Error>(self, ms: u64) -> Result<Timestamp, E> {
        Ok(Timestamp(ms))
    }

    fn visit_i64<E: de::Error>(self, ms: i64) -> Result<Timestamp, E> {
        u64::try_from(ms)
            .map(Timestamp)
            .map_err(|_| E::custom("timestamp is before the Unix epoch"))
    }

    fn visit_f64<E: de::Error>(self, secs: f64) -> Result<Timestamp, E> {
        if !secs.is_finite() || secs < 0.0 {
            return Err(E::custom("timestamp must be a non-negative number of seconds"));
        }
        Ok(Timestamp((secs * 1000.0).round() as u64))
    }

    fn visit_str<E: de::Error>(self, raw: &str) -> Result<Timestamp, E> {
        let parsed = DateTime::parse_from_rfc3339(raw.trim())
            .map_err(|e| E::custom(format!("invalid RFC 3339 timestamp '{}': {}", raw, e)))?;
        self.visit_i64(parsed.timestamp_millis())
    }
}

impl std::ops::Add<std::time::Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: std::time::Duration) -> Self::Output {
        Timestamp(self.0.saturating_add(rhs.as_millis() as u64))
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_window_start_is_epoch_aligned() {
        assert_eq!(Timestamp::from_millis(0).window_start(60), Timestamp(0));
        assert_eq!(Timestamp::from_millis(59).window_start(60), Timestamp(0));
        assert_eq!(Timestamp::from_millis(60).window_start(60), Timestamp(60));
        assert_eq!(Timestamp::from_millis(119).window_start(60), Timestamp(60));
    }

    #[test]
    fn test_timestamp_arithmetic() {
        let t = Timestamp::from_secs(2);
        assert_eq!(t + Duration::from_millis(250), Timestamp(2250));
        assert_eq!(Timestamp(u64::MAX) + Duration::from_secs(1), Timestamp(u64::MAX));
    }

    #[test]
    fn test_accepts_millis_seconds_and_rfc3339() {
        let parse = |raw: &str| serde_json::from_str::<Timestamp>(raw);
        assert_eq!(parse("1700000000000").unwrap(), Timestamp(1_700_000_000_000));
        assert_eq!(parse("1700000000.25").unwrap(), Timestamp(1_700_000_000_250));
        assert_eq!(
            parse(r#""2023-11-14T22:13:20.5Z""#).unwrap(),
            Timestamp(1_700_000_000_500)
        );
        assert_eq!(
            parse(r#""2023-11-15T00:13:20+02:00""#).unwrap(),
            Timestamp(1_700_000_000_000)
        );
    }

    #[test]
    fn test_rejects_unusable_timestamps() {
        let parse = |raw: &str| serde_json::from_str::<Timestamp>(raw);
        assert!(parse("-5").is_err());
        assert!(parse("-1.5").is_err());
        assert!(parse(r#""yesterday""#).is_err());
        assert!(parse(r#""1969-12-31T23:59:59Z""#).is_err());
        assert!(parse("true").is_err());
    }

    #[test]
    fn test_serializes_as_plain_integer() {
        let json = serde_json::to_string(&Timestamp(1_700_000_000_000)).unwrap();
        assert_eq!(json, "1700000000000");
    }
}
