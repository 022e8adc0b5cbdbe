//! Tumbling Window State
//!
//! Partition-local, single-threaded fold of an event stream into fixed-size,
//! non-overlapping event-time buckets.
//!
//! ## Closure
//!
//! The watermark is the highest event timestamp seen so far. A bucket
//! `[start, end)` closes as soon as `watermark >= end`, or when `flush()` is
//! called (idle timeout, shutdown). There is no grace period: an event whose
//! window has already closed is dropped and counted as late, never folded
//! into a record that was already emitted.
//!
//! ## Ordering
//!
//! Open buckets are indexed by window start first, so closing is a walk from
//! the front of a `BTreeMap`. Records leave in ascending `window_start`, keys
//! sorted within a window, which keeps per-key emission monotonic.

use crate::event::{AggregateRecord, Event};
use crate::time::Timestamp;
use ahash::AHashMap;
use std::collections::BTreeMap;

/// Open bucket for one `(group_key, window_start)`
#[derive(Debug, Clone, PartialEq)]
pub struct WindowBucket {
    pub group_key: String,
    pub window_start: Timestamp,
    pub window_end: Timestamp,
    pub count: u64,
    pub sum: f64,
    pub max: Option<f64>,
}

impl WindowBucket {
    fn new(group_key: String, window_start: Timestamp, size_ms: u64) -> Self {
        WindowBucket {
            group_key,
            window_start,
            window_end: Timestamp(window_start.0.saturating_add(size_ms)),
            count: 0,
            sum: 0.0,
            max: None,
        }
    }

    #[inline]
    fn fold(&mut self, value: Option<f64>) {
        self.count += 1;
        if let Some(v) = value {
            self.sum += v;
            self.max = Some(self.max.map_or(v, |m| m.max(v)));
        }
    }

    fn into_record(self) -> AggregateRecord {
        AggregateRecord {
            metric_id: self.group_key,
            window_start: self.window_start,
            window_end: self.window_end,
            count: self.count,
            sum: self.sum,
            max: self.max.unwrap_or(0.0),
        }
    }
}

/// Running totals for one partition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowStats {
    pub observed: u64,
    pub folded: u64,
    pub late_dropped: u64,
    pub emitted: u64,
}

/// Outcome of observing a single event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Folded,
    Late,
}

pub struct TumblingWindows {
    size_ms: u64,
    /// window_start -> group_key -> bucket
    open: BTreeMap<Timestamp, AHashMap<String, WindowBucket>>,
    watermark: Option<Timestamp>,
    /// Highest window start already emitted per key by a flush that ran
    /// ahead of the watermark. Entries at or below the watermark horizon
    /// are redundant and get pruned.
    flushed_through: AHashMap<String, Timestamp>,
    stats: WindowStats,
}

impl TumblingWindows {
    pub fn new(size_ms: u64) -> Self {
        assert!(size_ms > 0, "window size must be positive");
        TumblingWindows {
            size_ms,
            open: BTreeMap::new(),
            watermark: None,
            flushed_through: AHashMap::new(),
            stats: WindowStats::default(),
        }
    }

    pub fn size_ms(&self) -> u64 {
        self.size_ms
    }

    pub fn watermark(&self) -> Option<Timestamp> {
        self.watermark
    }

    pub fn stats(&self) -> WindowStats {
        self.stats
    }

    pub fn open_buckets(&self) -> usize {
        self.open.values().map(|keys| keys.len()).sum()
    }

    /// Current state of an open bucket, if any
    pub fn bucket(&self, group_key: &str, window_start: Timestamp) -> Option<&WindowBucket> {
        self.open.get(&window_start)?.get(group_key)
    }

    /// Fold one event grouped by its subscriber id.
    ///
    /// Returns every record closed by the watermark advance this event caused.
    pub fn observe(&mut self, event: &Event) -> Vec<AggregateRecord> {
        let (_, closed) = self.observe_keyed(&event.subscriber_id, event.event_time(), event.value);
        closed
    }

    pub fn observe_keyed(
        &mut self,
        group_key: &str,
        timestamp: Timestamp,
        value: Option<f64>,
    ) -> (Observation, Vec<AggregateRecord>) {
        self.stats.observed += 1;

        let window_start = timestamp.window_start(self.size_ms);
        let window_end = Timestamp(window_start.0.saturating_add(self.size_ms));

        if self.is_closed(group_key, window_start, window_end) {
            self.stats.late_dropped += 1;
            // A late event never moves the watermark either.
            return (Observation::Late, Vec::new());
        }

        let size_ms = self.size_ms;
        self.open
            .entry(window_start)
            .or_default()
            .entry(group_key.to_string())
            .or_insert_with(|| WindowBucket::new(group_key.to_string(), window_start, size_ms))
            .fold(value);
        self.stats.folded += 1;

        let advanced = match self.watermark {
            Some(w) if w >= timestamp => false,
            _ => {
                self.watermark = Some(timestamp);
                true
            }
        };

        let closed = if advanced {
            self.close_through(timestamp)
        } else {
            Vec::new()
        };
        (Observation::Folded, closed)
    }

    /// Close and emit every open bucket regardless of the watermark.
    pub fn flush(&mut self) -> Vec<AggregateRecord> {
        let open = std::mem::take(&mut self.open);
        let mut records = Vec::new();
        for (window_start, keys) in open {
            for bucket in sorted_buckets(keys) {
                let ahead_of_watermark = self
                    .watermark
                    .map_or(true, |w| bucket.window_end > w);
                if ahead_of_watermark {
                    let marker = self
                        .flushed_through
                        .entry(bucket.group_key.clone())
                        .or_insert(window_start);
                    if *marker < window_start {
                        *marker = window_start;
                    }
                }
                records.push(bucket.into_record());
            }
        }
        self.stats.emitted += records.len() as u64;
        records
    }

    fn is_closed(&self, group_key: &str, window_start: Timestamp, window_end: Timestamp) -> bool {
        if let Some(w) = self.watermark {
            if window_end <= w {
                return true;
            }
        }
        matches!(self.flushed_through.get(group_key), Some(done) if window_start <= *done)
    }

    fn close_through(&mut self, watermark: Timestamp) -> Vec<AggregateRecord> {
        let mut records = Vec::new();
        while let Some(entry) = self.open.first_entry() {
            let window_end = Timestamp(entry.key().0.saturating_add(self.size_ms));
            if window_end > watermark {
                break;
            }
            let keys = entry.remove();
            records.extend(sorted_buckets(keys).into_iter().map(WindowBucket::into_record));
        }

        if !self.flushed_through.is_empty() {
            let size_ms = self.size_ms;
            self.flushed_through
                .retain(|_, start| start.0.saturating_add(size_ms) > watermark.0);
        }

        self.stats.emitted += records.len() as u64;
        records
    }
}

fn sorted_buckets(keys: AHashMap<String, WindowBucket>) -> Vec<WindowBucket> {
    let mut buckets: Vec<WindowBucket> = keys.into_values().collect();
    buckets.sort_by(|a, b| a.group_key.cmp(&b.group_key));
    buckets
}

#[cfg(test)]
mod tests {
    use super::*;

    fn click(user: &str, t: u64) -> Event {
        Event::new("click", user, Timestamp(t))
    }

    #[test]
    fn test_upper_boundary_is_exclusive() {
        let mut windows = TumblingWindows::new(60);
        assert!(windows.observe(&click("u1", 59)).is_empty());
        let closed = windows.observe(&click("u1", 60));

        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].window_start, Timestamp(0));
        assert_eq!(closed[0].window_end, Timestamp(60));
        assert_eq!(closed[0].count, 1);
        assert_eq!(windows.bucket("u1", Timestamp(60)).map(|b| b.count), Some(1));
    }

    #[test]
    fn test_closes_on_later_event_and_flush() {
        let mut windows = TumblingWindows::new(60);
        assert!(windows.observe(&click("u1", 0)).is_empty());
        assert!(windows.observe(&click("u1", 30)).is_empty());

        let closed = windows.observe(&click("u1", 61));
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].metric_id, "u1");
        assert_eq!(closed[0].count, 2);

        assert_eq!(windows.open_buckets(), 1);
        let flushed = windows.flush();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].window_start, Timestamp(60));
        assert_eq!(flushed[0].window_end, Timestamp(120));
        assert_eq!(flushed[0].count, 1);
        assert_eq!(windows.open_buckets(), 0);
    }

    #[test]
    fn test_late_event_after_close_is_dropped() {
        let mut windows = TumblingWindows::new(60);
        windows.observe(&click("u1", 10));
        let closed = windows.observe(&click("u1", 70));
        assert_eq!(closed[0].count, 1);

        // Order-violating event for the closed [0, 60) window
        let (outcome, closed) = windows.observe_keyed("u1", Timestamp(20), None);
        assert_eq!(outcome, Observation::Late);
        assert!(closed.is_empty());
        assert!(windows.bucket("u1", Timestamp(0)).is_none());
        assert_eq!(windows.stats().late_dropped, 1);

        // Nothing is ever re-emitted for [0, 60)
        let rest = windows.flush();
        assert!(rest.iter().all(|r| r.window_start != Timestamp(0)));
    }

    #[test]
    fn test_late_after_idle_flush_is_dropped_per_key() {
        let mut windows = TumblingWindows::new(60);
        windows.observe(&click("u1", 10));
        let flushed = windows.flush();
        assert_eq!(flushed.len(), 1);

        // Same key, same window: already emitted
        let (outcome, _) = windows.observe_keyed("u1", Timestamp(15), None);
        assert_eq!(outcome, Observation::Late);

        // A different key in that window was never emitted, so it still counts
        let (outcome, _) = windows.observe_keyed("u2", Timestamp(15), None);
        assert_eq!(outcome, Observation::Folded);

        // Next window for u1 is fine
        let (outcome, _) = windows.observe_keyed("u1", Timestamp(65), None);
        assert_eq!(outcome, Observation::Folded);
    }

    #[test]
    fn test_out_of_order_within_open_window_is_folded() {
        let mut windows = TumblingWindows::new(60);
        windows.observe(&click("u1", 50));
        windows.observe(&click("u1", 5));
        assert_eq!(windows.watermark(), Some(Timestamp(50)));
        assert_eq!(windows.bucket("u1", Timestamp(0)).map(|b| b.count), Some(2));
    }

    #[test]
    fn test_any_key_advances_time_for_all_keys() {
        let mut windows = TumblingWindows::new(60);
        windows.observe(&click("b", 1));
        windows.observe(&click("a", 2));
        windows.observe(&click("a", 61));
        let closed = windows.observe(&click("c", 130));

        let keys: Vec<(&str, u64)> = closed
            .iter()
            .map(|r| (r.metric_id.as_str(), r.window_start.0))
            .collect();
        assert_eq!(keys, vec![("a", 60)]);
        assert_eq!(windows.stats().emitted, 3);
    }

    #[test]
    fn test_emission_is_monotonic_per_key() {
        let mut windows = TumblingWindows::new(10);
        let mut all = Vec::new();
        for t in [1, 11, 21, 31, 100] {
            all.extend(windows.observe(&click("k", t)));
        }
        all.extend(windows.flush());
        let starts: Vec<u64> = all.iter().map(|r| r.window_start.0).collect();
        assert_eq!(starts, vec![0, 10, 20, 30, 100]);
    }

    #[test]
    fn test_numeric_values_fold_into_sum_and_max() {
        let mut windows = TumblingWindows::new(60);
        windows.observe(&click("u1", 1).with_value(2.5));
        windows.observe(&click("u1", 2).with_value(-1.0));
        windows.observe(&click("u1", 3));
        let record = windows.flush().remove(0);

        assert_eq!(record.count, 3);
        assert_eq!(record.sum, 1.5);
        assert_eq!(record.max, 2.5);
    }

    #[test]
    fn test_counting_path_leaves_sum_and_max_zero() {
        let mut windows = TumblingWindows::new(60);
        windows.observe(&click("u1", 1));
        let record = windows.flush().remove(0);
        assert_eq!(record.sum, 0.0);
        assert_eq!(record.max, 0.0);
    }

    #[test]
    fn test_flush_markers_are_pruned_once_watermark_passes() {
        let mut windows = TumblingWindows::new(60);
        windows.observe(&click("u1", 10));
        windows.flush();
        assert_eq!(windows.flushed_through.len(), 1);

        windows.observe(&click("u2", 200));
        assert!(windows.flushed_through.is_empty());
        // Still late, now by the watermark rule
        let (outcome, _) = windows.observe_keyed("u1", Timestamp(15), None);
        assert_eq!(outcome, Observation::Late);
    }
}
