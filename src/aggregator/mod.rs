//! Windowed Aggregator
//!
//! `TumblingWindows` is the pure per-partition fold; `AggregatorWorker`
//! drives one instance from a partition of the raw events topic and hands
//! closed records to the aggregates topic.

mod window;
mod worker;

pub use window::{Observation, TumblingWindows, WindowBucket, WindowStats};
pub use worker::AggregatorWorker;
