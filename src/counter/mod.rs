//! Counter Store Adapter
//!
//! Cumulative per-subscriber, per-event-type counters kept in an external
//! key-value store. Independent of windowing: nothing here ever resets.
//! Atomicity under concurrent increments from several consumer instances is
//! the store's job (`INCR` is atomic on the server).

mod memory;
mod redis_store;
mod worker;

pub use memory::MemoryCounterStore;
pub use redis_store::RedisCounterStore;
pub use worker::CounterWorker;

use std::future::Future;
use std::pin::Pin;

/// Error type for counter store operations
#[derive(Debug)]
pub enum StoreError {
    /// Store unreachable or the connection broke mid-request
    Unavailable(String),
    /// Store answered with something other than an integer
    UnexpectedReply(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Unavailable(msg) => write!(f, "counter store unavailable: {}", msg),
            StoreError::UnexpectedReply(msg) => write!(f, "unexpected counter store reply: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        match e.kind() {
            redis::ErrorKind::TypeError | redis::ErrorKind::ResponseError => {
                StoreError::UnexpectedReply(e.to_string())
            }
            _ => StoreError::Unavailable(e.to_string()),
        }
    }
}

/// Composite counter key: `stats:{subscriber_id}:{event_type}`
pub struct CounterKey;

impl CounterKey {
    pub const PREFIX: &'static str = "stats";

    pub fn format(subscriber_id: &str, event_type: &str) -> String {
        format!("{}:{}:{}", Self::PREFIX, subscriber_id, event_type)
    }
}

/// Increment-only view of the external key-value store
pub trait CounterStore: Send + Sync {
    /// Atomically add one to `key`, returning the new value
    fn increment<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<i64, StoreError>> + Send + 'a>>;
}
