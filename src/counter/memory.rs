use super::{CounterStore, StoreError};
use ahash::AHashMap;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;

/// Process-local counter store, used when no external store is configured
#[derive(Default)]
pub struct MemoryCounterStore {
    counters: Mutex<AHashMap<String, i64>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<i64> {
        self.counters.lock().get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.counters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.lock().is_empty()
    }

    fn increment_now(&self, key: &str) -> i64 {
        let mut counters = self.counters.lock();
        let counter = counters.entry(key.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }
}

impl CounterStore for MemoryCounterStore {
    fn increment<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<i64, StoreError>> + Send + 'a>> {
        let value = self.increment_now(key);
        Box::pin(async move { Ok(value) })
    }
}
