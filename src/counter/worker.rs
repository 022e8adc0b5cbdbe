use super::{CounterKey, CounterStore, StoreError};
use crate::event::Event;
use crate::observability::spans::partition_span;
use crate::pubsub::Publisher;
use crate::topic::PartitionConsumer;
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

/// Consumes one partition of the raw events topic and bumps the cumulative
/// counter for every event. Optionally republishes the event on the
/// live-updates channel.
pub struct CounterWorker {
    consumer: PartitionConsumer<Event>,
    store: Arc<dyn CounterStore>,
    publisher: Option<Arc<dyn Publisher>>,
}

impl CounterWorker {
    pub fn new(consumer: PartitionConsumer<Event>, store: Arc<dyn CounterStore>) -> Self {
        CounterWorker {
            consumer,
            store,
            publisher: None,
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Run until the partition ends. A store failure stops the worker.
    pub async fn run(self) -> Result<u64, StoreError> {
        let span = partition_span("counter", self.consumer.partition());
        self.consume().instrument(span).await
    }

    async fn consume(mut self) -> Result<u64, StoreError> {
        let mut processed = 0u64;
        while let Some(event) = self.consumer.recv().await {
            let key = CounterKey::format(&event.subscriber_id, &event.event_type);
            let value = self.store.increment(&key).await.map_err(|e| {
                warn!(key = %key, error = %e, "counter increment failed, stopping worker");
                e
            })?;
            debug!(key = %key, value, "counter incremented");
            processed += 1;

            if let Some(publisher) = &self.publisher {
                publish_event(publisher.as_ref(), &event).await;
            }
        }
        info!(processed, "event stream ended, counter worker stopping");
        Ok(processed)
    }
}

async fn publish_event(publisher: &dyn Publisher, event: &Event) {
    let payload = match serde_json::to_string(event) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "failed to serialize event for broadcast");
            return;
        }
    };
    if let Err(e) = publisher.publish(&payload).await {
        warn!(error = %e, subscriber = %event.subscriber_id, "live update publish failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::MemoryCounterStore;
    use crate::pubsub::LocalBus;
    use crate::time::Timestamp;
    use crate::topic::Topic;
    use std::future::Future;
    use std::pin::Pin;

    struct FailingStore;

    impl CounterStore for FailingStore {
        fn increment<'a>(
            &'a self,
            _key: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<i64, StoreError>> + Send + 'a>> {
            Box::pin(async { Err(StoreError::Unavailable("connection refused".to_string())) })
        }
    }

    #[tokio::test]
    async fn test_counts_are_cumulative_across_windows() {
        let topic = Topic::new("events", 1, 16);
        let consumer = topic.subscribe("realtime-analytics-group").remove(0);
        let store = Arc::new(MemoryCounterStore::new());
        let worker = CounterWorker::new(consumer, store.clone());
        let handle = tokio::spawn(worker.run());

        // Three clicks spread over three different minutes
        for ts in [0, 61_000, 125_000] {
            topic
                .publish(0, Event::new("click", "u1", Timestamp(ts)))
                .await
                .unwrap();
        }
        topic.close();

        assert_eq!(handle.await.unwrap().unwrap(), 3);
        assert_eq!(store.get("stats:u1:click"), Some(3));
    }

    #[tokio::test]
    async fn test_store_failure_stops_worker() {
        let topic = Topic::new("events", 1, 16);
        let consumer = topic.subscribe("realtime-analytics-group").remove(0);
        let handle = tokio::spawn(CounterWorker::new(consumer, Arc::new(FailingStore)).run());

        topic
            .publish(0, Event::new("click", "u1", Timestamp(0)))
            .await
            .unwrap();

        assert!(matches!(
            handle.await.unwrap(),
            Err(StoreError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_events_are_republished_as_json() {
        let topic = Topic::new("events", 1, 16);
        let consumer = topic.subscribe("realtime-analytics-group").remove(0);
        let bus = Arc::new(LocalBus::new(16));
        let mut updates = bus.subscribe();

        let worker = CounterWorker::new(consumer, Arc::new(MemoryCounterStore::new()))
            .with_publisher(bus.clone());
        let handle = tokio::spawn(worker.run());

        topic
            .publish(0, Event::new("view", "u7", Timestamp(42)))
            .await
            .unwrap();
        topic.close();
        handle.await.unwrap().unwrap();

        let payload = updates.next().await.unwrap().unwrap();
        let event: Event = serde_json::from_str(&payload).unwrap();
        assert_eq!(event.subscriber_id, "u7");
        assert_eq!(event.event_type, "view");
        assert_eq!(event.timestamp, Some(Timestamp(42)));
    }
}
