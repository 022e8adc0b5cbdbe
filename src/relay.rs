//! Aggregate Relay and Broadcast Relay
//!
//! Both are thin loops that turn an upstream stream into registry calls:
//! closed-window records go to their owning subscriber, pub/sub payloads go
//! to every connection on this instance.

use crate::event::AggregateRecord;
use crate::gateway::{ConnectionRegistry, SendOutcome};
use crate::pubsub::{PubSubError, Subscription};
use crate::topic::PartitionConsumer;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct AggregateRelay {
    registry: Arc<ConnectionRegistry>,
}

impl AggregateRelay {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        AggregateRelay { registry }
    }

    /// Push one record, serialized as JSON, to `record.metric_id`.
    /// Serialization failures drop the record.
    pub fn on_aggregate(&self, record: &AggregateRecord) -> Option<SendOutcome> {
        match record.to_json() {
            Ok(payload) => Some(self.registry.send_to_user(&record.metric_id, &payload)),
            Err(e) => {
                warn!(metric_id = %record.metric_id, error = %e, "failed to serialize aggregate, dropping");
                None
            }
        }
    }

    /// Relay every partition of the aggregates topic until all of them end
    pub async fn run(self, consumers: Vec<PartitionConsumer<AggregateRecord>>) -> u64 {
        let loops = consumers.into_iter().map(|consumer| self.clone().run_partition(consumer));
        let relayed: u64 = join_all(loops).await.into_iter().sum();
        info!(relayed, "aggregate stream ended, relay stopping");
        relayed
    }

    async fn run_partition(self, mut consumer: PartitionConsumer<AggregateRecord>) -> u64 {
        let mut relayed = 0;
        while let Some(record) = consumer.recv().await {
            let outcome = self.on_aggregate(&record);
            debug!(
                partition = consumer.partition(),
                metric_id = %record.metric_id,
                ?outcome,
                "aggregate relayed"
            );
            relayed += 1;
        }
        relayed
    }
}

/// Forwards every pub/sub payload to all local connections
pub struct BroadcastRelay {
    registry: Arc<ConnectionRegistry>,
    subscription: Subscription,
}

impl BroadcastRelay {
    pub fn new(registry: Arc<ConnectionRegistry>, subscription: Subscription) -> Self {
        BroadcastRelay {
            registry,
            subscription,
        }
    }

    /// Forward until the local bus goes away. Losing a Redis subscription
    /// is returned as an error so the pipeline can fail closed.
    pub async fn run(mut self) -> Result<u64, PubSubError> {
        let mut forwarded = 0;
        while let Some(payload) = self.subscription.next().await? {
            let dispatched = self.registry.broadcast(&payload);
            debug!(dispatched, "live update broadcast");
            forwarded += 1;
        }
        info!(forwarded, "pub/sub subscription ended, broadcast relay stopping");
        Ok(forwarded)
    }
}
