//! Event Router
//!
//! Assigns the ordering key and partition for every record handed to a
//! topic. FNV-1a is used instead of `DefaultHasher` because the partition of
//! a key has to be identical across processes and compiler releases.

use crate::event::{AggregateRecord, Event};
use fnv::FnvHasher;
use std::hash::Hasher;

/// Ordering key and partition chosen for a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub key: String,
    pub partition: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct EventRouter {
    partitions: usize,
}

impl EventRouter {
    pub fn new(partitions: usize) -> Self {
        assert!(partitions > 0, "router needs at least one partition");
        EventRouter { partitions }
    }

    pub fn partitions(&self) -> usize {
        self.partitions
    }

    #[inline]
    pub fn partition_for(&self, key: &str) -> usize {
        let mut hasher = FnvHasher::default();
        hasher.write(key.as_bytes());
        (hasher.finish() % self.partitions as u64) as usize
    }

    /// Raw events are ordered per subscriber.
    pub fn route(&self, event: &Event) -> Route {
        Route {
            key: event.subscriber_id.clone(),
            partition: self.partition_for(&event.subscriber_id),
        }
    }

    /// Aggregates are ordered per metric id (the subscriber they belong to).
    pub fn route_aggregate(&self, record: &AggregateRecord) -> Route {
        Route {
            key: record.metric_id.clone(),
            partition: self.partition_for(&record.metric_id),
        }
    }
}
