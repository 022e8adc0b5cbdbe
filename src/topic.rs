//! Partitioned Topic
//!
//! In-process stand-in for the external ordered log. A topic has a fixed
//! number of partitions; every consumer group gets one bounded queue per
//! partition, so ordering holds within a partition and each group sees every
//! record exactly once while the process lives.
//!
//! ```text
//!                       ┌──────────────── group "stream-processor" ──▶ p0, p1, p2
//! producer ──publish──▶ Topic
//!                       └──────────────── group "websocket-push-group" ─▶ p0, p1, p2
//! ```

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

/// Error type for topic operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicError {
    /// The topic was closed or every consumer of a group went away
    Closed { topic: String },
    /// Partition index outside the topic
    UnknownPartition { topic: String, partition: usize },
}

impl std::fmt::Display for TopicError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TopicError::Closed { topic } => write!(f, "topic '{}' is closed", topic),
            TopicError::UnknownPartition { topic, partition } => {
                write!(f, "topic '{}' has no partition {}", topic, partition)
            }
        }
    }
}

impl std::error::Error for TopicError {}

struct ConsumerGroup<T> {
    name: String,
    senders: Vec<mpsc::Sender<T>>,
}

pub struct Topic<T> {
    name: String,
    partitions: usize,
    capacity: usize,
    groups: RwLock<Vec<ConsumerGroup<T>>>,
    closed: RwLock<bool>,
}

impl<T: Clone + Send + 'static> Topic<T> {
    pub fn new(name: impl Into<String>, partitions: usize, capacity: usize) -> Self {
        assert!(partitions > 0, "topic needs at least one partition");
        assert!(capacity > 0, "partition capacity must be positive");
        Topic {
            name: name.into(),
            partitions,
            capacity,
            groups: RwLock::new(Vec::new()),
            closed: RwLock::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn partitions(&self) -> usize {
        self.partitions
    }

    /// Register a consumer group and take its partition consumers.
    ///
    /// Records published before the group subscribed are not replayed.
    pub fn subscribe(&self, group: &str) -> Vec<PartitionConsumer<T>> {
        let mut senders = Vec::with_capacity(self.partitions);
        let mut consumers = Vec::with_capacity(self.partitions);
        for partition in 0..self.partitions {
            let (tx, rx) = mpsc::channel(self.capacity);
            senders.push(tx);
            consumers.push(PartitionConsumer {
                topic: self.name.clone(),
                group: group.to_string(),
                partition,
                rx,
            });
        }

        if *self.closed.read() {
            // Dropping the senders right away hands out already-finished streams.
            drop(senders);
        } else {
            self.groups.write().push(ConsumerGroup {
                name: group.to_string(),
                senders,
            });
        }
        debug!(topic = %self.name, group, "consumer group subscribed");
        consumers
    }

    /// Append a record to `partition` for every consumer group.
    ///
    /// Awaits queue space when a group lags behind (producer backpressure).
    pub async fn publish(&self, partition: usize, record: T) -> Result<(), TopicError> {
        if partition >= self.partitions {
            return Err(TopicError::UnknownPartition {
                topic: self.name.clone(),
                partition,
            });
        }

        // Clone the senders out so no lock is held across an await.
        let targets: Vec<(String, mpsc::Sender<T>)> = {
            if *self.closed.read() {
                return Err(self.closed_error());
            }
            self.groups
                .read()
                .iter()
                .map(|g| (g.name.clone(), g.senders[partition].clone()))
                .collect()
        };

        let Some(((last_group, last_tx), rest)) = targets.split_last() else {
            return Ok(());
        };
        for (group, tx) in rest {
            tx.send(record.clone()).await.map_err(|_| {
                debug!(topic = %self.name, group = %group, "consumer group gone");
                self.closed_error()
            })?;
        }
        last_tx.send(record).await.map_err(|_| {
            debug!(topic = %self.name, group = %last_group, "consumer group gone");
            self.closed_error()
        })
    }

    /// Stop accepting records. Consumers drain what is queued, then end.
    pub fn close(&self) {
        *self.closed.write() = true;
        self.groups.write().clear();
        debug!(topic = %self.name, "topic closed");
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.read()
    }

    fn closed_error(&self) -> TopicError {
        TopicError::Closed {
            topic: self.name.clone(),
        }
    }
}

/// One consumer group's view of one partition.
pub struct PartitionConsumer<T> {
    topic: String,
    group: String,
    partition: usize,
    rx: mpsc::Receiver<T>,
}

impl<T> PartitionConsumer<T> {
    /// Next record in partition order, `None` once the topic is closed and drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn partition(&self) -> usize {
        self.partition
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group(&self) -> &str {
        &self.group
    }
}
