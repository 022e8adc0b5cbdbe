use super::{Observation, TumblingWindows, WindowStats};
use crate::event::{AggregateRecord, Event};
use crate::observability::spans::partition_span;
use crate::observability::SharedMetrics;
use crate::router::EventRouter;
use crate::topic::{PartitionConsumer, Topic, TopicError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, Instrument};

/// Single-threaded aggregation loop for one partition.
///
/// Bucket state is owned by the worker and never shared, so partitions run
/// in parallel without any locking between them.
pub struct AggregatorWorker {
    consumer: PartitionConsumer<Event>,
    output: Arc<Topic<AggregateRecord>>,
    router: EventRouter,
    windows: TumblingWindows,
    idle_flush: Duration,
    progress_every: u64,
    metrics: SharedMetrics,
}

impl AggregatorWorker {
    pub fn new(
        consumer: PartitionConsumer<Event>,
        output: Arc<Topic<AggregateRecord>>,
        window_size_ms: u64,
        metrics: SharedMetrics,
    ) -> Self {
        let router = EventRouter::new(output.partitions());
        AggregatorWorker {
            consumer,
            output,
            router,
            windows: TumblingWindows::new(window_size_ms),
            idle_flush: Duration::from_secs(120),
            progress_every: 10_000,
            metrics,
        }
    }

    /// Flush every open bucket after this much silence on the partition
    pub fn with_idle_flush(mut self, idle_flush: Duration) -> Self {
        self.idle_flush = idle_flush;
        self
    }

    pub fn with_progress_every(mut self, progress_every: u64) -> Self {
        self.progress_every = progress_every.max(1);
        self
    }

    pub fn partition(&self) -> usize {
        self.consumer.partition()
    }

    /// Run until the partition ends, then flush what is still open.
    ///
    /// Failing to hand a record to the aggregates topic stops the worker;
    /// the records already folded are lost with it.
    pub async fn run(self) -> Result<WindowStats, TopicError> {
        let span = partition_span("aggregator", self.partition());
        self.consume().instrument(span).await
    }

    async fn consume(mut self) -> Result<WindowStats, TopicError> {
        let partition = self.partition();
        let started = Instant::now();
        let mut processed = 0u64;

        loop {
            let event = match timeout(self.idle_flush, self.consumer.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(_) => {
                    if self.windows.open_buckets() > 0 {
                        debug!(
                            open = self.windows.open_buckets(),
                            "partition idle, flushing open windows"
                        );
                        let records = self.windows.flush();
                        self.emit(records).await?;
                    }
                    continue;
                }
            };

            let (observation, closed) = self.windows.observe_keyed(
                &event.subscriber_id,
                event.event_time(),
                event.value,
            );
            if observation == Observation::Late {
                debug!(
                    subscriber = %event.subscriber_id,
                    timestamp = event.event_time().as_millis(),
                    "dropping late event for closed window"
                );
                self.metrics.record_late_event(partition);
            }
            self.emit(closed).await?;

            processed += 1;
            if processed % self.progress_every == 0 {
                let elapsed = started.elapsed().as_secs_f64();
                let rate = if elapsed > 0.0 {
                    processed as f64 / elapsed
                } else {
                    0.0
                };
                info!(
                    processed,
                    rate_per_sec = rate as u64,
                    open = self.windows.open_buckets(),
                    "aggregation progress"
                );
            }
        }

        let records = self.windows.flush();
        self.emit(records).await?;
        let stats = self.windows.stats();
        info!(
            observed = stats.observed,
            late = stats.late_dropped,
            emitted = stats.emitted,
            "event stream ended, aggregator stopping"
        );
        Ok(stats)
    }

    async fn emit(&self, records: Vec<AggregateRecord>) -> Result<(), TopicError> {
        if records.is_empty() {
            return Ok(());
        }
        self.metrics
            .record_windows_emitted(self.partition(), records.len());
        for record in records {
            let route = self.router.route_aggregate(&record);
            debug!(
                metric_id = %route.key,
                window_start = record.window_start.as_millis(),
                count = record.count,
                "window closed"
            );
            self.output.publish(route.partition, record).await?;
        }
        Ok(())
    }
}
