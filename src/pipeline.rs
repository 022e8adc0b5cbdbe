//! Pipeline wiring
//!
//! ```text
//! ingest ──▶ [events] ──┬─ stream-processor ─────────▶ AggregatorWorker ──▶ [events-aggregated]
//!                       └─ realtime-analytics-group ─▶ CounterWorker ──▶ store (+ live-updates)
//!
//! [events-aggregated] ── websocket-push-group ──▶ AggregateRelay ──▶ ConnectionRegistry ──▶ clients
//! live-updates ──▶ BroadcastRelay ──▶ ConnectionRegistry::broadcast
//! ```
//!
//! Shutdown runs front to back so every stage drains into a live consumer:
//! ingest stops, `events` closes, workers flush, `events-aggregated` closes,
//! the relay finishes, the dispatcher drains, and only then does the gateway
//! close its client connections.

use crate::aggregator::{AggregatorWorker, WindowStats};
use crate::config::{AppConfig, CounterBackend, PubSubBackend};
use crate::counter::{CounterStore, CounterWorker, MemoryCounterStore, RedisCounterStore};
use crate::error::PipelineError;
use crate::event::{AggregateRecord, Event};
use crate::gateway::{ConnectionRegistry, Dispatcher, GatewayServer};
use crate::ingest::{IngestServer, IngestService};
use crate::observability::SharedMetrics;
use crate::pubsub::{LocalBus, Publisher, RedisPublisher, Subscription};
use crate::relay::{AggregateRelay, BroadcastRelay};
use crate::topic::Topic;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub const AGGREGATOR_GROUP: &str = "stream-processor";
pub const COUNTER_GROUP: &str = "realtime-analytics-group";
pub const RELAY_GROUP: &str = "websocket-push-group";

/// Totals collected while shutting down
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub windows: WindowStats,
    pub counted: u64,
    pub relayed: u64,
}

/// First fatal worker error, shared by every task of one pipeline
#[derive(Clone, Default)]
struct FailureSlot {
    error: Arc<Mutex<Option<PipelineError>>>,
    tripped: CancellationToken,
}

impl FailureSlot {
    fn record(&self, component: &str, e: PipelineError) {
        error!(component, error = %e, "pipeline worker failed, cancelling pipeline");
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(e);
        }
        self.tripped.cancel();
    }

    fn take(&self) -> Option<PipelineError> {
        self.error.lock().take()
    }
}

pub struct Pipeline;

impl Pipeline {
    /// Build every stage from `config` and start it
    pub async fn start(config: AppConfig, metrics: SharedMetrics) -> Result<PipelineHandle, PipelineError> {
        let connect_timeout = Duration::from_millis(config.counter_store.connect_timeout_ms);
        let store: Arc<dyn CounterStore> = match config.counter_store.backend {
            CounterBackend::Memory => Arc::new(MemoryCounterStore::new()),
            CounterBackend::Redis => Arc::new(RedisCounterStore::new(
                config.counter_store.url.clone(),
                connect_timeout,
            )),
        };
        Self::start_with_store(config, metrics, store).await
    }

    /// Same as `start`, with a caller-provided counter store
    pub async fn start_with_store(
        config: AppConfig,
        metrics: SharedMetrics,
        store: Arc<dyn CounterStore>,
    ) -> Result<PipelineHandle, PipelineError> {
        config.validate()?;

        let events: Arc<Topic<Event>> = Arc::new(Topic::new(
            config.log.events_topic.clone(),
            config.log.partitions,
            config.log.partition_capacity,
        ));
        let aggregates: Arc<Topic<AggregateRecord>> = Arc::new(Topic::new(
            config.log.aggregates_topic.clone(),
            config.log.partitions,
            config.log.partition_capacity,
        ));

        let (publisher, subscription) = connect_pubsub(&config).await?;

        let dispatcher = Arc::new(Dispatcher::start(&config.gateway, metrics.clone()));
        let registry = Arc::new(ConnectionRegistry::new(dispatcher.clone(), metrics.clone()));

        let (ingest, gateway) = match bind_listeners(&config, &events, &registry, &metrics).await {
            Ok(listeners) => listeners,
            Err(e) => {
                dispatcher.shutdown().await;
                return Err(e);
            }
        };
        let ingest_addr = ingest.local_addr().map_err(|source| PipelineError::Bind {
            component: "ingest",
            source,
        })?;
        let gateway_addr = gateway.local_addr().map_err(|source| PipelineError::Bind {
            component: "gateway",
            source,
        })?;

        let failure = FailureSlot::default();
        let shutdown = CancellationToken::new();

        // Every consumer group subscribes before the first event can arrive
        let relay_consumers = aggregates.subscribe(RELAY_GROUP);
        let relay = tokio::spawn(AggregateRelay::new(registry.clone()).run(relay_consumers));

        let aggregators: Vec<JoinHandle<Option<WindowStats>>> = events
            .subscribe(AGGREGATOR_GROUP)
            .into_iter()
            .map(|consumer| {
                let worker = AggregatorWorker::new(
                    consumer,
                    aggregates.clone(),
                    config.aggregator.window_size_ms,
                    metrics.clone(),
                )
                .with_idle_flush(config.aggregator.idle_flush())
                .with_progress_every(config.aggregator.progress_every);
                let failure = failure.clone();
                tokio::spawn(async move {
                    match worker.run().await {
                        Ok(stats) => Some(stats),
                        Err(e) => {
                            failure.record("aggregator", e.into());
                            None
                        }
                    }
                })
            })
            .collect();

        let counters: Vec<JoinHandle<Option<u64>>> = events
            .subscribe(COUNTER_GROUP)
            .into_iter()
            .map(|consumer| {
                let mut worker = CounterWorker::new(consumer, store.clone());
                if let Some(publisher) = &publisher {
                    worker = worker.with_publisher(publisher.clone());
                }
                let failure = failure.clone();
                tokio::spawn(async move {
                    match worker.run().await {
                        Ok(counted) => Some(counted),
                        Err(e) => {
                            failure.record("counter", e.into());
                            None
                        }
                    }
                })
            })
            .collect();

        // Stopped only after the counter workers, the last publishers, are done
        let broadcast_stop = CancellationToken::new();
        let broadcast = subscription.map(|subscription| {
            let relay = BroadcastRelay::new(registry.clone(), subscription);
            let stop = broadcast_stop.clone();
            let failure = failure.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = stop.cancelled() => {}
                    result = relay.run() => {
                        if let Err(e) = result {
                            failure.record("broadcast", e.into());
                        }
                    }
                }
            })
        });

        // Ingest stops on shutdown or on the first worker failure
        let ingest_stop = CancellationToken::new();
        {
            let tripped = failure.tripped.clone();
            let shutdown = shutdown.clone();
            let stop = ingest_stop.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tripped.cancelled() => {}
                    _ = shutdown.cancelled() => {}
                }
                stop.cancel();
            });
        }
        let ingest_task = tokio::spawn(ingest.run(ingest_stop));
        // Cancelled last, after the dispatcher has drained
        let gateway_stop = CancellationToken::new();
        let gateway_task = tokio::spawn(gateway.run(gateway_stop.clone()));

        info!(
            %ingest_addr,
            %gateway_addr,
            partitions = config.log.partitions,
            window_size_ms = config.aggregator.window_size_ms,
            "pipeline started"
        );

        Ok(PipelineHandle {
            ingest_addr,
            gateway_addr,
            events,
            aggregates,
            registry,
            dispatcher,
            shutdown,
            failure,
            ingest: ingest_task,
            gateway: gateway_task,
            gateway_stop,
            aggregators,
            counters,
            relay,
            broadcast,
            broadcast_stop,
        })
    }
}

async fn bind_listeners(
    config: &AppConfig,
    events: &Arc<Topic<Event>>,
    registry: &Arc<ConnectionRegistry>,
    metrics: &SharedMetrics,
) -> Result<(IngestServer, GatewayServer), PipelineError> {
    let service = IngestService::new(events.clone(), metrics.clone());
    let ingest = IngestServer::bind(&config.ingest, service)
        .await
        .map_err(|source| PipelineError::Bind {
            component: "ingest",
            source,
        })?;
    let gateway = GatewayServer::bind(&config.gateway, registry.clone())
        .await
        .map_err(|source| PipelineError::Bind {
            component: "gateway",
            source,
        })?;
    Ok((ingest, gateway))
}

type PubSubPair = (Option<Arc<dyn Publisher>>, Option<Subscription>);

async fn connect_pubsub(config: &AppConfig) -> Result<PubSubPair, PipelineError> {
    let timeout = Duration::from_millis(config.counter_store.connect_timeout_ms);
    match config.pubsub.backend {
        PubSubBackend::Disabled => Ok((None, None)),
        PubSubBackend::Local => {
            let bus = LocalBus::new(config.pubsub.local_capacity);
            let subscription = bus.subscribe();
            Ok((Some(Arc::new(bus)), Some(subscription)))
        }
        PubSubBackend::Redis => {
            let subscription =
                Subscription::redis(&config.pubsub.url, &config.pubsub.channel, timeout).await?;
            let publisher = RedisPublisher::new(
                config.pubsub.url.clone(),
                config.pubsub.channel.clone(),
                timeout,
            );
            Ok((Some(Arc::new(publisher)), Some(subscription)))
        }
    }
}

pub struct PipelineHandle {
    ingest_addr: SocketAddr,
    gateway_addr: SocketAddr,
    events: Arc<Topic<Event>>,
    aggregates: Arc<Topic<AggregateRecord>>,
    registry: Arc<ConnectionRegistry>,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
    failure: FailureSlot,
    ingest: JoinHandle<()>,
    gateway: JoinHandle<()>,
    gateway_stop: CancellationToken,
    aggregators: Vec<JoinHandle<Option<WindowStats>>>,
    counters: Vec<JoinHandle<Option<u64>>>,
    relay: JoinHandle<u64>,
    broadcast: Option<JoinHandle<()>>,
    broadcast_stop: CancellationToken,
}

impl PipelineHandle {
    pub fn ingest_addr(&self) -> SocketAddr {
        self.ingest_addr
    }

    pub fn gateway_addr(&self) -> SocketAddr {
        self.gateway_addr
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Resolve when a worker fails, with its error
    pub async fn wait(&self) -> PipelineError {
        self.failure.tripped.cancelled().await;
        self.failure
            .take()
            .unwrap_or_else(|| PipelineError::TaskFailed("pipeline cancelled".to_string()))
    }

    /// Ordered shutdown; returns the first worker failure if there was one
    pub async fn shutdown(self) -> Result<ShutdownReport, PipelineError> {
        info!("pipeline shutting down");
        self.shutdown.cancel();
        self.ingest.await?;

        self.events.close();
        let mut report = ShutdownReport::default();
        for aggregator in self.aggregators {
            if let Some(stats) = aggregator.await? {
                report.windows.observed += stats.observed;
                report.windows.folded += stats.folded;
                report.windows.late_dropped += stats.late_dropped;
                report.windows.emitted += stats.emitted;
            }
        }
        for counter in self.counters {
            report.counted += counter.await?.unwrap_or(0);
        }

        self.broadcast_stop.cancel();
        if let Some(broadcast) = self.broadcast {
            broadcast.await?;
        }

        self.aggregates.close();
        report.relayed = self.relay.await?;

        self.dispatcher.shutdown().await;
        self.gateway_stop.cancel();
        self.gateway.await?;
        info!(
            observed = report.windows.observed,
            emitted = report.windows.emitted,
            counted = report.counted,
            relayed = report.relayed,
            "pipeline stopped"
        );

        match self.failure.take() {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::noop_metrics;

    #[tokio::test]
    async fn test_start_and_shutdown_without_traffic() {
        let handle = Pipeline::start(AppConfig::test(), noop_metrics()).await.unwrap();
        assert_ne!(handle.ingest_addr().port(), 0);
        assert_ne!(handle.gateway_addr().port(), 0);

        let report = handle.shutdown().await.unwrap();
        assert_eq!(report, ShutdownReport::default());
    }

    #[tokio::test]
    async fn test_invalid_config_is_refused() {
        let config = AppConfig::test().with_partitions(0);
        assert!(matches!(
            Pipeline::start(config, noop_metrics()).await,
            Err(PipelineError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_lost_redis_subscription_fails_the_pipeline() {
        use crate::fake_redis::{AfterSubscribe, FakeRedis};

        let url = FakeRedis::new()
            .after_subscribe(AfterSubscribe::PushThenDrop(Vec::new()))
            .spawn()
            .await;
        let mut config = AppConfig::test().with_pubsub(PubSubBackend::Redis);
        config.pubsub.url = url;
        let handle = Pipeline::start(config, noop_metrics()).await.unwrap();

        let err = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("pipeline never noticed the dropped subscription");
        assert!(matches!(err, PipelineError::PubSub(_)), "{:?}", err);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_local_pubsub_wiring_starts() {
        let config = AppConfig::test().with_pubsub(PubSubBackend::Local);
        let handle = Pipeline::start(config, noop_metrics()).await.unwrap();
        handle.shutdown().await.unwrap();
    }
}
