pub mod aggregator;
pub mod config;
pub mod counter;
pub mod error;
pub mod event;
#[cfg(test)]
mod fake_redis;
pub mod gateway;
pub mod ingest;
pub mod pipeline;
pub mod pubsub;
pub mod relay;
pub mod router;
pub mod time;
pub mod topic;

// Observability: feature-gated Datadog integration
#[cfg(feature = "datadog")]
pub mod observability;

#[cfg(not(feature = "datadog"))]
#[path = "observability_noop.rs"]
pub mod observability;

pub use aggregator::{AggregatorWorker, TumblingWindows, WindowBucket, WindowStats};
pub use config::{AppConfig, BackpressurePolicy, ConfigError};
pub use counter::{CounterKey, CounterStore, MemoryCounterStore, RedisCounterStore, StoreError};
pub use error::PipelineError;
pub use event::{AggregateRecord, Event};
pub use gateway::{Connection, ConnectionRegistry, Dispatcher, GatewayServer, MessageSink, SendOutcome};
pub use ingest::{IngestError, IngestServer, IngestService};
pub use pipeline::{Pipeline, PipelineHandle, ShutdownReport};
pub use pubsub::{PubSubError, Subscription};
pub use relay::{AggregateRelay, BroadcastRelay};
pub use router::EventRouter;
pub use time::Timestamp;
pub use topic::{PartitionConsumer, Topic, TopicError};
