//! Top-level error type
//!
//! Each component keeps its own error enum; `PipelineError` is what the
//! wiring layer and the binary see.

use crate::config::ConfigError;
use crate::counter::StoreError;
use crate::pubsub::PubSubError;
use crate::topic::TopicError;
use std::io;

#[derive(Debug)]
pub enum PipelineError {
    Config(ConfigError),
    /// A listener could not bind its address
    Bind {
        component: &'static str,
        source: io::Error,
    },
    /// Aggregator could not hand records to the aggregates topic
    Topic(TopicError),
    /// Counter worker lost its store
    Store(StoreError),
    PubSub(PubSubError),
    /// A pipeline task panicked
    TaskFailed(String),
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::Config(e) => write!(f, "configuration error: {}", e),
            PipelineError::Bind { component, source } => {
                write!(f, "{} failed to bind: {}", component, source)
            }
            PipelineError::Topic(e) => write!(f, "event log error: {}", e),
            PipelineError::Store(e) => write!(f, "counter store error: {}", e),
            PipelineError::PubSub(e) => write!(f, "pub/sub error: {}", e),
            PipelineError::TaskFailed(msg) => write!(f, "pipeline task failed: {}", msg),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::Config(e) => Some(e),
            PipelineError::Bind { source, .. } => Some(source),
            PipelineError::Topic(e) => Some(e),
            PipelineError::Store(e) => Some(e),
            PipelineError::PubSub(e) => Some(e),
            PipelineError::TaskFailed(_) => None,
        }
    }
}

impl From<ConfigError> for PipelineError {
    fn from(e: ConfigError) -> Self {
        PipelineError::Config(e)
    }
}

impl From<TopicError> for PipelineError {
    fn from(e: TopicError) -> Self {
        PipelineError::Topic(e)
    }
}

impl From<StoreError> for PipelineError {
    fn from(e: StoreError) -> Self {
        PipelineError::Store(e)
    }
}

impl From<PubSubError> for PipelineError {
    fn from(e: PubSubError) -> Self {
        PipelineError::PubSub(e)
    }
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(e: tokio::task::JoinError) -> Self {
        PipelineError::TaskFailed(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_display_and_source() {
        let err: PipelineError = TopicError::Closed {
            topic: "events-aggregated".to_string(),
        }
        .into();
        assert_eq!(err.to_string(), "event log error: topic 'events-aggregated' is closed");
        assert!(err.source().is_some());

        let err = PipelineError::Bind {
            component: "gateway",
            source: io::Error::new(io::ErrorKind::AddrInUse, "in use"),
        };
        assert!(err.to_string().starts_with("gateway failed to bind"));
    }
}
