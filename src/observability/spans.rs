//! Span Helpers
//!
//! Structured spans for the long-lived tasks of the pipeline, using
//! OpenTelemetry semantic field names where one exists.

use tracing::{span, Level, Span};

/// Create a span for a live gateway connection
#[inline]
pub fn connection_span(connection_id: &str, peer_addr: &str) -> Span {
    span!(
        Level::INFO,
        "gateway.connection",
        connection.id = %connection_id,
        client.address = %peer_addr,
        otel.kind = "server"
    )
}

/// Create a span for a partition consumer (aggregator or counter)
#[inline]
pub fn partition_span(component: &'static str, partition: usize) -> Span {
    span!(
        Level::INFO,
        "pipeline.partition",
        component = component,
        partition = partition,
        otel.kind = "consumer"
    )
}

/// Create a span for one dispatched delivery
#[inline]
pub fn delivery_span(subscriber_key: &str) -> Span {
    span!(
        Level::DEBUG,
        "gateway.delivery",
        subscriber.key = %subscriber_key,
        otel.kind = "producer"
    )
}

/// Create a span for one ingest request
#[inline]
pub fn ingest_span(peer_addr: &str) -> Span {
    span!(
        Level::INFO,
        "ingest.request",
        client.address = %peer_addr,
        otel.kind = "server"
    )
}
