//! Ingest endpoint
//!
//! `POST /events` with one JSON event per request. The reply is `202` once
//! the event sits on the raw events topic; the endpoint never waits on
//! aggregation. Malformed or invalid events get `400` with the reason.

use crate::config::IngestConfig;
use crate::event::Event;
use crate::observability::spans::ingest_span;
use crate::observability::SharedMetrics;
use crate::router::EventRouter;
use crate::time::Timestamp;
use crate::topic::Topic;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// Route of the ingest endpoint
pub const EVENTS_PATH: &str = "/events";

/// Body written for each ingest request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum IngestReply {
    Accepted,
    Rejected { reason: String },
}

/// Why an event was not appended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    /// Body is not an event document
    Malformed(String),
    /// Event parsed but failed validation
    Invalid(String),
    /// Event log refused the append (closed during shutdown)
    Unavailable(String),
}

impl IngestError {
    pub fn reason(&self) -> &str {
        match self {
            IngestError::Malformed(reason)
            | IngestError::Invalid(reason)
            | IngestError::Unavailable(reason) => reason,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            IngestError::Malformed(_) | IngestError::Invalid(_) => StatusCode::BAD_REQUEST,
            IngestError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl std::fmt::Display for IngestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.reason())
    }
}

impl std::error::Error for IngestError {}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = IngestReply::Rejected {
            reason: self.reason().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Validation, stamping and routing of inbound events
#[derive(Clone)]
pub struct IngestService {
    events: Arc<Topic<Event>>,
    router: EventRouter,
    metrics: SharedMetrics,
}

impl IngestService {
    pub fn new(events: Arc<Topic<Event>>, metrics: SharedMetrics) -> Self {
        let router = EventRouter::new(events.partitions());
        IngestService {
            events,
            router,
            metrics,
        }
    }

    /// Handle one raw JSON body
    pub async fn ingest_json(&self, body: &[u8]) -> Result<(), IngestError> {
        let event = serde_json::from_slice::<Event>(body).map_err(|e| {
            debug!(error = %e, "malformed event");
            IngestError::Malformed(format!("malformed event: {}", e))
        })?;
        self.ingest(event).await
    }

    pub async fn ingest(&self, mut event: Event) -> Result<(), IngestError> {
        event.validate().map_err(IngestError::Invalid)?;
        if event.timestamp.is_none() {
            event.timestamp = Some(Timestamp::now());
        }

        let route = self.router.route(&event);
        info!(
            subscriber = %route.key,
            event_type = %event.event_type,
            partition = route.partition,
            "received event"
        );
        let event_type = event.event_type.clone();
        match self.events.publish(route.partition, event).await {
            Ok(()) => {
                self.metrics.record_event_ingested(&event_type);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "failed to append event");
                Err(IngestError::Unavailable(e.to_string()))
            }
        }
    }
}

pub struct IngestServer {
    listener: TcpListener,
    service: IngestService,
    max_body_bytes: usize,
}

impl IngestServer {
    pub async fn bind(config: &IngestConfig, service: IngestService) -> io::Result<Self> {
        let listener = TcpListener::bind(&config.addr).await?;
        Ok(IngestServer {
            listener,
            service,
            max_body_bytes: config.max_body_bytes,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` fires; in-flight requests finish first
    pub async fn run(self, shutdown: CancellationToken) {
        if let Ok(addr) = self.local_addr() {
            info!(%addr, path = EVENTS_PATH, "ingest listening");
        }
        let app = Router::new()
            .route(EVENTS_PATH, post(post_event))
            .layer(DefaultBodyLimit::max(self.max_body_bytes))
            .with_state(self.service);

        let result = axum::serve(
            self.listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
        })
        .await;
        if let Err(e) = result {
            error!(error = %e, "ingest server error");
        }
        info!("ingest stopped");
    }
}

async fn post_event(
    State(service): State<IngestService>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> Result<(StatusCode, Json<IngestReply>), IngestError> {
    let span = ingest_span(&peer.to_string());
    service.ingest_json(&body).instrument(span).await?;
    Ok((StatusCode::ACCEPTED, Json(IngestReply::Accepted)))
}
