use super::connection::{Connection, WsSink};
use super::registry::ConnectionRegistry;
use crate::config::GatewayConfig;
use crate::observability::spans::connection_span;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::StreamExt;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, Instrument};

/// Route of the live channel
pub const EVENTS_PATH: &str = "/ws/events";

/// Subscriber id from the upgrade request's query parameters.
///
/// The parameter name is matched case-insensitively; an empty value counts
/// as absent.
pub fn subscriber_from_params(params: &HashMap<String, String>) -> Option<String> {
    params
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("userId"))
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[derive(Clone)]
struct GatewayState {
    registry: Arc<ConnectionRegistry>,
    next_id: Arc<AtomicU64>,
    connections: TaskTracker,
    shutdown: CancellationToken,
}

impl GatewayState {
    fn next_connection_id(&self) -> String {
        format!("conn-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// Accepts live-channel clients and registers them for pushes
pub struct GatewayServer {
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
}

impl GatewayServer {
    pub async fn bind(config: &GatewayConfig, registry: Arc<ConnectionRegistry>) -> io::Result<Self> {
        let listener = TcpListener::bind(&config.addr).await?;
        Ok(GatewayServer { listener, registry })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` fires, then wait for every connection to unwind
    pub async fn run(self, shutdown: CancellationToken) {
        let addr = self.local_addr().ok();
        let state = GatewayState {
            registry: self.registry,
            next_id: Arc::new(AtomicU64::new(0)),
            connections: TaskTracker::new(),
            shutdown: shutdown.clone(),
        };
        let app = Router::new()
            .route(EVENTS_PATH, get(upgrade_handler))
            .with_state(state.clone());

        if let Some(addr) = addr {
            info!(%addr, path = EVENTS_PATH, "gateway listening");
        }
        let result = axum::serve(
            self.listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
        })
        .await;
        if let Err(e) = result {
            error!(error = %e, "gateway server error");
        }

        // Upgraded sockets outlive the HTTP server; each one watches the same token
        state.connections.close();
        info!(open = state.connections.len(), "gateway stopping");
        state.connections.wait().await;
    }
}

async fn upgrade_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<GatewayState>,
) -> Response {
    let id = state.next_connection_id();
    let subscriber_id = subscriber_from_params(&params);
    let span = connection_span(&id, &peer.to_string());
    ws.on_upgrade(move |socket| {
        let tracker = state.connections.clone();
        tracker.track_future(serve_connection(state, id, subscriber_id, socket).instrument(span))
    })
}

/// Register right away and keep the channel open until either side leaves
async fn serve_connection(
    state: GatewayState,
    id: String,
    subscriber_id: Option<String>,
    socket: WebSocket,
) {
    if subscriber_id.is_none() {
        info!("no userId on connect, keying connection by its id");
    }
    let (sink, mut inbound) = socket.split();
    let connection = Arc::new(Connection::new(id, subscriber_id, Box::new(WsSink::new(sink))));
    connection.mark_open();
    let key = connection.key().to_string();
    state.registry.register(&key, connection.clone());

    // Push-only: client frames are read and discarded
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            next = inbound.next() => match next {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "client stream error");
                    break;
                }
            },
        }
    }

    connection.close().await;
    state.registry.unregister(&key, &connection);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::gateway::Dispatcher;
    use crate::observability::noop_metrics;
    use std::time::Duration;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message as ClientMessage;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    async fn start_gateway() -> (SocketAddr, Arc<ConnectionRegistry>, CancellationToken, tokio::task::JoinHandle<()>) {
        let config = AppConfig::test().gateway;
        let dispatcher = Arc::new(Dispatcher::start(&config, noop_metrics()));
        let registry = Arc::new(ConnectionRegistry::new(dispatcher, noop_metrics()));
        let server = GatewayServer::bind(&config, registry.clone()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(server.run(shutdown.clone()));
        (addr, registry, shutdown, handle)
    }

    async fn wait_for(registry: &ConnectionRegistry, key: &str) -> Arc<Connection> {
        for _ in 0..200 {
            if let Some(connection) = registry.get(key) {
                return connection;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} never registered", key);
    }

    #[test]
    fn test_subscriber_from_params() {
        assert_eq!(subscriber_from_params(&params(&[("userId", "alex_doe")])).as_deref(), Some("alex_doe"));
        assert_eq!(
            subscriber_from_params(&params(&[("token", "x"), ("USERID", "u2")])).as_deref(),
            Some("u2")
        );
        assert_eq!(subscriber_from_params(&params(&[])), None);
        assert_eq!(subscriber_from_params(&params(&[("userId", "")])), None);
        assert_eq!(subscriber_from_params(&params(&[("user", "u1")])), None);
    }

    #[tokio::test]
    async fn test_silent_client_is_registered_and_receives_pushes() {
        let (addr, registry, shutdown, handle) = start_gateway().await;

        // Connects and never sends a frame
        let (mut client, _) = connect_async(format!("ws://{}{}?userId=u1", addr, EVENTS_PATH))
            .await
            .unwrap();
        let connection = wait_for(&registry, "u1").await;
        assert!(connection.is_open());
        assert_eq!(connection.subscriber_id(), Some("u1"));

        registry.send_to_user("u1", r#"{"count":2}"#);
        let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(frame, ClientMessage::Text(r#"{"count":2}"#.into()));

        shutdown.cancel();
        handle.await.unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_anonymous_client_is_keyed_by_connection_id() {
        let (addr, registry, shutdown, handle) = start_gateway().await;

        let (_client, _) = connect_async(format!("ws://{}{}", addr, EVENTS_PATH)).await.unwrap();
        let connection = wait_for(&registry, "conn-1").await;
        assert_eq!(connection.subscriber_id(), None);
        assert_eq!(registry.len(), 1);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_close_unregisters() {
        let (addr, registry, shutdown, handle) = start_gateway().await;

        let (mut client, _) = connect_async(format!("ws://{}{}?userId=u1", addr, EVENTS_PATH))
            .await
            .unwrap();
        let connection = wait_for(&registry, "u1").await;
        client.close(None).await.unwrap();

        for _ in 0..200 {
            if registry.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(registry.is_empty());
        assert!(!connection.is_open());

        shutdown.cancel();
        handle.await.unwrap();
    }
}
