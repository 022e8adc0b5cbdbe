//! Live connection state machine
//!
//! ```text
//! Connecting ──mark_open──▶ Open ──mark_closed──▶ Closed
//!      └──────────────mark_closed──────────────────▲
//! ```
//!
//! `Closed` is terminal. Writes to the transport go through an async mutex,
//! so one connection never sees two concurrent writes.

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::SinkExt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::Mutex;
use tracing::debug;

/// Error type for a single delivery
#[derive(Debug)]
pub enum DeliveryError {
    /// Connection not open (not yet registered or already closed)
    Closed,
    /// Transport write failed
    Transport(io::Error),
    /// Write did not finish within the send timeout
    Timeout,
}

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryError::Closed => write!(f, "connection is not open"),
            DeliveryError::Transport(e) => write!(f, "transport error: {}", e),
            DeliveryError::Timeout => write!(f, "send timed out"),
        }
    }
}

impl std::error::Error for DeliveryError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Open = 1,
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Open,
            _ => ConnectionState::Closed,
        }
    }
}

/// Outbound half of a client transport
pub trait MessageSink: Send {
    /// Write one text frame
    fn send_text<'a>(
        &'a mut self,
        text: &'a str,
    ) -> Pin<Box<dyn Future<Output = io::Result<()>> + Send + 'a>>;

    /// Flush and shut down the outbound direction
    fn close(&mut self) -> Pin<Box<dyn Future<Output = io::Result<()>> + Send + '_>>;
}

/// Text frames over the outbound half of an upgraded WebSocket
pub struct WsSink {
    socket: SplitSink<WebSocket, Message>,
}

impl WsSink {
    pub fn new(socket: SplitSink<WebSocket, Message>) -> Self {
        WsSink { socket }
    }
}

fn ws_to_io(e: axum::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

impl MessageSink for WsSink {
    fn send_text<'a>(
        &'a mut self,
        text: &'a str,
    ) -> Pin<Box<dyn Future<Output = io::Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.socket
                .send(Message::Text(text.to_string().into()))
                .await
                .map_err(ws_to_io)
        })
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = io::Result<()>> + Send + '_>> {
        Box::pin(async move {
            // Peer may already be gone; the close frame is best effort
            let _ = self.socket.send(Message::Close(None)).await;
            self.socket.close().await.map_err(ws_to_io)
        })
    }
}

pub struct Connection {
    id: String,
    subscriber_id: Option<String>,
    state: AtomicU8,
    sink: Mutex<Box<dyn MessageSink>>,
}

impl Connection {
    /// New connection in `Connecting`. An empty subscriber id counts as absent.
    pub fn new(
        id: impl Into<String>,
        subscriber_id: Option<String>,
        sink: Box<dyn MessageSink>,
    ) -> Self {
        Connection {
            id: id.into(),
            subscriber_id: subscriber_id.filter(|s| !s.is_empty()),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            sink: Mutex::new(sink),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn subscriber_id(&self) -> Option<&str> {
        self.subscriber_id.as_deref()
    }

    /// Registry key: the subscriber id, or the connection id for anonymous clients
    pub fn key(&self) -> &str {
        self.subscriber_id.as_deref().unwrap_or(&self.id)
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Upgrade done. Only valid from `Connecting`.
    pub fn mark_open(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Connecting as u8,
                ConnectionState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Returns true for the call that performed the transition.
    pub fn mark_closed(&self) -> bool {
        let previous = self
            .state
            .swap(ConnectionState::Closed as u8, Ordering::AcqRel);
        previous != ConnectionState::Closed as u8
    }

    /// Write one message. Sends queued behind the lock when the connection
    /// closes give up without touching the transport.
    pub async fn send(&self, message: &str) -> Result<(), DeliveryError> {
        if !self.is_open() {
            return Err(DeliveryError::Closed);
        }
        let mut sink = self.sink.lock().await;
        if !self.is_open() {
            return Err(DeliveryError::Closed);
        }
        sink.send_text(message)
            .await
            .map_err(DeliveryError::Transport)
    }

    /// Mark closed and shut the transport down
    pub async fn close(&self) {
        if self.mark_closed() {
            let mut sink = self.sink.lock().await;
            if let Err(e) = sink.close().await {
                debug!(connection_id = %self.id, error = %e, "error closing transport");
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("subscriber_id", &self.subscriber_id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::Arc;

    /// Sink that keeps every frame, or fails every write
    #[derive(Clone, Default)]
    pub struct RecordingSink {
        pub frames: Arc<SyncMutex<Vec<String>>>,
        pub fail: bool,
    }

    impl RecordingSink {
        pub fn failing() -> Self {
            RecordingSink {
                fail: true,
                ..Default::default()
            }
        }

        pub fn frames(&self) -> Vec<String> {
            self.frames.lock().clone()
        }
    }

    impl MessageSink for RecordingSink {
        fn send_text<'a>(
            &'a mut self,
            text: &'a str,
        ) -> Pin<Box<dyn Future<Output = io::Result<()>> + Send + 'a>> {
            Box::pin(async move {
                if self.fail {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"));
                }
                self.frames.lock().push(text.to_string());
                Ok(())
            })
        }

        fn close(&mut self) -> Pin<Box<dyn Future<Output = io::Result<()>> + Send + '_>> {
            Box::pin(async { Ok(()) })
        }
    }

    /// Open connection writing into a fresh recording sink
    pub fn open_connection(id: &str, subscriber: Option<&str>) -> (Arc<Connection>, RecordingSink) {
        open_connection_with(id, subscriber, RecordingSink::default())
    }

    pub fn open_connection_with(
        id: &str,
        subscriber: Option<&str>,
        sink: RecordingSink,
    ) -> (Arc<Connection>, RecordingSink) {
        let connection = Arc::new(Connection::new(
            id,
            subscriber.map(str::to_string),
            Box::new(sink.clone()),
        ));
        connection.mark_open();
        (connection, sink)
    }
}
