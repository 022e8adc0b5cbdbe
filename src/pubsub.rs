//! Publish/Subscribe broadcast channel
//!
//! Carries structured (JSON) messages to every gateway instance. A single
//! process uses the in-memory `LocalBus`; several gateway processes share a
//! Redis channel through `RedisPublisher` and `Subscription::redis`.

use futures::stream::{BoxStream, StreamExt};
use redis::aio::ConnectionManager;
use redis::Client;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Error type for pub/sub operations
#[derive(Debug)]
pub enum PubSubError {
    /// No subscriber is listening on the local bus
    NoSubscribers,
    Transport(redis::RedisError),
    /// Connecting or subscribing did not finish in time
    Timeout,
    /// The server closed a live subscription
    Disconnected { channel: String },
}

impl std::fmt::Display for PubSubError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PubSubError::NoSubscribers => write!(f, "no subscribers on the broadcast channel"),
            PubSubError::Transport(e) => write!(f, "pub/sub transport error: {}", e),
            PubSubError::Timeout => write!(f, "pub/sub connection timed out"),
            PubSubError::Disconnected { channel } => {
                write!(f, "subscription to '{}' was closed by the server", channel)
            }
        }
    }
}

impl std::error::Error for PubSubError {}

impl From<redis::RedisError> for PubSubError {
    fn from(e: redis::RedisError) -> Self {
        PubSubError::Transport(e)
    }
}

pub trait Publisher: Send + Sync {
    /// Publish one structured payload to every subscriber of the channel.
    /// Returns how many subscribers received it.
    fn publish<'a>(
        &'a self,
        payload: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<usize, PubSubError>> + Send + 'a>>;
}

/// In-process broadcast channel
#[derive(Clone)]
pub struct LocalBus {
    tx: broadcast::Sender<Arc<str>>,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        LocalBus { tx }
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            inner: SubscriptionInner::Local(self.tx.subscribe()),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Publisher for LocalBus {
    fn publish<'a>(
        &'a self,
        payload: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<usize, PubSubError>> + Send + 'a>> {
        let result = self
            .tx
            .send(Arc::from(payload))
            .map_err(|_| PubSubError::NoSubscribers);
        Box::pin(async move { result })
    }
}

/// `PUBLISH` to a Redis channel
pub struct RedisPublisher {
    url: String,
    channel: String,
    connect_timeout: Duration,
    manager: Mutex<Option<ConnectionManager>>,
}

impl RedisPublisher {
    pub fn new(url: impl Into<String>, channel: impl Into<String>, connect_timeout: Duration) -> Self {
        RedisPublisher {
            url: url.into(),
            channel: channel.into(),
            connect_timeout,
            manager: Mutex::new(None),
        }
    }

    async fn connection(&self) -> Result<ConnectionManager, PubSubError> {
        let mut guard = self.manager.lock().await;
        if let Some(manager) = guard.as_ref() {
            return Ok(manager.clone());
        }
        let client = Client::open(self.url.as_str())?;
        let manager = timeout(self.connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| PubSubError::Timeout)??;
        *guard = Some(manager.clone());
        Ok(manager)
    }

    async fn publish_now(&self, payload: &str) -> Result<usize, PubSubError> {
        let mut conn = self.connection().await?;
        let receivers = redis::cmd("PUBLISH")
            .arg(&self.channel)
            .arg(payload)
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(receivers.max(0) as usize)
    }
}

impl Publisher for RedisPublisher {
    fn publish<'a>(
        &'a self,
        payload: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<usize, PubSubError>> + Send + 'a>> {
        Box::pin(self.publish_now(payload))
    }
}

enum SubscriptionInner {
    Local(broadcast::Receiver<Arc<str>>),
    Redis {
        messages: BoxStream<'static, redis::Msg>,
        channel: String,
    },
}

/// Receiving side of the broadcast channel
pub struct Subscription {
    inner: SubscriptionInner,
}

impl Subscription {
    /// Open a dedicated pub/sub connection and `SUBSCRIBE` to `channel`
    pub async fn redis(url: &str, channel: &str, connect_timeout: Duration) -> Result<Self, PubSubError> {
        let client = Client::open(url)?;
        let subscribe = async {
            let mut pubsub = client.get_async_pubsub().await?;
            pubsub.subscribe(channel).await?;
            Ok::<_, redis::RedisError>(pubsub)
        };
        let pubsub = timeout(connect_timeout, subscribe)
            .await
            .map_err(|_| PubSubError::Timeout)??;
        debug!(url, channel, "subscribed to pub/sub channel");

        Ok(Subscription {
            inner: SubscriptionInner::Redis {
                messages: pubsub.into_on_message().boxed(),
                channel: channel.to_string(),
            },
        })
    }

    /// Next payload.
    ///
    /// `Ok(None)` means the local bus was dropped. A Redis subscription never
    /// ends cleanly: losing it is `PubSubError::Disconnected`.
    pub async fn next(&mut self) -> Result<Option<String>, PubSubError> {
        match &mut self.inner {
            SubscriptionInner::Local(rx) => loop {
                match rx.recv().await {
                    Ok(payload) => return Ok(Some(payload.to_string())),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "broadcast subscriber lagged, messages skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(None),
                }
            },
            SubscriptionInner::Redis { messages, channel } => loop {
                let Some(msg) = messages.next().await else {
                    return Err(PubSubError::Disconnected {
                        channel: channel.clone(),
                    });
                };
                if msg.get_channel_name() != channel.as_str() {
                    continue;
                }
                match msg.get_payload::<String>() {
                    Ok(payload) => return Ok(Some(payload)),
                    Err(e) => warn!(error = %e, "non-text pub/sub payload skipped"),
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_redis::{AfterSubscribe, FakeRedis};

    #[tokio::test]
    async fn test_local_bus_fans_out_to_every_subscriber() {
        let bus = LocalBus::new(16);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        assert_eq!(bus.publish(r#"{"n":1}"#).await.unwrap(), 2);
        assert_eq!(a.next().await.unwrap().as_deref(), Some(r#"{"n":1}"#));
        assert_eq!(b.next().await.unwrap().as_deref(), Some(r#"{"n":1}"#));
    }

    #[tokio::test]
    async fn test_local_bus_without_subscribers() {
        let bus = LocalBus::new(4);
        assert!(matches!(
            bus.publish("x").await,
            Err(PubSubError::NoSubscribers)
        ));
    }

    #[tokio::test]
    async fn test_lagged_subscriber_keeps_receiving() {
        let bus = LocalBus::new(2);
        let mut sub = bus.subscribe();
        for i in 0..5 {
            bus.publish(&i.to_string()).await.unwrap();
        }
        // The two newest survive
        assert_eq!(sub.next().await.unwrap().as_deref(), Some("3"));
        assert_eq!(sub.next().await.unwrap().as_deref(), Some("4"));
    }

    #[tokio::test]
    async fn test_dropped_local_bus_ends_cleanly() {
        let bus = LocalBus::new(2);
        let mut sub = bus.subscribe();
        drop(bus);
        assert!(matches!(sub.next().await, Ok(None)));
    }

    #[tokio::test]
    async fn test_redis_subscription_receives_pushed_messages() {
        let url = FakeRedis::new()
            .after_subscribe(AfterSubscribe::Push(vec![r#"{"metricId":"u1"}"#.to_string()]))
            .spawn()
            .await;

        let mut sub = Subscription::redis(&url, "live-updates", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(sub.next().await.unwrap().as_deref(), Some(r#"{"metricId":"u1"}"#));
    }

    #[tokio::test]
    async fn test_server_closing_subscription_is_an_error() {
        let url = FakeRedis::new()
            .after_subscribe(AfterSubscribe::PushThenDrop(vec!["one".to_string()]))
            .spawn()
            .await;

        let mut sub = Subscription::redis(&url, "live-updates", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(sub.next().await.unwrap().as_deref(), Some("one"));
        assert!(matches!(
            sub.next().await,
            Err(PubSubError::Disconnected { ref channel }) if channel == "live-updates"
        ));
    }

    #[tokio::test]
    async fn test_redis_publisher_reports_receivers() {
        let url = FakeRedis::new().spawn().await;
        let publisher = RedisPublisher::new(url, "live-updates", Duration::from_secs(1));
        assert_eq!(publisher.publish(r#"{"n":1}"#).await.unwrap(), 1);
    }
}
