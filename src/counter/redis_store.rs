use super::{CounterStore, StoreError};
use redis::aio::ConnectionManager;
use redis::Client;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Counter store backed by a Redis server (`INCR`).
///
/// The `ConnectionManager` is created on first use and reconnects on its own
/// after a broken connection. A failed increment is returned to the caller,
/// never retried here.
pub struct RedisCounterStore {
    url: String,
    connect_timeout: Duration,
    manager: Mutex<Option<ConnectionManager>>,
}

impl RedisCounterStore {
    /// `url` is a `redis://` URL
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        RedisCounterStore {
            url: url.into(),
            connect_timeout,
            manager: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let mut guard = self.manager.lock().await;
        if let Some(manager) = guard.as_ref() {
            return Ok(manager.clone());
        }

        debug!(url = %self.url, "connecting to counter store");
        let client = Client::open(self.url.as_str())?;
        let manager = timeout(self.connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Unavailable(format!("connect to {} timed out", self.url)))??;
        *guard = Some(manager.clone());
        Ok(manager)
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.connection().await?;
        redis::cmd("INCR")
            .arg(key)
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(|e| {
                warn!(url = %self.url, key, error = %e, "counter increment failed");
                StoreError::from(e)
            })
    }
}

impl CounterStore for RedisCounterStore {
    fn increment<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<i64, StoreError>> + Send + 'a>> {
        Box::pin(self.incr(key))
    }
}
