//! Subscriber key → live connection index
//!
//! One entry per key, last registration wins. Removal compares identity, so
//! the teardown of a superseded connection can never evict its replacement.

use super::connection::Connection;
use super::dispatch::Dispatcher;
use crate::observability::SharedMetrics;
use ahash::AHashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info};

/// What happened to a targeted send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Queued for the connection's writer
    Dispatched,
    /// No open connection for the key; message dropped
    NoRecipient,
    /// Dispatcher refused the delivery (backpressure or shutdown)
    Rejected,
}

pub struct ConnectionRegistry {
    connections: RwLock<AHashMap<String, Arc<Connection>>>,
    dispatcher: Arc<Dispatcher>,
    metrics: SharedMetrics,
}

impl ConnectionRegistry {
    pub fn new(dispatcher: Arc<Dispatcher>, metrics: SharedMetrics) -> Self {
        ConnectionRegistry {
            connections: RwLock::new(AHashMap::new()),
            dispatcher,
            metrics,
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Insert or replace the entry for `key`.
    ///
    /// Returns the superseded connection. It is left untouched; closing it is
    /// up to the caller.
    pub fn register(&self, key: &str, connection: Arc<Connection>) -> Option<Arc<Connection>> {
        let connection_id = connection.id().to_string();
        let (previous, active) = {
            let mut connections = self.connections.write();
            let previous = connections.insert(key.to_string(), connection);
            (previous, connections.len())
        };

        self.metrics.set_connections(active);
        match &previous {
            Some(old) => {
                self.metrics.record_connection("superseded");
                info!(key, connection_id = %connection_id, superseded = %old.id(), "connection replaced");
            }
            None => {
                self.metrics.record_connection("established");
                info!(key, connection_id = %connection_id, "connection registered");
            }
        }
        previous
    }

    /// Remove the entry for `key` only while it still holds `connection`.
    pub fn unregister(&self, key: &str, connection: &Arc<Connection>) -> bool {
        let (removed, active) = {
            let mut connections = self.connections.write();
            let removed = match connections.get(key) {
                Some(current) if Arc::ptr_eq(current, connection) => {
                    connections.remove(key);
                    true
                }
                _ => false,
            };
            (removed, connections.len())
        };

        if removed {
            self.metrics.set_connections(active);
            self.metrics.record_connection("closed");
            info!(key, connection_id = %connection.id(), "connection unregistered");
        } else {
            debug!(key, connection_id = %connection.id(), "unregister ignored, entry belongs to another connection");
        }
        removed
    }

    pub fn get(&self, key: &str) -> Option<Arc<Connection>> {
        self.connections.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// At-most-once push to one subscriber. Never waits for the write.
    pub fn send_to_user(&self, key: &str, message: &str) -> SendOutcome {
        let target = self.get(key).filter(|c| c.is_open());
        let Some(connection) = target else {
            debug!(key, "no open connection, dropping message");
            self.metrics.record_delivery("no_recipient");
            return SendOutcome::NoRecipient;
        };

        match self.dispatcher.submit(connection, Arc::from(message)) {
            Ok(()) => SendOutcome::Dispatched,
            Err(e) => {
                debug!(key, error = %e, "delivery not dispatched");
                SendOutcome::Rejected
            }
        }
    }

    /// Queue `message` for every open connection independently.
    ///
    /// Returns how many deliveries were dispatched.
    pub fn broadcast(&self, message: &str) -> usize {
        let targets: Vec<Arc<Connection>> = self
            .connections
            .read()
            .values()
            .filter(|c| c.is_open())
            .cloned()
            .collect();

        let message: Arc<str> = Arc::from(message);
        let mut dispatched = 0;
        for connection in targets {
            match self.dispatcher.submit(connection, message.clone()) {
                Ok(()) => dispatched += 1,
                Err(e) => debug!(error = %e, "broadcast delivery not dispatched"),
            }
        }
        dispatched
    }
}
