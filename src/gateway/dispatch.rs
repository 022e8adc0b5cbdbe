//! Bounded delivery pool
//!
//! Deliveries are queued on a fixed-size lock-free ring and written by a
//! fixed number of worker tasks. When the ring is full the configured
//! `BackpressurePolicy` decides which delivery is lost: the one being
//! submitted (`RejectNew`) or the oldest one waiting (`DropOldest`).

use super::connection::{Connection, DeliveryError};
use crate::config::{BackpressurePolicy, GatewayConfig};
use crate::observability::spans::delivery_span;
use crate::observability::SharedMetrics;
use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn, Instrument};

/// Error type for dispatch operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Queue full under `RejectNew`
    QueueFull,
    /// Dispatcher is draining and takes no new work
    ShuttingDown,
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::QueueFull => write!(f, "dispatch queue is full"),
            DispatchError::ShuttingDown => write!(f, "dispatcher is shutting down"),
        }
    }
}

impl std::error::Error for DispatchError {}

struct Delivery {
    connection: Arc<Connection>,
    message: Arc<str>,
}

struct Shared {
    queue: ArrayQueue<Delivery>,
    work: Notify,
    idle: Notify,
    /// Queued plus in flight
    pending: AtomicUsize,
    closing: AtomicBool,
    /// Set once every worker has exited
    stopped: AtomicBool,
    policy: BackpressurePolicy,
    send_timeout: Duration,
    metrics: SharedMetrics,
}

impl Shared {
    fn finish_one(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Drop whatever is still queued after the workers are gone
    fn drain_abandoned(&self) -> usize {
        let mut dropped = 0;
        while let Some(delivery) = self.queue.pop() {
            debug!(key = %delivery.connection.key(), "dispatcher stopped, dropping delivery");
            self.metrics.record_delivery("abandoned");
            self.finish_one();
            dropped += 1;
        }
        dropped
    }
}

pub struct Dispatcher {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Spawn the worker pool. Must be called inside a tokio runtime.
    pub fn start(config: &GatewayConfig, metrics: SharedMetrics) -> Self {
        let shared = Arc::new(Shared {
            queue: ArrayQueue::new(config.dispatch_queue_capacity.max(1)),
            work: Notify::new(),
            idle: Notify::new(),
            pending: AtomicUsize::new(0),
            closing: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            policy: config.backpressure,
            send_timeout: config.send_timeout(),
            metrics,
        });

        let workers = (0..config.dispatch_workers.max(1))
            .map(|worker_id| tokio::spawn(worker_loop(worker_id, shared.clone())))
            .collect();

        debug!(
            workers = config.dispatch_workers,
            capacity = config.dispatch_queue_capacity,
            policy = config.backpressure.as_str(),
            "dispatcher started"
        );
        Dispatcher {
            shared,
            workers: Mutex::new(workers),
        }
    }

    pub fn policy(&self) -> BackpressurePolicy {
        self.shared.policy
    }

    /// Deliveries queued or in flight
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    /// Queue one message for one connection without waiting for the write.
    pub fn submit(&self, connection: Arc<Connection>, message: Arc<str>) -> Result<(), DispatchError> {
        if self.shared.closing.load(Ordering::Acquire) {
            return Err(DispatchError::ShuttingDown);
        }
        self.enqueue(Delivery {
            connection,
            message,
        })
    }

    fn enqueue(&self, delivery: Delivery) -> Result<(), DispatchError> {
        let shared = &self.shared;
        shared.pending.fetch_add(1, Ordering::AcqRel);
        match shared.policy {
            BackpressurePolicy::RejectNew => {
                if let Err(rejected) = shared.queue.push(delivery) {
                    shared.finish_one();
                    shared.metrics.record_dispatch_dropped(shared.policy.as_str());
                    debug!(key = %rejected.connection.key(), "dispatch queue full, rejecting delivery");
                    return Err(DispatchError::QueueFull);
                }
            }
            BackpressurePolicy::DropOldest => {
                if let Some(displaced) = shared.queue.force_push(delivery) {
                    shared.finish_one();
                    shared.metrics.record_dispatch_dropped(shared.policy.as_str());
                    debug!(key = %displaced.connection.key(), "dispatch queue full, dropped oldest delivery");
                }
            }
        }
        // Lost the race with shutdown: no worker will ever pop this
        if shared.stopped.load(Ordering::SeqCst) {
            shared.drain_abandoned();
            return Err(DispatchError::ShuttingDown);
        }
        shared.work.notify_one();
        Ok(())
    }

    /// Resolve once nothing is queued or in flight
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.shared.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Stop taking work, let the workers drain the queue, then join them.
    pub async fn shutdown(&self) {
        self.shared.closing.store(true, Ordering::Release);
        self.shared.work.notify_waiters();

        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "dispatch worker panicked");
            }
        }
        self.shared.stopped.store(true, Ordering::SeqCst);
        let abandoned = self.shared.drain_abandoned();
        debug!(abandoned, "dispatcher stopped");
    }
}

async fn worker_loop(worker_id: usize, shared: Arc<Shared>) {
    loop {
        let work = shared.work.notified();
        tokio::pin!(work);
        work.as_mut().enable();

        if let Some(delivery) = shared.queue.pop() {
            deliver(&shared, delivery).await;
            shared.finish_one();
            continue;
        }
        if shared.closing.load(Ordering::Acquire) {
            debug!(worker_id, "dispatch worker exiting");
            return;
        }
        work.await;
    }
}

async fn deliver(shared: &Shared, delivery: Delivery) {
    let Delivery {
        connection,
        message,
    } = delivery;
    let span = delivery_span(connection.key());

    async {
        let result = match timeout(shared.send_timeout, connection.send(&message)).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout),
        };
        let outcome = match result {
            Ok(()) => "delivered",
            Err(DeliveryError::Closed) => {
                debug!(connection_id = %connection.id(), "connection closed before delivery, dropping");
                "closed"
            }
            Err(DeliveryError::Timeout) => {
                warn!(connection_id = %connection.id(), "delivery timed out, dropping message");
                "timeout"
            }
            Err(e) => {
                warn!(connection_id = %connection.id(), error = %e, "delivery failed, dropping message");
                "failed"
            }
        };
        shared.metrics.record_delivery(outcome);
    }
    .instrument(span)
    .await
}
