//! Outbound publish retry queue.
//!
//! Publishes that fail while the broker is unreachable are buffered here and
//! replayed every `interval`, at most `items_per_cycle` per cycle. Each replay
//! goes straight to the underlying publisher (never back through the queue).
//!
//! The queue is **lossy by design**: it is bounded (oldest item evicted when
//! full) and an item is dropped once it has failed `max_attempts` replays. The
//! inbound message it answers was already acknowledged, so there is nothing to
//! hand the failure back to.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chatrelay_events::{EventKind, EventPublisher, OutboundEvent, PublishError};

use crate::config::PublishRetryConfig;
use crate::retry::RetryQueueStatus;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryItem<T> {
    pub payload: T,
    pub kind: EventKind,
    /// Failed replays so far (the original failure is not counted).
    pub attempts: u32,
    pub first_attempt: DateTime<Utc>,
    pub last_attempt: DateTime<Utc>,
}

impl RetryItem<OutboundEvent> {
    fn new(event: OutboundEvent) -> Self {
        let now = Utc::now();
        Self {
            kind: event.kind(),
            payload: event,
            attempts: 0,
            first_attempt: now,
            last_attempt: now,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub requeued: usize,
    pub dropped: usize,
}

pub struct PublishRetryQueue {
    publisher: Arc<dyn EventPublisher>,
    config: PublishRetryConfig,
    items: Mutex<VecDeque<RetryItem<OutboundEvent>>>,
    succeeded_total: AtomicU64,
    dropped_total: AtomicU64,
    evicted_total: AtomicU64,
}

impl std::fmt::Debug for PublishRetryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishRetryQueue")
            .field("config", &self.config)
            .field("depth", &self.len())
            .finish_non_exhaustive()
    }
}

impl PublishRetryQueue {
    pub fn new(publisher: Arc<dyn EventPublisher>, config: PublishRetryConfig) -> Self {
        Self {
            publisher,
            config,
            items: Mutex::new(VecDeque::new()),
            succeeded_total: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
            evicted_total: AtomicU64::new(0),
        }
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<RetryItem<OutboundEvent>>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Buffer a failed publish for replay.
    pub fn enqueue(&self, event: OutboundEvent) {
        let kind = event.kind();
        self.push(RetryItem::new(event));
        debug!(kind = %kind, "publish buffered for retry");
    }

    fn push(&self, item: RetryItem<OutboundEvent>) {
        let mut items = self.items();
        items.push_back(item);
        while items.len() > self.config.max_queue_size {
            if let Some(evicted) = items.pop_front() {
                self.evicted_total.fetch_add(1, Ordering::Relaxed);
                warn!(
                    kind = %evicted.kind,
                    user_id = %evicted.payload.user_id(),
                    capacity = self.config.max_queue_size,
                    "publish retry queue full, evicted oldest item"
                );
            }
        }
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    /// Replay up to `items_per_cycle` buffered publishes once.
    pub async fn drain_once(&self) -> DrainReport {
        let batch: Vec<RetryItem<OutboundEvent>> = {
            let mut items = self.items();
            let n = items.len().min(self.config.items_per_cycle);
            items.drain(..n).collect()
        };

        let mut report = DrainReport {
            attempted: batch.len(),
            ..DrainReport::default()
        };

        for mut item in batch {
            match self.publisher.publish(&item.payload).await {
                Ok(()) => {
                    report.succeeded += 1;
                    self.succeeded_total.fetch_add(1, Ordering::Relaxed);
                    debug!(kind = %item.kind, attempts = item.attempts, "buffered publish delivered");
                }
                Err(err) => {
                    item.attempts += 1;
                    item.last_attempt = Utc::now();

                    if err.is_transient() && item.attempts < self.config.max_attempts {
                        report.requeued += 1;
                        self.push(item);
                    } else {
                        report.dropped += 1;
                        self.dropped_total.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            kind = %item.kind,
                            user_id = %item.payload.user_id(),
                            attempts = item.attempts,
                            error = %err,
                            "dropping outbound event after failed retries; it will not be delivered"
                        );
                    }
                }
            }
        }

        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                succeeded = report.succeeded,
                requeued = report.requeued,
                dropped = report.dropped,
                "publish retry cycle finished"
            );
        }
        report
    }

    pub fn status(&self) -> RetryQueueStatus {
        let items = self.items();
        RetryQueueStatus {
            depth: items.len(),
            capacity: self.config.max_queue_size,
            oldest_first_attempt: items.iter().map(|i| i.first_attempt).min(),
            succeeded_total: self.succeeded_total.load(Ordering::Relaxed),
            dropped_total: self.dropped_total.load(Ordering::Relaxed),
            evicted_total: self.evicted_total.load(Ordering::Relaxed),
        }
    }

    /// Spawn the fixed-interval drain loop.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.config.interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        if !self.is_empty() {
                            self.drain_once().await;
                        }
                    }
                }
            }

            let remaining = self.len();
            if remaining > 0 {
                warn!(remaining, "publish retry loop stopped with undelivered events");
            }
        })
    }
}

/// Publisher that buffers transient failures in a [`PublishRetryQueue`].
///
/// A transient failure is reported as success to the caller: the event has been
/// accepted for later delivery. Permanent failures (serialization) are returned.
#[derive(Debug, Clone)]
pub struct ReliablePublisher {
    queue: Arc<PublishRetryQueue>,
}

impl ReliablePublisher {
    pub fn new(queue: Arc<PublishRetryQueue>) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &Arc<PublishRetryQueue> {
        &self.queue
    }
}

#[async_trait]
impl EventPublisher for ReliablePublisher {
    async fn publish(&self, event: &OutboundEvent) -> Result<(), PublishError> {
        match self.queue.publisher.publish(event).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_transient() => {
                warn!(kind = %event.kind(), error = %err, "publish failed, buffering for retry");
                self.queue.enqueue(event.clone());
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}
