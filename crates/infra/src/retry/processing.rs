//! Inbound processing retry queue.
//!
//! Events whose handler failed are parked here and re-run on a long interval.
//! `attempts` counts handler failures, the original one included; once it
//! reaches `max_attempts` the item is promoted into the [`FailedMessageStore`]
//! and an error event flagged `canRetry` is published for the user.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use chatrelay_core::{InboundEvent, MessageId};
use chatrelay_events::{
    DeliveryStatus, ErrorEvent, EventPublisher, MessageHandler, OutboundEvent, Progress,
};

use crate::config::ProcessingRetryConfig;
use crate::retry::RetryQueueStatus;
use crate::retry::failed_store::{AdminError, FailedMessage, FailedMessageStore, FailedStatus};

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingRetryItem {
    pub event: InboundEvent,
    pub attempts: u32,
    pub first_attempt: DateTime<Utc>,
    pub last_attempt: DateTime<Utc>,
    pub last_error: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub requeued: usize,
    pub promoted: usize,
}

/// Outcome of an admin-triggered retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryOutcome {
    pub message_id: MessageId,
    pub succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryAllReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

pub struct ProcessingRetryQueue {
    handler: Arc<dyn MessageHandler>,
    publisher: Arc<dyn EventPublisher>,
    store: Arc<FailedMessageStore>,
    config: ProcessingRetryConfig,
    items: Mutex<VecDeque<ProcessingRetryItem>>,
    succeeded_total: AtomicU64,
    promoted_total: AtomicU64,
    evicted_total: AtomicU64,
}

impl std::fmt::Debug for ProcessingRetryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessingRetryQueue")
            .field("config", &self.config)
            .field("depth", &self.len())
            .finish_non_exhaustive()
    }
}

impl ProcessingRetryQueue {
    pub fn new(
        handler: Arc<dyn MessageHandler>,
        publisher: Arc<dyn EventPublisher>,
        config: ProcessingRetryConfig,
    ) -> Self {
        let store = Arc::new(FailedMessageStore::new(config.failed_store_size));
        Self {
            handler,
            publisher,
            store,
            config,
            items: Mutex::new(VecDeque::new()),
            succeeded_total: AtomicU64::new(0),
            promoted_total: AtomicU64::new(0),
            evicted_total: AtomicU64::new(0),
        }
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<ProcessingRetryItem>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn store(&self) -> &Arc<FailedMessageStore> {
        &self.store
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    pub fn get(&self, id: &MessageId) -> Option<ProcessingRetryItem> {
        self.items().iter().find(|i| &i.event.id == id).cloned()
    }

    /// Record a handler failure for `event`.
    pub async fn enqueue(&self, event: InboundEvent, error: impl Into<String>) {
        self.enqueue_at(event, error.into(), Utc::now()).await;
    }

    pub async fn enqueue_at(&self, event: InboundEvent, error: String, now: DateTime<Utc>) {
        let to_promote = {
            let mut items = self.items();
            if let Some(pos) = items.iter().position(|i| i.event.id == event.id) {
                let item = &mut items[pos];
                item.attempts += 1;
                item.last_attempt = now;
                item.last_error = error;
                if item.attempts >= self.config.max_attempts {
                    items.remove(pos).into_iter().collect()
                } else {
                    Vec::new()
                }
            } else {
                let item = ProcessingRetryItem {
                    event,
                    attempts: 1,
                    first_attempt: now,
                    last_attempt: now,
                    last_error: error,
                };
                if item.attempts >= self.config.max_attempts {
                    vec![item]
                } else {
                    warn!(
                        message_id = %item.event.id,
                        user_id = %item.event.user_id,
                        error = %item.last_error,
                        "handler failure queued for processing retry"
                    );
                    self.push_locked(&mut items, item)
                }
            }
        };

        for item in to_promote {
            self.promote(item, now).await;
        }
    }

    /// Append `item`, returning whatever had to be evicted to stay within
    /// capacity. Evicted items must be promoted by the caller once the lock is
    /// released; their deliveries are already settled.
    #[must_use]
    fn push_locked(
        &self,
        items: &mut VecDeque<ProcessingRetryItem>,
        item: ProcessingRetryItem,
    ) -> Vec<ProcessingRetryItem> {
        items.push_back(item);
        let mut evicted = Vec::new();
        while items.len() > self.config.max_queue_size {
            let Some(oldest) = items.pop_front() else {
                break;
            };
            self.evicted_total.fetch_add(1, Ordering::Relaxed);
            warn!(
                message_id = %oldest.event.id,
                capacity = self.config.max_queue_size,
                "processing retry queue full, moving oldest item to the failed store"
            );
            evicted.push(oldest);
        }
        evicted
    }

    async fn promote(&self, item: ProcessingRetryItem, now: DateTime<Utc>) {
        let event = item.event.clone();
        let error_message = item.last_error.clone();
        self.store.insert(FailedMessage::from_retry_item(item, now));
        self.promoted_total.fetch_add(1, Ordering::Relaxed);

        let ids = event.message_ids();
        let notice = OutboundEvent::Error(ErrorEvent {
            tenant_id: event.tenant_id.clone(),
            user_id: event.user_id.clone(),
            error_message: error_message.clone(),
            pending_message_id: Some(event.id.clone()),
            batched_message_ids: event.is_batched().then(|| ids.clone()),
            can_retry: Some(true),
        });
        let status = OutboundEvent::status(
            event.tenant_id.clone(),
            event.user_id.clone(),
            ids,
            DeliveryStatus::Failed,
            Some(error_message),
        );
        for out in [notice, status] {
            if let Err(err) = self.publisher.publish(&out).await {
                warn!(message_id = %event.id, kind = %out.kind(), error = %err, "failed to publish failure notice");
            }
        }
    }

    /// Re-run up to `items_per_cycle` items whose last attempt is at least one
    /// interval old.
    #[instrument(skip(self))]
    pub async fn process_due_at(&self, now: DateTime<Utc>) -> SweepReport {
        let interval = chrono::Duration::from_std(self.config.interval)
            .unwrap_or_else(|_| chrono::Duration::weeks(52));

        let due: Vec<ProcessingRetryItem> = {
            let mut items = self.items();
            let mut due = Vec::new();
            let mut rest = VecDeque::with_capacity(items.len());
            for item in items.drain(..) {
                if due.len() < self.config.items_per_cycle && now - item.last_attempt >= interval {
                    due.push(item);
                } else {
                    rest.push_back(item);
                }
            }
            *items = rest;
            due
        };

        let mut report = SweepReport {
            attempted: due.len(),
            ..SweepReport::default()
        };

        for mut item in due {
            debug!(message_id = %item.event.id, attempt = item.attempts + 1, "retrying handler");
            match self.handler.process(item.event.clone(), Progress::none()).await {
                Ok(()) => {
                    report.succeeded += 1;
                    self.succeeded_total.fetch_add(1, Ordering::Relaxed);
                    info!(message_id = %item.event.id, attempts = item.attempts, "processing retry succeeded");
                }
                Err(err) => {
                    item.attempts += 1;
                    item.last_attempt = now;
                    item.last_error = err.to_string();
                    if item.attempts >= self.config.max_attempts {
                        report.promoted += 1;
                        self.promote(item, now).await;
                    } else {
                        report.requeued += 1;
                        warn!(
                            message_id = %item.event.id,
                            attempts = item.attempts,
                            error = %item.last_error,
                            "processing retry failed, will try again"
                        );
                        let evicted = {
                            let mut items = self.items();
                            self.push_locked(&mut items, item)
                        };
                        for oldest in evicted {
                            report.promoted += 1;
                            self.promote(oldest, now).await;
                        }
                    }
                }
            }
        }
        report
    }

    pub async fn process_due(&self) -> SweepReport {
        self.process_due_at(Utc::now()).await
    }

    /// Admin retry of one failed message.
    pub async fn retry_failed(&self, id: &MessageId) -> Result<RetryOutcome, AdminError> {
        let event = self.store.begin_retry(id)?;
        let outcome = self
            .handler
            .process(event, Progress::none())
            .await
            .map_err(|e| e.to_string());
        let error = outcome.as_ref().err().cloned();
        self.store.finish_retry(id, outcome);

        Ok(RetryOutcome {
            message_id: id.clone(),
            succeeded: error.is_none(),
            error,
        })
    }

    /// Admin retry of every message currently in `failed` state, sequentially.
    pub async fn retry_all_failed(&self) -> RetryAllReport {
        let mut report = RetryAllReport::default();
        for id in self.store.ids_with_status(FailedStatus::Failed) {
            match self.retry_failed(&id).await {
                Ok(outcome) => {
                    report.attempted += 1;
                    if outcome.succeeded {
                        report.succeeded += 1;
                    } else {
                        report.failed += 1;
                    }
                }
                // cleared or picked up by a concurrent retry meanwhile
                Err(err) => debug!(message_id = %id, error = %err, "skipping failed message"),
            }
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
            dropped_total: self.promoted_total.load(Ordering::Relaxed),
            evicted_total: self.evicted_total.load(Ordering::Relaxed),
        }
    }

    /// Spawn the long-interval sweep loop.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.config.interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tick.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        if !self.is_empty() {
                            let report = self.process_due().await;
                            if report.attempted > 0 {
                                info!(
                                    attempted = report.attempted,
                                    succeeded = report.succeeded,
                                    requeued = report.requeued,
                                    promoted = report.promoted,
                                    "processing retry sweep finished"
                                );
                            }
                        }
                    }
                }
            }
        })
    }
}
