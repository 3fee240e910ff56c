//! Per-delivery processing: parse, batch, invoke the handler, settle.
//!
//! Settlement rules:
//! - handler success: ack every constituent delivery
//! - handler failure, first delivery: reject with requeue (one free retry
//!   through broker redelivery)
//! - handler failure on a redelivery: hand the event to the processing retry
//!   queue, then reject without requeue (dead-lettered when configured)
//! - unparseable payload: requeue once, reject without requeue on redelivery

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use chatrelay_core::InboundEvent;
use chatrelay_events::{DeliveryStatus, EventPublisher, MessageHandler, OutboundEvent, Progress};

use crate::retry::ProcessingRetryQueue;

use super::batching::{BatchAssembler, ReadyBatch};
use super::delivery::InboundDelivery;

pub struct Dispatcher {
    handler: Arc<dyn MessageHandler>,
    publisher: Arc<dyn EventPublisher>,
    retry: Arc<ProcessingRetryQueue>,
    batcher: Option<Arc<BatchAssembler>>,
    progress: Progress,
    tasks: TaskTracker,
}

impl Dispatcher {
    pub fn new(
        handler: Arc<dyn MessageHandler>,
        publisher: Arc<dyn EventPublisher>,
        retry: Arc<ProcessingRetryQueue>,
        tasks: TaskTracker,
    ) -> Self {
        Self {
            handler,
            publisher,
            retry,
            batcher: None,
            progress: Progress::none(),
            tasks,
        }
    }

    /// Route deliveries through `batcher`; flushed batches arrive on the
    /// receiver returned by [`BatchAssembler::new`] and must be fed to
    /// [`spawn_batch_pump`](Self::spawn_batch_pump).
    pub fn with_batching(mut self, batcher: Arc<BatchAssembler>) -> Self {
        self.batcher = Some(batcher);
        self
    }

    /// Forward handler stage updates to `progress`.
    pub fn with_progress(mut self, progress: Progress) -> Self {
        self.progress = progress;
        self
    }

    pub fn batcher(&self) -> Option<&Arc<BatchAssembler>> {
        self.batcher.as_ref()
    }

    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    /// Entry point for every broker delivery.
    #[instrument(skip(self, delivery), fields(delivery_tag = delivery.delivery_tag, redelivered = delivery.redelivered))]
    pub async fn on_delivery(&self, delivery: InboundDelivery) {
        let event = match InboundEvent::from_slice(&delivery.body) {
            Ok(event) => event,
            Err(err) => {
                let requeue = !delivery.redelivered;
                warn!(error = %err, requeue, "malformed inbound payload");
                settle(&delivery, Settle::Reject { requeue }).await;
                return;
            }
        };

        debug!(message_id = %event.id, user_id = %event.user_id, "delivery received");
        let single = match &self.batcher {
            Some(batcher) => match batcher.add(event, delivery) {
                Ok(()) => return,
                // batching stopped for shutdown
                Err(single) => single,
            },
            None => ReadyBatch::single(event, delivery),
        };
        self.process(single).await;
    }

    /// Run the handler for one (possibly combined) event and settle its deliveries.
    #[instrument(skip(self, batch), fields(message_id = %batch.event.id, user_id = %batch.event.user_id, size = batch.deliveries.len()))]
    pub async fn process(&self, batch: ReadyBatch) {
        let redelivered = batch.redelivered();
        let ReadyBatch { event, deliveries } = batch;
        let ids = event.message_ids();

        self.publish_status(&event, DeliveryStatus::Processing, None).await;

        match self.handler.process(event.clone(), self.progress.clone()).await {
            Ok(()) => {
                self.publish_status(&event, DeliveryStatus::Completed, None).await;
                for delivery in &deliveries {
                    settle(delivery, Settle::Ack).await;
                }
                debug!(messages = ids.len(), "event processed");
            }
            Err(err) => {
                let message = err.to_string();
                self.publish_status(&event, DeliveryStatus::Failed, Some(message.clone())).await;

                if redelivered {
                    error!(error = %message, "handler failed on redelivery, moving to processing retry");
                    self.retry.enqueue(event, message).await;
                    for delivery in &deliveries {
                        settle(delivery, Settle::Reject { requeue: false }).await;
                    }
                } else {
                    warn!(error = %message, "handler failed, requeueing for redelivery");
                    for delivery in &deliveries {
                        settle(delivery, Settle::Reject { requeue: true }).await;
                    }
                }
            }
        }
    }

    async fn publish_status(&self, event: &InboundEvent, status: DeliveryStatus, error_message: Option<String>) {
        let out = OutboundEvent::status(
            event.tenant_id.clone(),
            event.user_id.clone(),
            event.message_ids(),
            status,
            error_message,
        );
        if let Err(err) = self.publisher.publish(&out).await {
            warn!(message_id = %event.id, error = %err, "status event not published");
        }
    }

    /// Drain flushed batches, processing each on its own tracked task.
    pub fn spawn_batch_pump(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<ReadyBatch>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(batch) = rx.recv().await {
                let this = Arc::clone(&self);
                self.tasks.spawn(async move { this.process(batch).await });
            }
            info!("batch pump stopped");
        })
    }
}

enum Settle {
    Ack,
    Reject { requeue: bool },
}

async fn settle(delivery: &InboundDelivery, action: Settle) {
    let result = match action {
        Settle::Ack => delivery.ack().await,
        Settle::Reject { requeue } => delivery.reject(requeue).await,
    };
    if let Err(err) = result {
        // the channel is gone; the broker redelivers unsettled messages
        warn!(delivery_tag = delivery.delivery_tag, error = %err, "failed to settle delivery");
    }
}
