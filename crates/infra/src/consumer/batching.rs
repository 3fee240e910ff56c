//! Time-windowed batching of rapid messages from one user.
//!
//! A pending batch is keyed by conversation and flushes when the first of these
//! happens:
//! - it holds `max_batch_size` messages
//! - it is older than `max_wait`
//! - no message arrived for `window` (the idle timer)
//!
//! Deliveries of every constituent travel with the flushed batch and are
//! settled together by whoever consumes it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use chatrelay_core::{ConversationKey, Conversational, InboundEvent};

use crate::config::BatchingConfig;

use super::delivery::InboundDelivery;

/// A flushed batch: one (possibly combined) event plus every constituent delivery.
#[derive(Debug)]
pub struct ReadyBatch {
    pub event: InboundEvent,
    pub deliveries: Vec<InboundDelivery>,
}

impl ReadyBatch {
    pub fn single(event: InboundEvent, delivery: InboundDelivery) -> Self {
        Self {
            event,
            deliveries: vec![delivery],
        }
    }

    /// Whether the broker redelivered any constituent.
    pub fn redelivered(&self) -> bool {
        self.deliveries.iter().any(|d| d.redelivered)
    }
}

struct PendingBatch {
    events: Vec<InboundEvent>,
    deliveries: Vec<InboundDelivery>,
    first_at: Instant,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl PendingBatch {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

pub struct BatchAssembler {
    config: BatchingConfig,
    pending: Mutex<HashMap<ConversationKey, PendingBatch>>,
    generation: AtomicU64,
    /// `None` once closed; the receiver then drains and ends.
    tx: Mutex<Option<mpsc::UnboundedSender<ReadyBatch>>>,
}

impl BatchAssembler {
    /// Returns the assembler and the receiving end its flushes go to.
    pub fn new(config: BatchingConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<ReadyBatch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let assembler = Arc::new(Self {
            config,
            pending: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            tx: Mutex::new(Some(tx)),
        });
        (assembler, rx)
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<ConversationKey, PendingBatch>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of conversations with an open batch.
    pub fn open_batches(&self) -> usize {
        self.pending().len()
    }

    fn sender(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<ReadyBatch>>> {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_closed(&self) -> bool {
        self.sender().is_none()
    }

    /// Queue `event` into its conversation's batch. After [`close`](Self::close)
    /// nothing is batched any more and the event comes back as a single batch
    /// for the caller to process.
    pub fn add(self: &Arc<Self>, event: InboundEvent, delivery: InboundDelivery) -> Result<(), ReadyBatch> {
        let key = event.conversation_key();
        let now = Instant::now();
        let mut pending = self.pending();
        if self.is_closed() {
            return Err(ReadyBatch::single(event, delivery));
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let batch = pending.entry(key.clone()).or_insert_with(|| PendingBatch {
            events: Vec::new(),
            deliveries: Vec::new(),
            first_at: now,
            generation,
            timer: None,
        });
        batch.cancel_timer();
        batch.generation = generation;
        batch.events.push(event);
        batch.deliveries.push(delivery);

        let age = now.duration_since(batch.first_at);
        if batch.events.len() >= self.config.max_batch_size || age >= self.config.max_wait {
            if let Some(batch) = pending.remove(&key) {
                self.emit(&key, batch, "limit");
            }
            return Ok(());
        }

        let delay = self.config.window.min(self.config.max_wait - age);
        let this = Arc::clone(self);
        let timer_key = key.clone();
        batch.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.flush_if_current(&timer_key, generation);
        }));
        debug!(conversation = %key, size = batch.events.len(), delay_ms = delay.as_millis() as u64, "message batched");
        Ok(())
    }

    /// Timer path: flush only if no message arrived since the timer was armed.
    fn flush_if_current(&self, key: &ConversationKey, generation: u64) {
        let mut pending = self.pending();
        let current = pending.get(key).map(|b| b.generation);
        if current != Some(generation) {
            return;
        }
        if let Some(mut batch) = pending.remove(key) {
            // the running timer is this task; drop the handle without aborting
            batch.timer.take();
            self.emit(key, batch, "window");
        }
    }

    /// Flush one conversation immediately. No-op if it has no open batch.
    pub fn flush(&self, key: &ConversationKey) -> bool {
        let mut pending = self.pending();
        match pending.remove(key) {
            Some(mut batch) => {
                batch.cancel_timer();
                self.emit(key, batch, "manual");
                true
            }
            None => false,
        }
    }

    /// Flush every open batch.
    pub fn flush_all(&self) -> usize {
        let mut pending = self.pending();
        let n = pending.len();
        for (key, mut batch) in pending.drain() {
            batch.cancel_timer();
            self.emit(&key, batch, "flush_all");
        }
        n
    }

    /// Flush every open batch and stop batching (shutdown). The receiver sees
    /// the flushed batches followed by end of stream.
    pub fn close(&self) -> usize {
        let mut pending = self.pending();
        let n = pending.len();
        for (key, mut batch) in pending.drain() {
            batch.cancel_timer();
            self.emit(&key, batch, "shutdown");
        }
        self.sender().take();
        n
    }

    /// Callers hold the `pending` lock, so emits and [`close`](Self::close)
    /// never interleave.
    fn emit(&self, key: &ConversationKey, batch: PendingBatch, trigger: &'static str) {
        let size = batch.events.len();
        let Some(event) = combine(batch.events) else {
            return;
        };
        info!(conversation = %key, message_id = %event.id, size, trigger, "batch flushed");
        let ready = ReadyBatch {
            event,
            deliveries: batch.deliveries,
        };
        let sent = match self.sender().as_ref() {
            Some(tx) => tx.send(ready).is_ok(),
            None => false,
        };
        if !sent {
            warn!(conversation = %key, size, "batch receiver gone, deliveries left unsettled");
        }
    }
}

/// Merge constituents (arrival order) into one event.
///
/// A single event passes through unchanged. Otherwise the texts are joined
/// (`"a and b"` for two, a numbered list for more), identity and timestamp come
/// from the newest constituent and media is backfilled from the newest
/// constituent that carried any.
pub fn combine(mut events: Vec<InboundEvent>) -> Option<InboundEvent> {
    if events.len() <= 1 {
        return events.pop();
    }

    let text = if events.len() == 2 {
        format!("{} and {}", events[0].text, events[1].text)
    } else {
        events
            .iter()
            .enumerate()
            .map(|(i, e)| format!("{}. {}", i + 1, e.text))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let ids = events.iter().flat_map(|e| e.message_ids()).collect();
    let media = events.iter().rev().find_map(|e| e.media.clone());

    let mut combined = events.pop()?;
    combined.text = text;
    combined.media = media;
    combined.batched_message_ids = ids;
    Some(combined)
}
