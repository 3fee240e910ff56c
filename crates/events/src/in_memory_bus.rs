//! In-memory publisher for tests/dev.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::bus::{EventPublisher, PublishError};
use crate::outbound::{EventKind, OutboundEvent, ReplyEvent};

/// Records every accepted event.
///
/// - No IO
/// - Failure injection: `fail_next(n)` rejects the next `n` publishes,
///   `set_available(false)` rejects everything until flipped back
#[derive(Debug, Default)]
pub struct InMemoryPublisher {
    published: Mutex<Vec<OutboundEvent>>,
    fail_next: AtomicUsize,
    unavailable: AtomicBool,
    attempts: AtomicUsize,
}

impl InMemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Number of publish calls, successful or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<OutboundEvent> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn of_kind(&self, kind: EventKind) -> Vec<OutboundEvent> {
        self.published()
            .into_iter()
            .filter(|e| e.kind() == kind)
            .collect()
    }

    pub fn replies(&self) -> Vec<ReplyEvent> {
        self.published()
            .into_iter()
            .filter_map(|e| match e {
                OutboundEvent::Reply(r) => Some(r),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl EventPublisher for InMemoryPublisher {
    async fn publish(&self, event: &OutboundEvent) -> Result<(), PublishError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PublishError::Unavailable("in-memory publisher offline".to_string()));
        }

        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(PublishError::Unavailable("injected failure".to_string()));
        }

        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        Ok(())
    }
}
