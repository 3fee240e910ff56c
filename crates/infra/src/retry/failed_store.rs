//! Failed-message store.
//!
//! Holds inbound events whose processing retries were exhausted. Entries leave
//! only through admin action (successful manual retry, clear) or eviction of
//! the oldest entry when the store is full.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use chatrelay_core::{InboundEvent, MessageId};

use crate::retry::processing::ProcessingRetryItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedStatus {
    Failed,
    Retrying,
    Resolved,
}

impl FailedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailedStatus::Failed => "failed",
            FailedStatus::Retrying => "retrying",
            FailedStatus::Resolved => "resolved",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedMessage {
    pub event: InboundEvent,
    pub attempts: u32,
    pub first_attempt: DateTime<Utc>,
    pub last_attempt: DateTime<Utc>,
    pub last_error: String,
    pub failed_at: DateTime<Utc>,
    pub status: FailedStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl FailedMessage {
    pub fn from_retry_item(item: ProcessingRetryItem, failed_at: DateTime<Utc>) -> Self {
        Self {
            event: item.event,
            attempts: item.attempts,
            first_attempt: item.first_attempt,
            last_attempt: item.last_attempt,
            last_error: item.last_error,
            failed_at,
            status: FailedStatus::Failed,
            resolved_at: None,
        }
    }

    pub fn id(&self) -> &MessageId {
        &self.event.id
    }
}

/// Admin operation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdminError {
    #[error("failed message not found: {0}")]
    NotFound(MessageId),

    #[error("failed message is already being retried: {0}")]
    AlreadyRetrying(MessageId),

    #[error("failed message is resolved: {0}")]
    AlreadyResolved(MessageId),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FailedStoreStats {
    pub total: usize,
    pub failed: usize,
    pub retrying: usize,
    pub resolved: usize,
    pub capacity: usize,
    pub evicted_total: u64,
}

#[derive(Debug)]
pub struct FailedMessageStore {
    entries: Mutex<VecDeque<FailedMessage>>,
    capacity: usize,
    evicted_total: AtomicU64,
}

impl FailedMessageStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            evicted_total: AtomicU64::new(0),
        }
    }

    fn entries(&self) -> MutexGuard<'_, VecDeque<FailedMessage>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store an exhausted message, replacing any entry with the same id.
    pub fn insert(&self, message: FailedMessage) {
        let mut entries = self.entries();
        entries.retain(|m| m.id() != message.id());

        error!(
            message_id = %message.id(),
            user_id = %message.event.user_id,
            attempts = message.attempts,
            error = %message.last_error,
            "message moved to failed store"
        );
        entries.push_back(message);

        while entries.len() > self.capacity {
            if let Some(evicted) = entries.pop_front() {
                self.evicted_total.fetch_add(1, Ordering::Relaxed);
                warn!(
                    message_id = %evicted.id(),
                    status = evicted.status.as_str(),
                    capacity = self.capacity,
                    "failed store full, evicted oldest entry"
                );
            }
        }
    }

    /// All entries, newest first.
    pub fn list(&self) -> Vec<FailedMessage> {
        self.entries().iter().rev().cloned().collect()
    }

    pub fn get(&self, id: &MessageId) -> Option<FailedMessage> {
        self.entries().iter().find(|m| m.id() == id).cloned()
    }

    pub fn ids_with_status(&self, status: FailedStatus) -> Vec<MessageId> {
        self.entries()
            .iter()
            .filter(|m| m.status == status)
            .map(|m| m.id().clone())
            .collect()
    }

    /// Mark an entry `retrying` and hand back its event for reprocessing.
    pub fn begin_retry(&self, id: &MessageId) -> Result<InboundEvent, AdminError> {
        let mut entries = self.entries();
        let entry = entries
            .iter_mut()
            .find(|m| m.id() == id)
            .ok_or_else(|| AdminError::NotFound(id.clone()))?;

        match entry.status {
            FailedStatus::Retrying => Err(AdminError::AlreadyRetrying(id.clone())),
            FailedStatus::Resolved => Err(AdminError::AlreadyResolved(id.clone())),
            FailedStatus::Failed => {
                entry.status = FailedStatus::Retrying;
                Ok(entry.event.clone())
            }
        }
    }

    /// Settle a retry started with [`begin_retry`](Self::begin_retry).
    ///
    /// Success removes the entry; failure reverts it to `failed` with the new
    /// error. A miss (entry cleared or evicted meanwhile) is a no-op.
    pub fn finish_retry(&self, id: &MessageId, outcome: Result<(), String>) -> Option<FailedMessage> {
        let mut entries = self.entries();
        let pos = entries.iter().position(|m| m.id() == id)?;

        match outcome {
            Ok(()) => {
                let removed = entries.remove(pos);
                info!(message_id = %id, "manual retry succeeded, failed entry removed");
                removed
            }
            Err(err) => {
                let entry = &mut entries[pos];
                let now = Utc::now();
                entry.status = FailedStatus::Failed;
                entry.attempts += 1;
                entry.last_attempt = now;
                entry.failed_at = now;
                entry.last_error = err;
                warn!(message_id = %id, attempts = entry.attempts, error = %entry.last_error, "manual retry failed");
                Some(entry.clone())
            }
        }
    }

    pub fn mark_resolved(&self, id: &MessageId) -> Result<FailedMessage, AdminError> {
        let mut entries = self.entries();
        let entry = entries
            .iter_mut()
            .find(|m| m.id() == id)
            .ok_or_else(|| AdminError::NotFound(id.clone()))?;

        if entry.status == FailedStatus::Retrying {
            return Err(AdminError::AlreadyRetrying(id.clone()));
        }
        entry.status = FailedStatus::Resolved;
        entry.resolved_at.get_or_insert_with(Utc::now);
        Ok(entry.clone())
    }

    /// Remove entries; `only_resolved` limits it to resolved ones. Entries
    /// currently being retried are kept. Returns the number removed.
    pub fn clear(&self, only_resolved: bool) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|m| match m.status {
            FailedStatus::Retrying => true,
            FailedStatus::Resolved => false,
            FailedStatus::Failed => only_resolved,
        });
        let removed = before - entries.len();
        if removed > 0 {
            info!(removed, only_resolved, "failed store cleared");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn stats(&self) -> FailedStoreStats {
        let entries = self.entries();
        let count = |s: FailedStatus| entries.iter().filter(|m| m.status == s).count();
        FailedStoreStats {
            total: entries.len(),
            failed: count(FailedStatus::Failed),
            retrying: count(FailedStatus::Retrying),
            resolved: count(FailedStatus::Resolved),
            capacity: self.capacity,
            evicted_total: self.evicted_total.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatrelay_core::UserId;

    fn failed(id: &str) -> FailedMessage {
        let now = Utc::now();
        FailedMessage {
            event: InboundEvent::new(MessageId::new(id), UserId::new("u-1"), None, "hi", now),
            attempts: 3,
            first_attempt: now,
            last_attempt: now,
            last_error: "boom".to_string(),
            failed_at: now,
            status: FailedStatus::Failed,
            resolved_at: None,
        }
    }

    #[test]
    fn insert_evicts_oldest_when_full() {
        let store = FailedMessageStore::new(2);
        store.insert(failed("a"));
        store.insert(failed("b"));
        store.insert(failed("c"));

        assert!(store.get(&MessageId::new("a")).is_none());
        let ids: Vec<String> = store.list().iter().map(|m| m.id().to_string()).collect();
        assert_eq!(ids, vec!["c", "b"]);
        assert_eq!(store.stats().evicted_total, 1);
    }

    #[test]
    fn insert_replaces_same_id() {
        let store = FailedMessageStore::new(10);
        store.insert(failed("a"));
        let mut again = failed("a");
        again.last_error = "second".to_string();
        store.insert(again);

        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&MessageId::new("a")).unwrap().last_error, "second");
    }

    #[test]
    fn retry_cycle_never_leaves_entry_retrying() {
        let store = FailedMessageStore::new(10);
        store.insert(failed("a"));
        let id = MessageId::new("a");

        store.begin_retry(&id).unwrap();
        assert_eq!(store.begin_retry(&id), Err(AdminError::AlreadyRetrying(id.clone())));

        let reverted = store.finish_retry(&id, Err("still broken".to_string())).unwrap();
        assert_eq!(reverted.status, FailedStatus::Failed);
        assert_eq!(reverted.last_error, "still broken");
        assert_eq!(reverted.attempts, 4);

        store.begin_retry(&id).unwrap();
        store.finish_retry(&id, Ok(()));
        assert!(store.get(&id).is_none());
    }

    #[test]
    fn begin_retry_unknown_is_not_found() {
        let store = FailedMessageStore::new(10);
        let id = MessageId::new("nope");
        assert_eq!(store.begin_retry(&id), Err(AdminError::NotFound(id)));
    }

    #[test]
    fn resolved_entries_are_cleared_selectively() {
        let store = FailedMessageStore::new(10);
        store.insert(failed("a"));
        store.insert(failed("b"));
        store.mark_resolved(&MessageId::new("a")).unwrap();

        assert_eq!(
            store.begin_retry(&MessageId::new("a")),
            Err(AdminError::AlreadyResolved(MessageId::new("a")))
        );

        assert_eq!(store.clear(true), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.clear(false), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn clear_keeps_entries_mid_retry() {
        let store = FailedMessageStore::new(10);
        store.insert(failed("a"));
        store.begin_retry(&MessageId::new("a")).unwrap();

        assert_eq!(store.clear(false), 0);
        assert_eq!(store.stats().retrying, 1);
    }
}
