//! Retry subsystems.
//!
//! - [`publish`]: outbound publishes that failed because the broker was
//!   unreachable, replayed on a short fixed interval, lossy once capped.
//! - [`processing`]: inbound events whose handler failed, retried on a long
//!   interval and demoted to the [`failed_store`] once exhausted.
//!
//! All state is in-memory and lost on restart.

pub mod failed_store;
pub mod processing;
pub mod publish;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub use failed_store::{
    AdminError, FailedMessage, FailedMessageStore, FailedStatus, FailedStoreStats,
};
pub use processing::{
    ProcessingRetryItem, ProcessingRetryQueue, RetryAllReport, RetryOutcome, SweepReport,
};
pub use publish::{DrainReport, PublishRetryQueue, ReliablePublisher, RetryItem};

/// Queue depth snapshot for the admin surface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryQueueStatus {
    pub depth: usize,
    pub capacity: usize,
    pub oldest_first_attempt: Option<DateTime<Utc>>,
    pub succeeded_total: u64,
    /// Publish queue: items dropped after the attempt cap. Processing queue:
    /// items promoted to the failed store.
    pub dropped_total: u64,
    pub evicted_total: u64,
}
