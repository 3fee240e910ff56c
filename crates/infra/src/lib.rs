//! Infrastructure layer: broker connection, consumption, supersession, retries.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod retry;
pub mod runtime;
pub mod spam_guard;

#[cfg(test)]
mod integration_tests;

pub use config::{ConfigError, WorkerConfig};
pub use runtime::{AdminHandle, RetryQueuesSnapshot, Worker, WorkerContext};
pub use spam_guard::{BubbleGuard, SendDecision, SendReason, SupersessionTracker};
