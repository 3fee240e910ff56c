//! Outbound publishing abstraction (mechanics only).
//!
//! This module provides the **publisher seam** between the worker's
//! coordination layer and whatever transport carries outbound events (AMQP in
//! production, an in-memory recorder in tests).
//!
//! ## Delivery Guarantees
//!
//! Publishing is **at-most-once from the caller's point of view**:
//!
//! - A successful `publish` means the transport accepted the event
//! - A failed `publish` is surfaced to the caller, which decides whether to buffer
//!   it for a later retry (see the publish retry queue in `chatrelay-infra`)
//! - Nothing here deduplicates; callers that retry must tolerate duplicates on the
//!   consuming side
//!
//! ## Error Handling
//!
//! [`PublishError::is_transient`] separates "broker temporarily unreachable"
//! (worth retrying) from failures that will never succeed, such as a payload
//! that cannot be serialized.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::outbound::OutboundEvent;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// No connection/channel, or the channel closed under us.
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// The broker refused the publish (nack, closed exchange...).
    #[error("publish rejected: {0}")]
    Rejected(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl PublishError {
    /// Whether replaying the same publish later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, PublishError::Unavailable(_) | PublishError::Rejected(_))
    }
}

/// Publishes outbound events.
///
/// The trait requires `Send + Sync`; implementations are shared between the
/// consumer tasks, the retry sweeps and the admin surface.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &OutboundEvent) -> Result<(), PublishError>;
}

#[async_trait]
impl<P> EventPublisher for Arc<P>
where
    P: EventPublisher + ?Sized,
{
    async fn publish(&self, event: &OutboundEvent) -> Result<(), PublishError> {
        (**self).publish(event).await
    }
}
