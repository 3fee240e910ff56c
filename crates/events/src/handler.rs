use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use chatrelay_core::{CoreError, InboundEvent, MessageId};

use crate::bus::PublishError;

/// Failure raised by the per-message business logic.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("handler failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Invalid(#[from] CoreError),

    #[error(transparent)]
    Publish(#[from] PublishError),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Processes one (possibly batched) inbound event.
///
/// This is the seam to the business logic: intent classification, prompt
/// construction, calls to sibling services. The coordination layer invokes it
/// from the consumer loop, the processing retry sweep and the admin retry
/// endpoints, so implementations must tolerate being called again for an event
/// that failed before.
///
/// ## Supersession Contract
///
/// Implementations that emit replies are expected to register the event with
/// the supersession tracker on entry, check it before and after the expensive
/// part, and complete it on exit (`BubbleGuard` in `chatrelay-infra` does all
/// three). Latency is unbounded; nothing in this layer times the call out.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn process(&self, event: InboundEvent, progress: Progress) -> Result<(), HandlerError>;
}

#[async_trait]
impl<H> MessageHandler for std::sync::Arc<H>
where
    H: MessageHandler + ?Sized,
{
    async fn process(&self, event: InboundEvent, progress: Progress) -> Result<(), HandlerError> {
        (**self).process(event, progress).await
    }
}

/// Processing stage reported by a handler (drives typing indicators upstream).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    Received,
    Understanding,
    Generating,
    Replying,
    Custom(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageUpdate {
    pub message_id: MessageId,
    pub stage: Stage,
}

/// Optional progress channel handed to the handler.
///
/// Reporting never fails and never blocks: with no listener attached (the
/// default) updates are discarded.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    tx: Option<mpsc::UnboundedSender<StageUpdate>>,
}

impl Progress {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StageUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn report(&self, message_id: &MessageId, stage: Stage) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(StageUpdate {
                message_id: message_id.clone(),
                stage,
            });
        }
    }
}
