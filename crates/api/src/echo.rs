//! Placeholder business handler shipped with the binary.
//!
//! Replies with the received text. It honours the supersession contract the
//! way a real handler must: register on entry, check before and after the
//! slow part, complete on exit.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use chatrelay_core::InboundEvent;
use chatrelay_events::{
    EventPublisher, HandlerError, MessageHandler, OutboundEvent, Progress, ReplyEvent, Stage,
};
use chatrelay_infra::{BubbleGuard, SupersessionTracker};

pub struct EchoHandler {
    tracker: Arc<SupersessionTracker>,
    publisher: Arc<dyn EventPublisher>,
    think_time: Duration,
}

impl EchoHandler {
    pub fn new(tracker: Arc<SupersessionTracker>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            tracker,
            publisher,
            think_time: Duration::ZERO,
        }
    }

    /// Simulated handler latency.
    pub fn with_think_time(mut self, think_time: Duration) -> Self {
        self.think_time = think_time;
        self
    }
}

#[async_trait]
impl MessageHandler for EchoHandler {
    async fn process(&self, event: InboundEvent, progress: Progress) -> Result<(), HandlerError> {
        progress.report(&event.id, Stage::Received);
        let guard = BubbleGuard::register(self.tracker.clone(), &event);

        let early = guard.should_send();
        if !early.send {
            debug!(message_id = %event.id, reason = early.reason.as_str(), "superseded before generation");
            return Ok(());
        }

        progress.report(&event.id, Stage::Generating);
        if !self.think_time.is_zero() {
            tokio::time::sleep(self.think_time).await;
        }

        let decision = guard.should_send();
        if !decision.send {
            debug!(message_id = %event.id, reason = decision.reason.as_str(), "reply suppressed");
            return Ok(());
        }

        progress.report(&event.id, Stage::Replying);
        let reply = ReplyEvent {
            tenant_id: event.tenant_id.clone(),
            user_id: event.user_id.clone(),
            text: event.text.clone(),
            guidance: None,
            message_id: Some(event.id.clone()),
            batched_message_ids: (decision.all_message_ids.len() > 1).then_some(decision.all_message_ids),
        };
        self.publisher.publish(&OutboundEvent::Reply(reply)).await?;
        guard.complete();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatrelay_core::{MessageId, UserId};
    use chatrelay_events::InMemoryPublisher;
    use chrono::Utc;

    #[tokio::test]
    async fn echoes_text_and_completes() {
        let tracker = Arc::new(SupersessionTracker::default());
        let publisher = Arc::new(InMemoryPublisher::new());
        let handler = EchoHandler::new(tracker.clone(), publisher.clone());

        let event = InboundEvent::new(MessageId::new("m1"), UserId::new("u"), None, "ping", Utc::now());
        handler.process(event, Progress::none()).await.unwrap();

        let replies = publisher.replies();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].text, "ping");
        assert_eq!(replies[0].batched_message_ids, None);
        assert_eq!(tracker.stats().in_flight, 0);
    }
}
