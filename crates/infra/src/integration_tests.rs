//! End-to-end tests for the delivery pipeline.
//!
//! Tests: Delivery → Dispatcher (→ BatchAssembler) → Handler + SupersessionTracker
//! → ReliablePublisher → retry queues
//!
//! Verifies:
//! - A burst from one user yields exactly one reply, for the last message
//! - Batched deliveries are processed once and settled together
//! - Broker outages are absorbed by the publish retry queue
//! - Exhausted handler failures reach the failed store and can be retried

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use tokio_util::task::TaskTracker;

    use chatrelay_core::{InboundEvent, MessageId, UserId};
    use chatrelay_events::{
        EventPublisher, HandlerError, InMemoryPublisher, MessageHandler, OutboundEvent, Progress,
        ReplyEvent,
    };

    use crate::config::{BatchingConfig, ProcessingRetryConfig, PublishRetryConfig};
    use crate::consumer::delivery::testing::{AckLog, Settlement};
    use crate::consumer::{BatchAssembler, Dispatcher};
    use crate::retry::{FailedStatus, ProcessingRetryQueue, PublishRetryQueue, ReliablePublisher};
    use crate::spam_guard::{BubbleGuard, SupersessionTracker};

    /// Stand-in for the business handler: honours the supersession contract and
    /// replies with a latency picked from the message text.
    struct ReplyingHandler {
        tracker: Arc<SupersessionTracker>,
        publisher: Arc<dyn EventPublisher>,
        failing: AtomicBool,
        calls: AtomicUsize,
    }

    impl ReplyingHandler {
        fn new(tracker: Arc<SupersessionTracker>, publisher: Arc<dyn EventPublisher>) -> Arc<Self> {
            Arc::new(Self {
                tracker,
                publisher,
                failing: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl MessageHandler for ReplyingHandler {
        async fn process(&self, event: InboundEvent, _progress: Progress) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(HandlerError::failed("model unavailable"));
            }

            let guard = BubbleGuard::register(self.tracker.clone(), &event);
            if !guard.should_send().send {
                return Ok(());
            }

            let latency = event.text.parse::<u64>().unwrap_or(10);
            tokio::time::sleep(Duration::from_millis(latency)).await;

            let decision = guard.should_send();
            if !decision.send {
                return Ok(());
            }
            self.publisher
                .publish(&OutboundEvent::Reply(ReplyEvent {
                    tenant_id: event.tenant_id.clone(),
                    user_id: event.user_id.clone(),
                    text: format!("echo: {}", event.text),
                    guidance: None,
                    message_id: Some(event.id.clone()),
                    batched_message_ids: Some(decision.all_message_ids),
                }))
                .await?;
            Ok(())
        }
    }

    struct Pipeline {
        inner: Arc<InMemoryPublisher>,
        publish_retry: Arc<PublishRetryQueue>,
        processing_retry: Arc<ProcessingRetryQueue>,
        handler: Arc<ReplyingHandler>,
        tracker: Arc<SupersessionTracker>,
        dispatcher: Dispatcher,
    }

    fn pipeline(max_processing_attempts: u32) -> Pipeline {
        let inner = Arc::new(InMemoryPublisher::new());
        let publish_retry = Arc::new(PublishRetryQueue::new(inner.clone(), PublishRetryConfig::default()));
        let publisher: Arc<dyn EventPublisher> = Arc::new(ReliablePublisher::new(publish_retry.clone()));
        let tracker = Arc::new(SupersessionTracker::default());
        let handler = ReplyingHandler::new(tracker.clone(), publisher.clone());
        let processing_retry = Arc::new(ProcessingRetryQueue::new(
            handler.clone(),
            publisher.clone(),
            ProcessingRetryConfig {
                max_attempts: max_processing_attempts,
                ..ProcessingRetryConfig::default()
            },
        ));
        let dispatcher = Dispatcher::new(handler.clone(), publisher, processing_retry.clone(), TaskTracker::new());

        Pipeline {
            inner,
            publish_retry,
            processing_retry,
            handler,
            tracker,
            dispatcher,
        }
    }

    fn body(id: &str, user: &str, text: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "id": id,
            "userId": user,
            "tenantId": "acme",
            "text": text,
            "receivedAt": Utc::now().to_rfc3339(),
        }))
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn burst_from_one_user_gets_exactly_one_reply_for_the_last_message() {
        let p = pipeline(3);
        let dispatcher = Arc::new(p.dispatcher);
        let log = AckLog::default();

        // handler latencies deliberately out of order: the first message finishes last
        for (tag, latency) in [(1u64, "3000"), (2, "1000"), (3, "2000")] {
            let d = dispatcher.clone();
            let delivery = log.delivery(tag, body(&format!("m{tag}"), "u-1", latency), false);
            dispatcher.tasks().spawn(async move { d.on_delivery(delivery).await });
            tokio::task::yield_now().await;
        }
        dispatcher.tasks().close();
        dispatcher.tasks().wait().await;

        let replies = p.inner.replies();
        assert_eq!(replies.len(), 1, "{replies:?}");
        assert_eq!(replies[0].message_id, Some(MessageId::new("m3")));
        assert_eq!(
            replies[0].batched_message_ids,
            Some(vec![MessageId::new("m1"), MessageId::new("m2"), MessageId::new("m3")])
        );
        assert_eq!(p.handler.calls.load(Ordering::SeqCst), 3);
        for tag in 1..=3 {
            assert_eq!(log.settlement(tag), Some(Settlement::Acked));
        }
        assert_eq!(p.tracker.stats().users, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn different_users_each_get_a_reply() {
        let p = pipeline(3);
        let log = AckLog::default();

        p.dispatcher.on_delivery(log.delivery(1, body("a1", "alice", "5"), false)).await;
        p.dispatcher.on_delivery(log.delivery(2, body("b1", "bob", "5"), false)).await;

        let users: Vec<UserId> = p.inner.replies().into_iter().map(|r| r.user_id).collect();
        assert_eq!(users, vec![UserId::new("alice"), UserId::new("bob")]);
    }

    #[tokio::test(start_paused = true)]
    async fn batched_burst_is_processed_once_and_acked_together() {
        let p = pipeline(3);
        let (batcher, rx) = BatchAssembler::new(BatchingConfig::default());
        let dispatcher = Arc::new(p.dispatcher.with_batching(batcher));
        let pump = dispatcher.clone().spawn_batch_pump(rx);
        let log = AckLog::default();

        for tag in 1..=3u64 {
            dispatcher
                .on_delivery(log.delivery(tag, body(&format!("m{tag}"), "u-1", "hey"), false))
                .await;
        }
        assert!(log.entries().is_empty());

        tokio::time::sleep(Duration::from_secs(4)).await;
        dispatcher.tasks().close();
        dispatcher.tasks().wait().await;

        assert_eq!(p.handler.calls.load(Ordering::SeqCst), 1);
        let replies = p.inner.replies();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].text, "echo: 1. hey\n2. hey\n3. hey");
        assert_eq!(replies[0].message_id, Some(MessageId::new("m3")));
        for tag in 1..=3 {
            assert_eq!(log.settlement(tag), Some(Settlement::Acked));
        }
        pump.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn broker_outage_is_absorbed_by_publish_retry() {
        let p = pipeline(3);
        let log = AckLog::default();

        p.inner.set_available(false);
        p.dispatcher.on_delivery(log.delivery(1, body("m1", "u-1", "5"), false)).await;

        // processing, reply and completed status are all buffered
        assert_eq!(log.settlement(1), Some(Settlement::Acked));
        assert_eq!(p.publish_retry.len(), 3);
        assert!(p.inner.published().is_empty());

        p.inner.set_available(true);
        p.publish_retry.drain_once().await;

        assert_eq!(p.inner.replies().len(), 1);
        assert_eq!(p.inner.published().len(), 3);
        assert!(p.publish_retry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_failure_reaches_failed_store_and_admin_retry_resolves_it() {
        let p = pipeline(2);
        let log = AckLog::default();
        p.handler.failing.store(true, Ordering::SeqCst);

        // first delivery: broker gets one free retry
        p.dispatcher.on_delivery(log.delivery(1, body("m1", "u-1", "5"), false)).await;
        assert_eq!(log.settlement(1), Some(Settlement::Requeued));

        // redelivery fails too: parked for processing retry, not requeued
        p.dispatcher.on_delivery(log.delivery(2, body("m1", "u-1", "5"), true)).await;
        assert_eq!(log.settlement(2), Some(Settlement::Dropped));
        assert_eq!(p.processing_retry.len(), 1);

        let report = p
            .processing_retry
            .process_due_at(Utc::now() + chrono::Duration::minutes(11))
            .await;
        assert_eq!(report.promoted, 1);

        let store = p.processing_retry.store();
        let failed = store.get(&MessageId::new("m1")).unwrap();
        assert_eq!(failed.status, FailedStatus::Failed);
        assert_eq!(failed.attempts, 2);

        p.handler.failing.store(false, Ordering::SeqCst);
        let outcome = p.processing_retry.retry_failed(&MessageId::new("m1")).await.unwrap();
        assert!(outcome.succeeded);
        assert!(store.is_empty());
        assert_eq!(p.inner.replies().len(), 1);
    }
}
