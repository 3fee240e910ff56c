//! The consumer loop: broker stream -> dispatcher.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{AmqpSession, BrokerError, LossNotifier, SessionHook};

use super::delivery::InboundDelivery;
use super::dispatcher::Dispatcher;

/// Pull deliveries until the stream ends, fails or shutdown is requested.
///
/// Each delivery is dispatched on its own tracked task; prefetch bounds how many
/// are in flight. An unexpected end of the stream is reported as a loss so the
/// connection manager reconnects and re-arms.
pub async fn run_consumer<S>(
    mut deliveries: S,
    dispatcher: Arc<Dispatcher>,
    loss: LossNotifier,
    shutdown: CancellationToken,
) where
    S: Stream<Item = Result<InboundDelivery, BrokerError>> + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("consumer loop stopping on shutdown");
                return;
            }
            next = deliveries.next() => next,
        };

        match next {
            Some(Ok(delivery)) => {
                let d = Arc::clone(&dispatcher);
                dispatcher.tasks().spawn(async move { d.on_delivery(delivery).await });
            }
            Some(Err(err)) => {
                warn!(error = %err, "consumer stream failed");
                loss.notify();
                return;
            }
            None => {
                if !shutdown.is_cancelled() {
                    warn!("consumer stream ended unexpectedly");
                    loss.notify();
                }
                return;
            }
        }
    }
}

/// Starts a consumer loop on every new AMQP session.
pub struct ConsumerHook {
    dispatcher: Arc<Dispatcher>,
    consumer_tag: String,
    shutdown: CancellationToken,
}

impl ConsumerHook {
    pub fn new(dispatcher: Arc<Dispatcher>, consumer_tag: impl Into<String>, shutdown: CancellationToken) -> Self {
        Self {
            dispatcher,
            consumer_tag: consumer_tag.into(),
            shutdown,
        }
    }
}

#[async_trait]
impl SessionHook<AmqpSession> for ConsumerHook {
    async fn on_connected(&self, session: Arc<AmqpSession>) -> Result<(), BrokerError> {
        let consumer = session.consume(&self.consumer_tag).await?;
        let stream = consumer.map(|item| {
            item.map(InboundDelivery::from)
                .map_err(|e| BrokerError::Consume(e.to_string()))
        });

        info!(consumer_tag = %self.consumer_tag, generation = session.loss_notifier().generation(), "consumer armed");
        tokio::spawn(run_consumer(
            stream,
            Arc::clone(&self.dispatcher),
            session.loss_notifier(),
            self.shutdown.clone(),
        ));
        Ok(())
    }
}
