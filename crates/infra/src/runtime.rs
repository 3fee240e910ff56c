//! Worker runtime: wires every component and owns the background tasks.
//!
//! Startup is two-phase because the business handler is built on top of the
//! shared tracker and publisher:
//!
//! ```ignore
//! let ctx = WorkerContext::new(config)?;
//! let handler = Arc::new(MyHandler::new(ctx.tracker(), ctx.publisher()));
//! let worker = ctx.start(handler).await?;
//! // ...
//! worker.shutdown().await;
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use chatrelay_events::{EventPublisher, MessageHandler};

use crate::broker::{AmqpConnector, AmqpPublisher, BrokerError, ConnectionManager, ConnectionState};
use crate::config::{ConfigError, WorkerConfig};
use crate::consumer::{BatchAssembler, ConsumerHook, Dispatcher};
use crate::retry::{
    FailedStoreStats, ProcessingRetryQueue, PublishRetryQueue, ReliablePublisher, RetryQueueStatus,
};
use crate::spam_guard::{SupersessionTracker, TrackerStats};

const CONSUMER_TAG: &str = "chatrelay-worker";

/// Components that exist before the handler does.
pub struct WorkerContext {
    config: WorkerConfig,
    shutdown: CancellationToken,
    manager: Arc<ConnectionManager<AmqpConnector>>,
    tracker: Arc<SupersessionTracker>,
    publish_retry: Arc<PublishRetryQueue>,
    publisher: Arc<ReliablePublisher>,
}

impl WorkerContext {
    pub fn new(config: WorkerConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let shutdown = CancellationToken::new();
        let broker = Arc::new(config.broker.clone());
        let manager = Arc::new(ConnectionManager::new(
            AmqpConnector::new(broker.clone()),
            broker.reconnect_backoff(),
            broker.reconnect_max_attempts,
            shutdown.clone(),
        ));

        let amqp: Arc<dyn EventPublisher> = Arc::new(AmqpPublisher::new(manager.clone(), broker));
        let publish_retry = Arc::new(PublishRetryQueue::new(amqp, config.publish_retry.clone()));
        let publisher = Arc::new(ReliablePublisher::new(publish_retry.clone()));
        let tracker = Arc::new(SupersessionTracker::new(config.supersession.stale_after));

        Ok(Self {
            config,
            shutdown,
            manager,
            tracker,
            publish_retry,
            publisher,
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn tracker(&self) -> Arc<SupersessionTracker> {
        self.tracker.clone()
    }

    /// Publisher that buffers broker outages in the publish retry queue.
    pub fn publisher(&self) -> Arc<dyn EventPublisher> {
        self.publisher.clone()
    }

    /// Spawn timers, arm the consumer and start the connection supervisor.
    pub async fn start(self, handler: Arc<dyn MessageHandler>) -> Result<Worker, BrokerError> {
        let Self {
            config,
            shutdown,
            manager,
            tracker,
            publish_retry,
            publisher,
        } = self;

        let publisher: Arc<dyn EventPublisher> = publisher;
        let processing_retry = Arc::new(ProcessingRetryQueue::new(
            handler.clone(),
            publisher.clone(),
            config.processing_retry.clone(),
        ));

        let tasks = TaskTracker::new();
        let mut dispatcher = Dispatcher::new(handler, publisher, processing_retry.clone(), tasks.clone());
        let mut background = Vec::new();

        let batcher = if config.batching.enabled {
            let (batcher, rx) = BatchAssembler::new(config.batching.clone());
            dispatcher = dispatcher.with_batching(batcher.clone());
            Some((batcher, rx))
        } else {
            None
        };
        let dispatcher = Arc::new(dispatcher);
        let (batcher, pump) = match batcher {
            Some((batcher, rx)) => (Some(batcher), Some(dispatcher.clone().spawn_batch_pump(rx))),
            None => (None, None),
        };

        background.push(publish_retry.clone().spawn(shutdown.clone()));
        background.push(processing_retry.clone().spawn(shutdown.clone()));
        background.push(
            tracker
                .clone()
                .spawn_sweeper(config.supersession.sweep_interval, shutdown.clone()),
        );

        let hook = Arc::new(ConsumerHook::new(dispatcher, CONSUMER_TAG, shutdown.clone()));
        manager.set_hook(hook).await?;
        let supervisor = manager.clone().start();

        info!(
            queue = %config.broker.queue,
            prefetch = config.broker.prefetch,
            batching = config.batching.enabled,
            "worker started"
        );

        Ok(Worker {
            grace: config.broker.shutdown_grace,
            shutdown,
            manager,
            tracker,
            publish_retry,
            processing_retry,
            batcher,
            pump,
            tasks,
            background,
            supervisor: Some(supervisor),
        })
    }
}

/// A running worker.
pub struct Worker {
    grace: Duration,
    shutdown: CancellationToken,
    manager: Arc<ConnectionManager<AmqpConnector>>,
    tracker: Arc<SupersessionTracker>,
    publish_retry: Arc<PublishRetryQueue>,
    processing_retry: Arc<ProcessingRetryQueue>,
    batcher: Option<Arc<BatchAssembler>>,
    pump: Option<JoinHandle<()>>,
    tasks: TaskTracker,
    background: Vec<JoinHandle<()>>,
    supervisor: Option<JoinHandle<Result<(), BrokerError>>>,
}

impl Worker {
    pub fn admin(&self) -> AdminHandle {
        AdminHandle {
            processing: self.processing_retry.clone(),
            publish: self.publish_retry.clone(),
            tracker: self.tracker.clone(),
            connection: self.manager.subscribe(),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// Resolves when the connection supervisor stops: `Err` means reconnection
    /// was exhausted and the process should exit.
    pub async fn wait_supervisor(&mut self) -> Result<(), BrokerError> {
        let Some(handle) = self.supervisor.as_mut() else {
            return std::future::pending().await;
        };
        let result = match handle.await {
            Ok(result) => result,
            Err(err) => Err(BrokerError::Connection(format!("supervisor task failed: {err}"))),
        };
        self.supervisor = None;
        result
    }

    /// Stop consuming, flush open batches, give in-flight handlers `grace` to
    /// settle, then close the broker connection.
    pub async fn shutdown(mut self) {
        info!("worker shutting down");
        self.shutdown.cancel();

        let deadline = tokio::time::Instant::now() + self.grace;
        if let Some(batcher) = &self.batcher {
            let flushed = batcher.close();
            if flushed > 0 {
                info!(flushed, "flushed open batches on shutdown");
            }
        }
        // the pump ends once every flushed batch has been handed to a task
        if let Some(mut pump) = self.pump.take() {
            if tokio::time::timeout_at(deadline, &mut pump).await.is_err() {
                warn!("batch pump did not drain before the grace period elapsed");
                pump.abort();
            }
        }

        self.tasks.close();
        if tokio::time::timeout_at(deadline, self.tasks.wait()).await.is_err() {
            warn!(
                in_flight = self.tasks.len(),
                grace_ms = self.grace.as_millis() as u64,
                "grace period elapsed with handlers still running"
            );
        }

        self.manager.close().await;

        for handle in self.background.drain(..) {
            handle.abort();
        }
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.abort();
        }
        info!("worker stopped");
    }
}

/// Read/act surface for the admin API.
#[derive(Clone)]
pub struct AdminHandle {
    pub processing: Arc<ProcessingRetryQueue>,
    pub publish: Arc<PublishRetryQueue>,
    pub tracker: Arc<SupersessionTracker>,
    pub connection: watch::Receiver<ConnectionState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetryQueuesSnapshot {
    pub publish: RetryQueueStatus,
    pub processing: RetryQueueStatus,
    pub failed_store: FailedStoreStats,
    pub supersession: TrackerStats,
    pub connection: ConnectionState,
}

impl AdminHandle {
    pub fn snapshot(&self) -> RetryQueuesSnapshot {
        RetryQueuesSnapshot {
            publish: self.publish.status(),
            processing: self.processing.status(),
            failed_store: self.processing.store().stats(),
            supersession: self.tracker.stats(),
            connection: *self.connection.borrow(),
        }
    }
}
