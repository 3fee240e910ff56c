//! Connection lifecycle and the reconnect loop.
//!
//! State machine: `Disconnected -> Connecting -> Connected`, back to
//! `Disconnected` on an unexpected close. A loss starts the reconnect loop:
//! wait `backoff(attempt)`, try again, reset the counter on success and re-arm
//! the registered [`SessionHook`] (the consumer loop) against the new session.
//!
//! The manager is generic over a [`Connector`] so the loop can be driven by a
//! fake transport in tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use chatrelay_core::Backoff;

use super::{BrokerError, ConnectionState};

/// Reports an unexpected loss of the session it was handed to.
///
/// Each notifier carries the generation of the session it belongs to, so a late
/// callback from an already-replaced session cannot trigger a second reconnect.
#[derive(Debug, Clone)]
pub struct LossNotifier {
    generation: u64,
    tx: mpsc::UnboundedSender<u64>,
}

impl LossNotifier {
    pub fn notify(&self) {
        let _ = self.tx.send(self.generation);
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[cfg(test)]
    pub(crate) fn detached(generation: u64) -> (Self, mpsc::UnboundedReceiver<u64>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { generation, tx }, rx)
    }
}

/// Opens a session: connection, channel and topology.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Session: Session;

    async fn connect(&self, loss: LossNotifier) -> Result<Self::Session, BrokerError>;
}

#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// Deliberate close; must not panic if the transport is already gone.
    async fn close(&self);
}

/// Armed against every new session (initial connect and each reconnect).
#[async_trait]
pub trait SessionHook<S>: Send + Sync {
    async fn on_connected(&self, session: Arc<S>) -> Result<(), BrokerError>;
}

pub struct ConnectionManager<C: Connector> {
    connector: C,
    backoff: Backoff,
    /// 0 = infinite.
    max_attempts: u32,
    session: Mutex<Option<Arc<C::Session>>>,
    hook: Mutex<Option<Arc<dyn SessionHook<C::Session>>>>,
    generation: AtomicU64,
    reconnecting: AtomicBool,
    state: watch::Sender<ConnectionState>,
    loss_tx: mpsc::UnboundedSender<u64>,
    loss_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<u64>>,
    shutdown: CancellationToken,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, backoff: Backoff, max_attempts: u32, shutdown: CancellationToken) -> Self {
        let (loss_tx, loss_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            backoff,
            max_attempts,
            session: Mutex::new(None),
            hook: Mutex::new(None),
            generation: AtomicU64::new(0),
            reconnecting: AtomicBool::new(false),
            state,
            loss_tx,
            loss_rx: tokio::sync::Mutex::new(loss_rx),
            shutdown,
        }
    }

    fn session_slot(&self) -> MutexGuard<'_, Option<Arc<C::Session>>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn hook_slot(&self) -> MutexGuard<'_, Option<Arc<dyn SessionHook<C::Session>>>> {
        self.hook.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Current session, if connected.
    pub fn session(&self) -> Option<Arc<C::Session>> {
        self.session_slot().clone()
    }

    /// Notifier for the current session generation.
    pub fn loss_notifier(&self) -> LossNotifier {
        LossNotifier {
            generation: self.generation.load(Ordering::SeqCst),
            tx: self.loss_tx.clone(),
        }
    }

    /// Register the hook re-armed on every new session. If already connected it
    /// is armed immediately.
    pub async fn set_hook(&self, hook: Arc<dyn SessionHook<C::Session>>) -> Result<(), BrokerError> {
        *self.hook_slot() = Some(hook.clone());
        match self.session() {
            Some(session) => hook.on_connected(session).await,
            None => Ok(()),
        }
    }

    /// Open a new session and arm the hook against it.
    pub async fn connect(&self) -> Result<Arc<C::Session>, BrokerError> {
        self.set_state(ConnectionState::Connecting);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let loss = LossNotifier {
            generation,
            tx: self.loss_tx.clone(),
        };

        let session = match self.connector.connect(loss.clone()).await {
            Ok(session) => Arc::new(session),
            Err(err) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(err);
            }
        };

        *self.session_slot() = Some(session.clone());
        self.set_state(ConnectionState::Connected);
        info!(generation, "broker connected");

        let hook = self.hook_slot().clone();
        if let Some(hook) = hook {
            if let Err(err) = hook.on_connected(session.clone()).await {
                warn!(generation, error = %err, "failed to re-arm consumer, treating session as lost");
                loss.notify();
            }
        }
        Ok(session)
    }

    /// Connect (retrying through the reconnect loop) and supervise the session
    /// until shutdown.
    pub fn start(self: Arc<Self>) -> JoinHandle<Result<(), BrokerError>> {
        tokio::spawn(async move {
            if let Err(err) = self.connect().await {
                warn!(error = %err, "initial broker connect failed");
                self.reconnect().await?;
            }
            self.supervise().await
        })
    }

    /// Wait for loss notifications and reconnect. Returns `Ok` on shutdown and
    /// `Err` once a non-zero attempt cap is exhausted.
    pub async fn supervise(&self) -> Result<(), BrokerError> {
        let mut loss_rx = self.loss_rx.lock().await;
        loop {
            let generation = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                received = loss_rx.recv() => match received {
                    Some(generation) => generation,
                    None => return Ok(()),
                },
            };

            if self.shutdown.is_cancelled() {
                return Ok(());
            }
            let current = self.generation.load(Ordering::SeqCst);
            if generation != current {
                debug!(generation, current, "ignoring loss of a replaced session");
                continue;
            }

            warn!(generation, "broker connection lost");
            self.session_slot().take();
            self.set_state(ConnectionState::Disconnected);
            self.reconnect().await?;
        }
    }

    /// The reconnect loop. Concurrent calls collapse into one.
    pub async fn reconnect(&self) -> Result<(), BrokerError> {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            debug!("reconnect already in progress");
            return Ok(());
        }
        let result = self.reconnect_inner().await;
        self.reconnecting.store(false, Ordering::SeqCst);
        result
    }

    async fn reconnect_inner(&self) -> Result<(), BrokerError> {
        let mut attempt: u32 = 0;
        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            let delay = self.backoff.delay(attempt);
            self.set_state(ConnectionState::Reconnecting { attempt: attempt + 1 });
            info!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "reconnecting to broker");

            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            match self.connect().await {
                Ok(_) => {
                    info!(attempts = attempt + 1, "broker reconnected");
                    return Ok(());
                }
                Err(err) => {
                    attempt += 1;
                    warn!(attempt, error = %err, "reconnect attempt failed");
                    if self.max_attempts > 0 && attempt >= self.max_attempts {
                        error!(attempts = attempt, "giving up on broker reconnection");
                        self.set_state(ConnectionState::Disconnected);
                        return Err(BrokerError::ReconnectExhausted { attempts: attempt });
                    }
                }
            }
        }
    }

    /// Deliberate close. Loss callbacks fired by the close are ignored once the
    /// shutdown token is cancelled.
    pub async fn close(&self) {
        let session = self.session_slot().take();
        if let Some(session) = session {
            session.close().await;
        }
        self.set_state(ConnectionState::Closed);
        info!("broker connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::time::Instant;

    struct FakeSession {
        loss: LossNotifier,
        closed: AtomicBool,
    }

    #[async_trait]
    impl Session for FakeSession {
        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Fails the first `failures` connects, then succeeds.
    #[derive(Clone, Default)]
    struct FakeConnector {
        failures: Arc<AtomicUsize>,
        attempts: Arc<Mutex<Vec<Instant>>>,
    }

    impl FakeConnector {
        fn failing(n: usize) -> Self {
            let c = Self::default();
            c.failures.store(n, Ordering::SeqCst);
            c
        }

        fn attempt_times(&self) -> Vec<Instant> {
            self.attempts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        type Session = FakeSession;

        async fn connect(&self, loss: LossNotifier) -> Result<FakeSession, BrokerError> {
            self.attempts.lock().unwrap().push(Instant::now());
            let failed = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                return Err(BrokerError::Connection("refused".to_string()));
            }
            Ok(FakeSession {
                loss,
                closed: AtomicBool::new(false),
            })
        }
    }

    #[derive(Default)]
    struct CountingHook {
        armed: AtomicUsize,
    }

    #[async_trait]
    impl SessionHook<FakeSession> for CountingHook {
        async fn on_connected(&self, _session: Arc<FakeSession>) -> Result<(), BrokerError> {
            self.armed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn backoff() -> Backoff {
        Backoff::new(Duration::from_millis(100), Duration::from_secs(1), 0.3)
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_failures_back_off_then_restore_consumption() {
        let connector = FakeConnector::failing(6);
        let shutdown = CancellationToken::new();
        let manager = Arc::new(ConnectionManager::new(connector.clone(), backoff(), 0, shutdown.clone()));
        let hook = Arc::new(CountingHook::default());
        manager.set_hook(hook.clone()).await.unwrap();

        let handle = manager.clone().start();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert!(manager.state().is_connected());
        assert_eq!(hook.armed.load(Ordering::SeqCst), 1);

        let times = connector.attempt_times();
        assert_eq!(times.len(), 7);
        let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
        for pair in gaps.windows(2) {
            assert!(pair[1] >= pair[0], "delays must not shrink: {gaps:?}");
        }
        assert!(gaps.iter().all(|g| *g <= Duration::from_secs(1)));

        shutdown.cancel();
        assert_eq!(handle.await.unwrap(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn loss_triggers_reconnect_and_rearms_hook() {
        let connector = FakeConnector::default();
        let shutdown = CancellationToken::new();
        let manager = Arc::new(ConnectionManager::new(connector.clone(), backoff(), 0, shutdown.clone()));
        let hook = Arc::new(CountingHook::default());
        manager.set_hook(hook.clone()).await.unwrap();

        let handle = manager.clone().start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(hook.armed.load(Ordering::SeqCst), 1);

        let first = manager.session().unwrap();
        first.loss.notify();
        // a duplicate callback from the same dead session must not reconnect twice
        first.loss.notify();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(manager.state().is_connected());
        assert_eq!(hook.armed.load(Ordering::SeqCst), 2);
        assert_eq!(connector.attempt_times().len(), 2);

        shutdown.cancel();
        manager.close().await;
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert_eq!(handle.await.unwrap(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn non_zero_cap_is_fatal_when_exhausted() {
        let connector = FakeConnector::failing(usize::MAX);
        let manager = Arc::new(ConnectionManager::new(connector.clone(), backoff(), 3, CancellationToken::new()));

        let result = manager.clone().start().await.unwrap();
        assert_eq!(result, Err(BrokerError::ReconnectExhausted { attempts: 3 }));
        // initial attempt plus three reconnects
        assert_eq!(connector.attempt_times().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_aborts_reconnect_during_backoff() {
        let connector = FakeConnector::failing(usize::MAX);
        let shutdown = CancellationToken::new();
        let manager = Arc::new(ConnectionManager::new(connector.clone(), backoff(), 0, shutdown.clone()));

        let handle = manager.clone().start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();

        assert_eq!(handle.await.unwrap(), Ok(()));
        assert_eq!(connector.attempt_times().len(), 1);
    }
}
