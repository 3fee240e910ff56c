//! Per-user in-flight supersession tracker ("bubble chat" guard).
//!
//! Under a prefetch depth greater than one, several messages from the same user
//! can be mid-processing at once, each with its own unpredictable handler
//! latency. Every message is still processed (handler side effects happen for
//! each), but only the chronologically last registered message of a burst may
//! emit a reply.
//!
//! Handlers check [`SupersessionTracker::should_send`] twice: right after
//! registering (skip expensive work when already superseded) and again after the
//! handler's slow part, because any number of newer messages can register while
//! it is suspended.
//!
//! All state lives behind one synchronous mutex and no method suspends while
//! holding it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use chatrelay_core::{ConversationKey, Conversational, InboundEvent, MessageId};

#[derive(Debug, Clone)]
struct InFlightRecord {
    text: String,
    started_at: DateTime<Utc>,
    superseded: bool,
    superseded_by: Option<MessageId>,
}

#[derive(Debug, Default)]
struct UserState {
    in_flight: HashMap<MessageId, InFlightRecord>,
    /// Most recently registered message that has not completed yet.
    latest: Option<MessageId>,
    /// Every message id sharing this response cycle, in registration order.
    bubble: Vec<MessageId>,
}

impl UserState {
    fn push_bubble(&mut self, id: &MessageId) {
        if !self.bubble.contains(id) {
            self.bubble.push(id.clone());
        }
    }
}

/// Outcome of [`SupersessionTracker::register`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Bubble of the current response cycle, including the new message.
    pub all_message_ids: Vec<MessageId>,
    /// Earlier in-flight messages this registration superseded.
    pub superseded: Vec<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SendReason {
    LatestMessage,
    Superseded { by: Option<MessageId> },
    NewerMessage { latest: Option<MessageId> },
    /// No state for the user (already completed or swept); replies are allowed.
    Untracked,
}

impl SendReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SendReason::LatestMessage => "latest_message",
            SendReason::Superseded { .. } => "superseded",
            SendReason::NewerMessage { .. } => "newer_message",
            SendReason::Untracked => "untracked",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendDecision {
    pub send: bool,
    pub reason: SendReason,
    pub all_message_ids: Vec<MessageId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrackerStats {
    pub users: usize,
    pub in_flight: usize,
}

/// In-flight record as seen from outside (diagnostics).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InFlightView {
    pub message_id: MessageId,
    pub text: String,
    pub started_at: DateTime<Utc>,
    pub superseded: bool,
    pub superseded_by: Option<MessageId>,
}

#[derive(Debug)]
pub struct SupersessionTracker {
    users: Mutex<HashMap<ConversationKey, UserState>>,
    stale_after: Duration,
}

impl Default for SupersessionTracker {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

impl SupersessionTracker {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            users: Mutex::new(HashMap::new()),
            stale_after,
        }
    }

    fn users(&self) -> MutexGuard<'_, HashMap<ConversationKey, UserState>> {
        self.users.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking `message_id`; every older in-flight message of the user is
    /// marked superseded by it. Never blocks processing.
    pub fn register(&self, key: &ConversationKey, message_id: &MessageId, text: &str) -> Registration {
        self.register_at(key, message_id, text, &[], Utc::now())
    }

    /// Like [`register`](Self::register) for a batched event: `constituents` join
    /// the bubble so the eventual reply covers all of them.
    pub fn register_batch(
        &self,
        key: &ConversationKey,
        message_id: &MessageId,
        text: &str,
        constituents: &[MessageId],
    ) -> Registration {
        self.register_at(key, message_id, text, constituents, Utc::now())
    }

    fn register_at(
        &self,
        key: &ConversationKey,
        message_id: &MessageId,
        text: &str,
        constituents: &[MessageId],
        now: DateTime<Utc>,
    ) -> Registration {
        let mut users = self.users();
        let state = users.entry(key.clone()).or_default();

        let mut superseded = Vec::new();
        for (id, record) in state.in_flight.iter_mut() {
            if id != message_id && !record.superseded {
                record.superseded = true;
                record.superseded_by = Some(message_id.clone());
                superseded.push(id.clone());
            }
        }
        superseded.sort();

        state.in_flight.insert(
            message_id.clone(),
            InFlightRecord {
                text: text.to_string(),
                started_at: now,
                superseded: false,
                superseded_by: None,
            },
        );
        state.latest = Some(message_id.clone());
        for id in constituents {
            state.push_bubble(id);
        }
        state.push_bubble(message_id);

        if !superseded.is_empty() {
            debug!(
                user = %key,
                message_id = %message_id,
                superseded = superseded.len(),
                "newer message superseded in-flight messages"
            );
        }

        Registration {
            all_message_ids: state.bubble.clone(),
            superseded,
        }
    }

    /// Whether a reply for `message_id` should still be emitted. Read-only.
    pub fn should_send(&self, key: &ConversationKey, message_id: &MessageId) -> SendDecision {
        let users = self.users();
        let Some(state) = users.get(key) else {
            return SendDecision {
                send: true,
                reason: SendReason::Untracked,
                all_message_ids: vec![message_id.clone()],
            };
        };

        let all_message_ids = state.bubble.clone();

        if let Some(record) = state.in_flight.get(message_id) {
            if record.superseded {
                return SendDecision {
                    send: false,
                    reason: SendReason::Superseded {
                        by: record.superseded_by.clone(),
                    },
                    all_message_ids,
                };
            }
        }

        match &state.latest {
            Some(latest) if latest == message_id => SendDecision {
                send: true,
                reason: SendReason::LatestMessage,
                all_message_ids,
            },
            latest => SendDecision {
                send: false,
                reason: SendReason::NewerMessage {
                    latest: latest.clone(),
                },
                all_message_ids,
            },
        }
    }

    /// Stop tracking `message_id`. Idempotent; returns whether a record was
    /// removed. When the user's last record goes, the whole cycle is discarded.
    pub fn complete(&self, key: &ConversationKey, message_id: &MessageId) -> bool {
        let mut users = self.users();
        let Some(state) = users.get_mut(key) else {
            return false;
        };

        let removed = state.in_flight.remove(message_id).is_some();
        if state.latest.as_ref() == Some(message_id) {
            state.latest = None;
        }
        if state.in_flight.is_empty() {
            users.remove(key);
        }
        removed
    }

    /// Drop records older than the staleness threshold (a handler that crashed
    /// before `complete`). Returns how many records were removed.
    pub fn sweep_stale(&self) -> usize {
        self.sweep_stale_at(Utc::now())
    }

    pub fn sweep_stale_at(&self, now: DateTime<Utc>) -> usize {
        let threshold = chrono::Duration::from_std(self.stale_after).unwrap_or_else(|_| chrono::Duration::weeks(52));
        let mut users = self.users();
        let mut removed = 0;

        users.retain(|_, state| {
            let before = state.in_flight.len();
            state
                .in_flight
                .retain(|_, record| now.signed_duration_since(record.started_at) < threshold);
            removed += before - state.in_flight.len();

            if let Some(latest) = &state.latest {
                if !state.in_flight.contains_key(latest) {
                    state.latest = None;
                }
            }
            !state.in_flight.is_empty()
        });

        removed
    }

    pub fn stats(&self) -> TrackerStats {
        let users = self.users();
        TrackerStats {
            users: users.len(),
            in_flight: users.values().map(|s| s.in_flight.len()).sum(),
        }
    }

    pub fn in_flight(&self, key: &ConversationKey) -> Vec<InFlightView> {
        let users = self.users();
        let mut records: Vec<InFlightView> = users
            .get(key)
            .map(|state| {
                state
                    .in_flight
                    .iter()
                    .map(|(id, r)| InFlightView {
                        message_id: id.clone(),
                        text: r.text.clone(),
                        started_at: r.started_at,
                        superseded: r.superseded,
                        superseded_by: r.superseded_by.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        records.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        records
    }

    /// Spawn the periodic staleness sweep.
    pub fn spawn_sweeper(self: Arc<Self>, every: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tick.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        let removed = self.sweep_stale();
                        if removed > 0 {
                            info!(removed, "swept stale in-flight records");
                        }
                    }
                }
            }
        })
    }
}

/// Handler-side helper for the supersession contract.
///
/// Registers on creation, answers `should_send` for its message, and completes
/// the message when dropped, so early returns and errors never leak a record.
#[derive(Debug)]
pub struct BubbleGuard {
    tracker: Arc<SupersessionTracker>,
    key: ConversationKey,
    message_id: MessageId,
    registration: Registration,
    completed: bool,
}

impl BubbleGuard {
    pub fn register(tracker: Arc<SupersessionTracker>, event: &InboundEvent) -> Self {
        let key = event.conversation_key();
        let registration = if event.batched_message_ids.is_empty() {
            tracker.register(&key, &event.id, &event.text)
        } else {
            tracker.register_batch(&key, &event.id, &event.text, &event.batched_message_ids)
        };

        Self {
            tracker,
            key,
            message_id: event.id.clone(),
            registration,
            completed: false,
        }
    }

    pub fn registration(&self) -> &Registration {
        &self.registration
    }

    pub fn should_send(&self) -> SendDecision {
        self.tracker.should_send(&self.key, &self.message_id)
    }

    pub fn complete(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if !self.completed {
            self.completed = true;
            self.tracker.complete(&self.key, &self.message_id);
        }
    }
}

impl Drop for BubbleGuard {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatrelay_core::{TenantId, UserId};
    use proptest::prelude::*;

    fn key(user: &str) -> ConversationKey {
        ConversationKey::new(Some(TenantId::new("acme")), UserId::new(user))
    }

    fn id(s: &str) -> MessageId {
        MessageId::new(s)
    }

    #[test]
    fn newer_registration_supersedes_older() {
        let tracker = SupersessionTracker::default();
        let k = key("u-1");

        tracker.register(&k, &id("m-1"), "hi");
        let reg = tracker.register(&k, &id("m-2"), "are you there?");

        assert_eq!(reg.superseded, vec![id("m-1")]);
        assert_eq!(reg.all_message_ids, vec![id("m-1"), id("m-2")]);

        let first = tracker.should_send(&k, &id("m-1"));
        assert!(!first.send);
        assert_eq!(first.reason, SendReason::Superseded { by: Some(id("m-2")) });

        let second = tracker.should_send(&k, &id("m-2"));
        assert!(second.send);
        assert_eq!(second.reason, SendReason::LatestMessage);
        assert_eq!(second.all_message_ids, vec![id("m-1"), id("m-2")]);
    }

    #[test]
    fn double_check_catches_registration_in_between() {
        let tracker = SupersessionTracker::default();
        let k = key("u-1");

        tracker.register(&k, &id("m-1"), "a");
        assert!(tracker.should_send(&k, &id("m-1")).send);
        assert!(tracker.should_send(&k, &id("m-1")).send);

        tracker.register(&k, &id("m-2"), "b");
        assert!(!tracker.should_send(&k, &id("m-1")).send);
    }

    #[test]
    fn users_and_tenants_are_isolated() {
        let tracker = SupersessionTracker::default();
        let a = key("u-1");
        let b = ConversationKey::new(Some(TenantId::new("other")), UserId::new("u-1"));

        tracker.register(&a, &id("m-1"), "a");
        tracker.register(&b, &id("m-2"), "b");

        assert!(tracker.should_send(&a, &id("m-1")).send);
        assert!(tracker.should_send(&b, &id("m-2")).send);
        assert_eq!(tracker.stats(), TrackerStats { users: 2, in_flight: 2 });
    }

    #[test]
    fn complete_is_idempotent_and_resets_the_cycle() {
        let tracker = SupersessionTracker::default();
        let k = key("u-1");

        tracker.register(&k, &id("m-1"), "a");
        tracker.register(&k, &id("m-2"), "b");

        assert!(tracker.complete(&k, &id("m-2")));
        assert!(!tracker.complete(&k, &id("m-2")));
        // the superseded one is still running and still may not reply
        assert!(!tracker.should_send(&k, &id("m-1")).send);

        assert!(tracker.complete(&k, &id("m-1")));
        assert!(!tracker.complete(&k, &id("m-1")));
        assert_eq!(tracker.stats(), TrackerStats::default());

        let reg = tracker.register(&k, &id("m-3"), "c");
        assert_eq!(reg.all_message_ids, vec![id("m-3")]);
    }

    #[test]
    fn untracked_messages_may_reply() {
        let tracker = SupersessionTracker::default();
        let decision = tracker.should_send(&key("u-1"), &id("m-9"));
        assert!(decision.send);
        assert_eq!(decision.reason, SendReason::Untracked);
    }

    #[test]
    fn batch_registration_carries_constituents() {
        let tracker = SupersessionTracker::default();
        let k = key("u-1");
        let reg = tracker.register_batch(&k, &id("m-3"), "a and b", &[id("m-1"), id("m-2"), id("m-3")]);
        assert_eq!(reg.all_message_ids, vec![id("m-1"), id("m-2"), id("m-3")]);
    }

    #[test]
    fn sweep_removes_only_stale_records() {
        let tracker = SupersessionTracker::new(Duration::from_secs(300));
        let k = key("u-1");
        let start = Utc::now();

        tracker.register_at(&k, &id("m-1"), "old", &[], start);
        tracker.register_at(&k, &id("m-2"), "new", &[], start + chrono::Duration::seconds(200));

        let removed = tracker.sweep_stale_at(start + chrono::Duration::seconds(360));
        assert_eq!(removed, 1);
        assert_eq!(tracker.in_flight(&k).len(), 1);
        assert!(tracker.should_send(&k, &id("m-2")).send);

        let removed = tracker.sweep_stale_at(start + chrono::Duration::seconds(600));
        assert_eq!(removed, 1);
        assert_eq!(tracker.stats(), TrackerStats::default());
    }

    #[test]
    fn guard_completes_on_drop() {
        let tracker = Arc::new(SupersessionTracker::default());
        let event = InboundEvent::new("m-1", "u-1", None, "hi", Utc::now());
        {
            let guard = BubbleGuard::register(tracker.clone(), &event);
            assert!(guard.should_send().send);
            assert_eq!(tracker.stats().in_flight, 1);
        }
        assert_eq!(tracker.stats().in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_drops_stale_records_until_shutdown() {
        let tracker = Arc::new(SupersessionTracker::new(Duration::from_secs(300)));
        let crashed = key("u-1");
        let active = key("u-2");
        let long_ago = Utc::now() - chrono::Duration::minutes(10);

        tracker.register_at(&crashed, &id("m-1"), "hi", &[], long_ago);
        tracker.register(&active, &id("m-2"), "hello");

        let shutdown = CancellationToken::new();
        let sweeper = tracker.clone().spawn_sweeper(Duration::from_secs(60), shutdown.clone());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(tracker.in_flight(&crashed).is_empty());
        assert_eq!(tracker.in_flight(&active).len(), 1);
        assert_eq!(tracker.stats(), TrackerStats { users: 1, in_flight: 1 });

        shutdown.cancel();
        sweeper.await.unwrap();

        tracker.register_at(&crashed, &id("m-3"), "again", &[], long_ago);
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(tracker.in_flight(&crashed).len(), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: for a burst of N messages whose handlers finish in any
        /// order, exactly one passes the post-handler check, and it is the last
        /// one registered.
        #[test]
        fn exactly_one_reply_for_the_last_message(
            order in (1usize..12).prop_flat_map(|n| Just((0..n).collect::<Vec<_>>()).prop_shuffle()),
        ) {
            let tracker = SupersessionTracker::default();
            let k = key("u-1");
            let n = order.len();

            for i in 0..n {
                tracker.register(&k, &id(&format!("m-{i}")), "x");
            }

            let mut replied = Vec::new();
            for i in order {
                let mid = id(&format!("m-{i}"));
                if tracker.should_send(&k, &mid).send {
                    replied.push(i);
                }
                tracker.complete(&k, &mid);
            }

            prop_assert_eq!(replied, vec![n - 1]);
            prop_assert_eq!(tracker.stats(), TrackerStats::default());
        }
    }
}
