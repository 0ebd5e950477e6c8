//! In-process session and signal stores.
//!
//! Both stores keep their rows behind an `Arc<Mutex<_>>` so clones share
//! state: hand one clone to the engine and keep another in the test to
//! inspect rows or inject faults.
//!
//! Push notifications are delivered with `try_send`; a full subscriber
//! buffer drops the notification (logged), matching the best-effort
//! contract of a real change feed.

use super::{SessionFeed, SessionStore, SignalFeed, SignalStore, StoreError, DEFAULT_FEED_BUFFER};
use crate::models::{CallSession, CallStatus, NewSignal, Signal};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::CallId;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::Feed;

/// A registered push subscriber.
#[derive(Debug)]
struct Subscriber<K, T> {
    key: K,
    sender: mpsc::Sender<T>,
    cancel_token: CancellationToken,
}

impl<K: PartialEq, T: Clone> Subscriber<K, T> {
    fn is_live(&self) -> bool {
        !self.cancel_token.is_cancelled() && !self.sender.is_closed()
    }

    fn push(&self, item: &T) {
        if let Err(e) = self.sender.try_send(item.clone()) {
            warn!(
                target: "signaling.store",
                error = %e,
                "Subscriber buffer full, notification dropped"
            );
        }
    }
}

/// Delivery faults applied to every subscriber of a store.
#[derive(Debug, Default, Clone, Copy)]
struct NotificationFaults {
    drop: bool,
    duplicate: bool,
}

fn notify<K: PartialEq, T: Clone>(
    subscribers: &mut Vec<Subscriber<K, T>>,
    key: &K,
    item: &T,
    faults: NotificationFaults,
) {
    subscribers.retain(Subscriber::is_live);
    if faults.drop {
        debug!(target: "signaling.store", "Notification suppressed by fault injection");
        return;
    }
    for subscriber in subscribers.iter().filter(|s| &s.key == key) {
        subscriber.push(item);
        if faults.duplicate {
            subscriber.push(item);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Signals
// ============================================================================

#[derive(Debug)]
struct SignalInner {
    signals: Vec<Signal>,
    next_id: i64,
    last_created_at: Option<DateTime<Utc>>,
    subscribers: Vec<Subscriber<CallId, Signal>>,
    feed_buffer: usize,
    fail_inserts: bool,
    fail_queries: bool,
    faults: NotificationFaults,
}

impl Default for SignalInner {
    fn default() -> Self {
        Self {
            signals: Vec::new(),
            next_id: 1,
            last_created_at: None,
            subscribers: Vec::new(),
            feed_buffer: DEFAULT_FEED_BUFFER,
            fail_inserts: false,
            fail_queries: false,
            faults: NotificationFaults::default(),
        }
    }
}

/// In-memory append-only signal log.
#[derive(Debug, Clone, Default)]
pub struct MemorySignalStore {
    inner: Arc<Mutex<SignalInner>>,
}

impl MemorySignalStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different buffer size for feeds created after this call.
    #[must_use]
    pub fn with_feed_buffer(self, feed_buffer: usize) -> Self {
        lock(&self.inner).feed_buffer = feed_buffer.max(1);
        self
    }

    /// Make every subsequent insert fail with `StoreError::Unavailable`.
    pub fn set_fail_inserts(&self, fail: bool) {
        lock(&self.inner).fail_inserts = fail;
    }

    /// Make every subsequent query fail with `StoreError::Unavailable`.
    pub fn set_fail_queries(&self, fail: bool) {
        lock(&self.inner).fail_queries = fail;
    }

    /// Stop pushing inserts to subscribers (rows are still stored).
    pub fn set_drop_notifications(&self, drop: bool) {
        lock(&self.inner).faults.drop = drop;
    }

    /// Push every insert to subscribers twice.
    pub fn set_duplicate_notifications(&self, duplicate: bool) {
        lock(&self.inner).faults.duplicate = duplicate;
    }

    /// Snapshot of the signals stored for a call, in insertion order.
    #[must_use]
    pub fn signals_for(&self, call_id: CallId) -> Vec<Signal> {
        lock(&self.inner)
            .signals
            .iter()
            .filter(|s| s.call_id == call_id)
            .cloned()
            .collect()
    }

    /// Number of live subscriptions for a call.
    #[must_use]
    pub fn subscriber_count(&self, call_id: CallId) -> usize {
        let mut inner = lock(&self.inner);
        inner.subscribers.retain(Subscriber::is_live);
        inner
            .subscribers
            .iter()
            .filter(|s| s.key == call_id)
            .count()
    }
}

#[async_trait]
impl SignalStore for MemorySignalStore {
    async fn insert(&self, new_signal: NewSignal) -> Result<Signal, StoreError> {
        let mut inner = lock(&self.inner);
        if inner.fail_inserts {
            return Err(StoreError::Unavailable("insert rejected".to_string()));
        }

        // Never let the clock run backwards relative to the log.
        let now = Utc::now();
        let created_at = match inner.last_created_at {
            Some(last) if last > now => last,
            _ => now,
        };
        let signal = Signal {
            id: inner.next_id,
            call_id: new_signal.call_id,
            sender_role: new_signal.sender_role,
            kind: new_signal.kind,
            payload: new_signal.payload,
            created_at,
        };
        inner.next_id += 1;
        inner.last_created_at = Some(created_at);
        inner.signals.push(signal.clone());

        let faults = inner.faults;
        notify(&mut inner.subscribers, &signal.call_id, &signal, faults);

        Ok(signal)
    }

    async fn query_by_call(&self, call_id: CallId) -> Result<Vec<Signal>, StoreError> {
        let inner = lock(&self.inner);
        if inner.fail_queries {
            return Err(StoreError::Unavailable("query rejected".to_string()));
        }
        let mut signals: Vec<Signal> = inner
            .signals
            .iter()
            .filter(|s| s.call_id == call_id)
            .cloned()
            .collect();
        Signal::sort_for_delivery(&mut signals);
        Ok(signals)
    }

    async fn subscribe_inserts(&self, call_id: CallId) -> Result<SignalFeed, StoreError> {
        let mut inner = lock(&self.inner);
        if inner.fail_queries {
            return Err(StoreError::Unavailable("subscribe rejected".to_string()));
        }
        let (sender, receiver) = mpsc::channel(inner.feed_buffer);
        let cancel_token = CancellationToken::new();
        inner.subscribers.push(Subscriber {
            key: call_id,
            sender,
            cancel_token: cancel_token.clone(),
        });
        Ok(Feed::new(receiver, cancel_token))
    }
}

// ============================================================================
// Sessions
// ============================================================================

#[derive(Debug)]
struct SessionInner {
    sessions: Vec<CallSession>,
    subscribers: Vec<Subscriber<String, CallSession>>,
    feed_buffer: usize,
    fail_writes: bool,
    fail_reads: bool,
    faults: NotificationFaults,
}

impl Default for SessionInner {
    fn default() -> Self {
        Self {
            sessions: Vec::new(),
            subscribers: Vec::new(),
            feed_buffer: DEFAULT_FEED_BUFFER,
            fail_writes: false,
            fail_reads: false,
            faults: NotificationFaults::default(),
        }
    }
}

/// In-memory call session table.
#[derive(Debug, Clone, Default)]
pub struct MemorySessionStore {
    inner: Arc<Mutex<SessionInner>>,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a session row directly, bypassing supersession.
    #[must_use]
    pub fn with_session(self, session: CallSession) -> Self {
        lock(&self.inner).sessions.push(session);
        self
    }

    /// Make inserts and status updates fail with `StoreError::Unavailable`.
    pub fn set_fail_writes(&self, fail: bool) {
        lock(&self.inner).fail_writes = fail;
    }

    /// Make lookups fail with `StoreError::Unavailable`.
    pub fn set_fail_reads(&self, fail: bool) {
        lock(&self.inner).fail_reads = fail;
    }

    /// Stop pushing new sessions to subscribers.
    pub fn set_drop_notifications(&self, drop: bool) {
        lock(&self.inner).faults.drop = drop;
    }

    /// Snapshot of every stored session, in insertion order.
    #[must_use]
    pub fn sessions(&self) -> Vec<CallSession> {
        lock(&self.inner).sessions.clone()
    }

    /// Current status of a session, if it exists.
    #[must_use]
    pub fn status_of(&self, call_id: CallId) -> Option<CallStatus> {
        lock(&self.inner)
            .sessions
            .iter()
            .find(|s| s.id == call_id)
            .map(|s| s.status)
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert(&self, session: &CallSession) -> Result<Vec<CallId>, StoreError> {
        let mut inner = lock(&self.inner);
        if inner.fail_writes {
            return Err(StoreError::Unavailable("insert rejected".to_string()));
        }
        if inner.sessions.iter().any(|s| s.id == session.id) {
            return Err(StoreError::Conflict(format!(
                "session {} already exists",
                session.id
            )));
        }

        let mut superseded = Vec::new();
        for existing in inner
            .sessions
            .iter_mut()
            .filter(|s| s.booking_id == session.booking_id && s.is_active())
        {
            existing.status = CallStatus::Ended;
            superseded.push(existing.id);
        }

        inner.sessions.push(session.clone());

        let faults = inner.faults;
        notify(
            &mut inner.subscribers,
            &session.booking_id,
            session,
            faults,
        );

        Ok(superseded)
    }

    async fn query_latest_active(
        &self,
        booking_id: &str,
    ) -> Result<Option<CallSession>, StoreError> {
        let inner = lock(&self.inner);
        if inner.fail_reads {
            return Err(StoreError::Unavailable("query rejected".to_string()));
        }
        // max_by_key keeps the last of equal keys, i.e. the latest insert.
        Ok(inner
            .sessions
            .iter()
            .filter(|s| s.booking_id == booking_id && s.is_active())
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn get(&self, call_id: CallId) -> Result<Option<CallSession>, StoreError> {
        let inner = lock(&self.inner);
        if inner.fail_reads {
            return Err(StoreError::Unavailable("query rejected".to_string()));
        }
        Ok(inner.sessions.iter().find(|s| s.id == call_id).cloned())
    }

    async fn update_status(&self, call_id: CallId, status: CallStatus) -> Result<bool, StoreError> {
        let mut inner = lock(&self.inner);
        if inner.fail_writes {
            return Err(StoreError::Unavailable("update rejected".to_string()));
        }
        match inner.sessions.iter_mut().find(|s| s.id == call_id) {
            Some(session) if session.status.can_transition_to(status) => {
                session.status = status;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn end_stale(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = lock(&self.inner);
        if inner.fail_writes {
            return Err(StoreError::Unavailable("update rejected".to_string()));
        }
        let mut ended = 0u64;
        for session in inner
            .sessions
            .iter_mut()
            .filter(|s| s.is_active() && s.created_at < cutoff)
        {
            session.status = CallStatus::Ended;
            ended += 1;
        }
        Ok(ended)
    }

    async fn subscribe_new_sessions(&self, booking_id: &str) -> Result<SessionFeed, StoreError> {
        let mut inner = lock(&self.inner);
        if inner.fail_reads {
            return Err(StoreError::Unavailable("subscribe rejected".to_string()));
        }
        let (sender, receiver) = mpsc::channel(inner.feed_buffer);
        let cancel_token = CancellationToken::new();
        inner.subscribers.push(Subscriber {
            key: booking_id.to_string(),
            sender,
            cancel_token: cancel_token.clone(),
        });
        Ok(Feed::new(receiver, cancel_token))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::SignalKind;
    use common::types::Role;
    use serde_json::json;

    fn ice(call_id: CallId) -> NewSignal {
        NewSignal {
            call_id,
            sender_role: Role::Admin,
            kind: SignalKind::Ice,
            payload: json!({"candidate": "c", "sdpMid": "0", "sdpMLineIndex": 0}),
        }
    }

    #[tokio::test]
    async fn test_signal_ids_increase_with_insertion() {
        let store = MemorySignalStore::new();
        let call_id = CallId::new();

        let first = store.insert(ice(call_id)).await.unwrap();
        let second = store.insert(ice(call_id)).await.unwrap();

        assert!(second.id > first.id);
        assert!(second.created_at >= first.created_at);
    }

    #[tokio::test]
    async fn test_query_by_call_filters_other_calls() {
        let store = MemorySignalStore::new();
        let call_a = CallId::new();
        let call_b = CallId::new();

        store.insert(ice(call_a)).await.unwrap();
        store.insert(ice(call_b)).await.unwrap();
        store.insert(ice(call_a)).await.unwrap();

        let signals = store.query_by_call(call_a).await.unwrap();
        assert_eq!(signals.len(), 2);
        assert!(signals.iter().all(|s| s.call_id == call_a));
    }

    #[tokio::test]
    async fn test_subscriber_receives_only_its_call() {
        let store = MemorySignalStore::new();
        let call_a = CallId::new();
        let call_b = CallId::new();
        let mut feed = store.subscribe_inserts(call_a).await.unwrap();

        store.insert(ice(call_b)).await.unwrap();
        let inserted = store.insert(ice(call_a)).await.unwrap();

        assert_eq!(feed.recv().await.unwrap(), inserted);
    }

    #[tokio::test]
    async fn test_dropped_feed_unregisters() {
        let store = MemorySignalStore::new();
        let call_id = CallId::new();

        let feed = store.subscribe_inserts(call_id).await.unwrap();
        assert_eq!(store.subscriber_count(call_id), 1);

        drop(feed);
        assert_eq!(store.subscriber_count(call_id), 0);
    }

    #[tokio::test]
    async fn test_fault_injection_drop_and_duplicate() {
        let store = MemorySignalStore::new();
        let call_id = CallId::new();
        let mut feed = store.subscribe_inserts(call_id).await.unwrap();

        store.set_drop_notifications(true);
        store.insert(ice(call_id)).await.unwrap();
        store.set_drop_notifications(false);

        store.set_duplicate_notifications(true);
        let pushed = store.insert(ice(call_id)).await.unwrap();

        assert_eq!(feed.recv().await.unwrap().id, pushed.id);
        assert_eq!(feed.recv().await.unwrap().id, pushed.id);
        assert_eq!(store.query_by_call(call_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_insert_stores_nothing() {
        let store = MemorySignalStore::new();
        let call_id = CallId::new();

        store.set_fail_inserts(true);
        assert!(matches!(
            store.insert(ice(call_id)).await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.signals_for(call_id).is_empty());
    }

    #[tokio::test]
    async fn test_session_insert_supersedes_active_sessions() {
        let store = MemorySessionStore::new();
        let first = CallSession::new("booking-42", Role::Admin);
        let second = CallSession::new("booking-42", Role::Client);
        let other = CallSession::new("booking-7", Role::Admin);

        assert!(store.insert(&first).await.unwrap().is_empty());
        store.insert(&other).await.unwrap();
        let superseded = store.insert(&second).await.unwrap();

        assert_eq!(superseded, vec![first.id]);
        assert_eq!(store.status_of(first.id), Some(CallStatus::Ended));
        assert_eq!(store.status_of(other.id), Some(CallStatus::Calling));

        let latest = store.query_latest_active("booking-42").await.unwrap();
        assert_eq!(latest.map(|s| s.id), Some(second.id));
    }

    #[tokio::test]
    async fn test_update_status_is_forward_only() {
        let store = MemorySessionStore::new();
        let session = CallSession::new("booking-42", Role::Admin);
        store.insert(&session).await.unwrap();

        assert!(store
            .update_status(session.id, CallStatus::Connected)
            .await
            .unwrap());
        assert!(store
            .update_status(session.id, CallStatus::Ended)
            .await
            .unwrap());
        assert!(!store
            .update_status(session.id, CallStatus::Connected)
            .await
            .unwrap());
        assert!(!store
            .update_status(CallId::new(), CallStatus::Ended)
            .await
            .unwrap());
        assert_eq!(store.status_of(session.id), Some(CallStatus::Ended));
    }

    #[tokio::test]
    async fn test_end_stale_only_touches_old_active_sessions() {
        let mut old = CallSession::new("booking-1", Role::Admin);
        old.created_at = Utc::now() - chrono::Duration::hours(3);
        let fresh = CallSession::new("booking-2", Role::Admin);
        let store = MemorySessionStore::new()
            .with_session(old.clone())
            .with_session(fresh.clone());

        let ended = store
            .end_stale(Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();

        assert_eq!(ended, 1);
        assert_eq!(store.status_of(old.id), Some(CallStatus::Ended));
        assert_eq!(store.status_of(fresh.id), Some(CallStatus::Calling));
    }

    #[tokio::test]
    async fn test_session_feed_keyed_by_booking() {
        let store = MemorySessionStore::new();
        let mut feed = store.subscribe_new_sessions("booking-42").await.unwrap();

        store
            .insert(&CallSession::new("booking-7", Role::Admin))
            .await
            .unwrap();
        let session = CallSession::new("booking-42", Role::Admin);
        store.insert(&session).await.unwrap();

        assert_eq!(feed.recv().await.unwrap().id, session.id);
    }
}
