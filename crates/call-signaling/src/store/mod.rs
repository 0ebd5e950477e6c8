//! Storage collaborators for sessions and signals.
//!
//! The engine only depends on the two traits below. Two implementations
//! ship with the crate:
//!
//! - [`memory`] - in-process stores with fault injection (tests, local runs)
//! - [`postgres`] - `sqlx` stores with `LISTEN/NOTIFY` push feeds
//!
//! Push feeds are best-effort: an implementation may drop notifications
//! (full buffers, listener reconnects). Callers recover through replay and
//! polling, never by assuming every insert is pushed.

pub mod memory;
pub mod postgres;

use crate::models::{CallSession, CallStatus, NewSignal, Signal};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::CallId;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use memory::{MemorySessionStore, MemorySignalStore};
pub use postgres::{PgSessionStore, PgSignalStore};

/// Default buffer for push feed channels.
pub const DEFAULT_FEED_BUFFER: usize = 256;

/// Errors reported by store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Write rejected by a uniqueness constraint.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A stored row could not be decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Store is unreachable (or a fault was injected).
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                StoreError::Conflict(db_err.message().to_string())
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Unavailable(err.to_string())
            }
            _ => StoreError::Database(err.to_string()),
        }
    }
}

/// Live push feed of newly inserted rows.
///
/// Dropping the feed (or calling [`Feed::close`]) releases the underlying
/// listener.
#[derive(Debug)]
pub struct Feed<T> {
    receiver: mpsc::Receiver<T>,
    cancel_token: CancellationToken,
}

impl<T> Feed<T> {
    /// Wrap a receiver whose producer stops when `cancel_token` fires.
    #[must_use]
    pub fn new(receiver: mpsc::Receiver<T>, cancel_token: CancellationToken) -> Self {
        Self {
            receiver,
            cancel_token,
        }
    }

    /// Next pushed row, or `None` once the feed has closed.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    /// Release the underlying listener.
    pub fn close(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

impl<T> Drop for Feed<T> {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

pub type SignalFeed = Feed<Signal>;
pub type SessionFeed = Feed<CallSession>;

/// Append-only signal log.
#[async_trait]
pub trait SignalStore: Send + Sync {
    /// Append one signal; the store assigns `id` and `created_at`.
    async fn insert(&self, signal: NewSignal) -> Result<Signal, StoreError>;

    /// All signals of a call, ordered by `created_at` then `id`.
    async fn query_by_call(&self, call_id: CallId) -> Result<Vec<Signal>, StoreError>;

    /// Push feed of signals inserted for `call_id` after this call returns.
    async fn subscribe_inserts(&self, call_id: CallId) -> Result<SignalFeed, StoreError>;
}

/// Call session table.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new session, ending any other non-ended session of the same
    /// booking in the same write. Returns the IDs of the sessions ended.
    ///
    /// A concurrent insert for the same booking fails with
    /// `StoreError::Conflict`.
    async fn insert(&self, session: &CallSession) -> Result<Vec<CallId>, StoreError>;

    /// Most recently created non-ended session of the booking.
    async fn query_latest_active(&self, booking_id: &str)
        -> Result<Option<CallSession>, StoreError>;

    async fn get(&self, call_id: CallId) -> Result<Option<CallSession>, StoreError>;

    /// Move the session forward to `status`. Returns `false` (without error)
    /// when the session is missing or the move would not be forward.
    async fn update_status(&self, call_id: CallId, status: CallStatus) -> Result<bool, StoreError>;

    /// End every non-ended session created before `cutoff`.
    async fn end_stale(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Push feed of sessions created for `booking_id`.
    async fn subscribe_new_sessions(&self, booking_id: &str) -> Result<SessionFeed, StoreError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_feed_drop_cancels_producer() {
        let (tx, rx) = mpsc::channel::<u32>(4);
        let token = CancellationToken::new();
        let feed = Feed::new(rx, token.clone());

        tx.send(1).await.unwrap();
        drop(feed);

        assert!(token.is_cancelled());
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn test_feed_close_keeps_buffered_items() {
        let (tx, rx) = mpsc::channel::<u32>(4);
        let mut feed = Feed::new(rx, CancellationToken::new());

        tx.send(7).await.unwrap();
        feed.close();

        assert!(feed.is_closed());
        assert_eq!(feed.recv().await, Some(7));
    }
}
