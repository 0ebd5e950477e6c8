//! PostgreSQL session and signal stores.
//!
//! Schema lives in `migrations/`. Inserts on both tables fire a trigger that
//! publishes `{"key": ..., "id": ...}` on the `call_signals` or
//! `call_sessions` channel; subscriptions `LISTEN` on that channel, filter
//! by key, and fetch the full row by ID.
//!
//! # Security
//!
//! - All queries use parameterized statements
//! - Notification payloads carry identifiers only, never signal content

use super::{Feed, SessionFeed, SessionStore, SignalFeed, SignalStore, StoreError, DEFAULT_FEED_BUFFER};
use crate::models::{CallSession, CallStatus, NewSignal, Signal};
use crate::observability::metrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::{CallId, Role};
use serde::Deserialize;
use sqlx::postgres::{PgListener, PgRow};
use sqlx::{PgPool, Row};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

const SIGNALS_CHANNEL: &str = "call_signals";
const SESSIONS_CHANNEL: &str = "call_sessions";

/// Delay before retrying after the listener connection fails.
const LISTENER_RETRY_DELAY: Duration = Duration::from_secs(1);

const SIGNAL_COLUMNS: &str = "id, call_id, sender_role, kind, payload, created_at";
const SESSION_COLUMNS: &str = "id, booking_id, status, initiator_role, created_at";

/// Payload published by the insert triggers.
#[derive(Debug, Deserialize)]
struct ChangeNotification {
    key: String,
    id: String,
}

/// Run a store operation and record its duration and outcome.
async fn timed<T, F>(operation: &'static str, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    let start = Instant::now();
    let result = fut.await;
    let status = if result.is_ok() { "success" } else { "error" };
    metrics::record_store_operation(operation, status, start.elapsed());
    result
}

fn map_row_to_signal(row: &PgRow) -> Result<Signal, StoreError> {
    let decode = |e: sqlx::Error| StoreError::Serialization(e.to_string());

    let sender_role: String = row.try_get("sender_role").map_err(decode)?;
    let kind: String = row.try_get("kind").map_err(decode)?;

    Ok(Signal {
        id: row.try_get("id").map_err(decode)?,
        call_id: CallId(row.try_get("call_id").map_err(decode)?),
        sender_role: sender_role
            .parse::<Role>()
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        kind: kind.parse().map_err(StoreError::Serialization)?,
        payload: row.try_get("payload").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
    })
}

fn map_row_to_session(row: &PgRow) -> Result<CallSession, StoreError> {
    let decode = |e: sqlx::Error| StoreError::Serialization(e.to_string());

    let status: String = row.try_get("status").map_err(decode)?;
    let initiator_role: String = row.try_get("initiator_role").map_err(decode)?;

    Ok(CallSession {
        id: CallId(row.try_get("id").map_err(decode)?),
        booking_id: row.try_get("booking_id").map_err(decode)?,
        status: status.parse().map_err(StoreError::Serialization)?,
        initiator_role: initiator_role
            .parse::<Role>()
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        created_at: row.try_get("created_at").map_err(decode)?,
    })
}

/// Open a dedicated `LISTEN` connection and forward matching rows.
///
/// The listener is registered before this returns, so every insert that
/// commits afterwards is eligible for delivery.
async fn listen<T, F, Fut>(
    pool: &PgPool,
    channel: &'static str,
    key: String,
    buffer: usize,
    fetch: F,
) -> Result<Feed<T>, StoreError>
where
    T: Send + 'static,
    F: Fn(PgPool, String) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Option<T>, StoreError>> + Send + 'static,
{
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen(channel).await?;

    let (tx, rx) = mpsc::channel(buffer);
    let cancel_token = CancellationToken::new();
    let task_token = cancel_token.clone();
    let pool = pool.clone();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = task_token.cancelled() => {
                    debug!(target: "signaling.store", channel, key = %key, "Listener cancelled");
                    break;
                }
                notification = listener.recv() => {
                    let notification = match notification {
                        Ok(n) => n,
                        Err(e) => {
                            warn!(
                                target: "signaling.store",
                                channel,
                                error = %e,
                                "Listener connection error, notifications may be missed"
                            );
                            tokio::time::sleep(LISTENER_RETRY_DELAY).await;
                            continue;
                        }
                    };

                    let change: ChangeNotification = match serde_json::from_str(notification.payload()) {
                        Ok(change) => change,
                        Err(e) => {
                            warn!(target: "signaling.store", channel, error = %e, "Unparseable notification payload");
                            continue;
                        }
                    };
                    if change.key != key {
                        continue;
                    }

                    match fetch(pool.clone(), change.id).await {
                        Ok(Some(row)) => {
                            if tx.send(row).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(target: "signaling.store", channel, error = %e, "Failed to fetch notified row");
                        }
                    }
                }
            }
        }
    });

    Ok(Feed::new(rx, cancel_token))
}

// ============================================================================
// Signals
// ============================================================================

/// Signal log backed by the `call_signals` table.
#[derive(Debug, Clone)]
pub struct PgSignalStore {
    pool: PgPool,
    feed_buffer: usize,
}

impl PgSignalStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            feed_buffer: DEFAULT_FEED_BUFFER,
        }
    }

    #[must_use]
    pub fn with_feed_buffer(mut self, feed_buffer: usize) -> Self {
        self.feed_buffer = feed_buffer.max(1);
        self
    }
}

async fn fetch_signal(pool: PgPool, id: String) -> Result<Option<Signal>, StoreError> {
    let id: i64 = id
        .parse()
        .map_err(|e: std::num::ParseIntError| StoreError::Serialization(e.to_string()))?;
    let row = sqlx::query(&format!(
        "SELECT {SIGNAL_COLUMNS} FROM call_signals WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(&pool)
    .await?;
    row.as_ref().map(map_row_to_signal).transpose()
}

#[async_trait]
impl SignalStore for PgSignalStore {
    #[instrument(skip_all, name = "signaling.store.insert_signal", fields(call_id = %signal.call_id, kind = %signal.kind))]
    async fn insert(&self, signal: NewSignal) -> Result<Signal, StoreError> {
        timed("insert_signal", async {
            let row = sqlx::query(&format!(
                r#"
                INSERT INTO call_signals (call_id, sender_role, kind, payload)
                VALUES ($1, $2, $3, $4)
                RETURNING {SIGNAL_COLUMNS}
                "#
            ))
            .bind(signal.call_id.0)
            .bind(signal.sender_role.as_str())
            .bind(signal.kind.as_str())
            .bind(&signal.payload)
            .fetch_one(&self.pool)
            .await?;
            map_row_to_signal(&row)
        })
        .await
    }

    #[instrument(skip_all, name = "signaling.store.query_signals", fields(call_id = %call_id))]
    async fn query_by_call(&self, call_id: CallId) -> Result<Vec<Signal>, StoreError> {
        timed("query_signals", async {
            let rows = sqlx::query(&format!(
                r#"
                SELECT {SIGNAL_COLUMNS}
                FROM call_signals
                WHERE call_id = $1
                ORDER BY created_at ASC, id ASC
                "#
            ))
            .bind(call_id.0)
            .fetch_all(&self.pool)
            .await?;
            rows.iter().map(map_row_to_signal).collect()
        })
        .await
    }

    async fn subscribe_inserts(&self, call_id: CallId) -> Result<SignalFeed, StoreError> {
        listen(
            &self.pool,
            SIGNALS_CHANNEL,
            call_id.to_string(),
            self.feed_buffer,
            fetch_signal,
        )
        .await
    }
}

// ============================================================================
// Sessions
// ============================================================================

/// Session table backed by `call_sessions`.
#[derive(Debug, Clone)]
pub struct PgSessionStore {
    pool: PgPool,
    feed_buffer: usize,
}

impl PgSessionStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            feed_buffer: DEFAULT_FEED_BUFFER,
        }
    }

    #[must_use]
    pub fn with_feed_buffer(mut self, feed_buffer: usize) -> Self {
        self.feed_buffer = feed_buffer.max(1);
        self
    }
}

async fn fetch_session(pool: PgPool, id: String) -> Result<Option<CallSession>, StoreError> {
    let id = Uuid::parse_str(&id).map_err(|e| StoreError::Serialization(e.to_string()))?;
    let row = sqlx::query(&format!(
        "SELECT {SESSION_COLUMNS} FROM call_sessions WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(&pool)
    .await?;
    row.as_ref().map(map_row_to_session).transpose()
}

#[async_trait]
impl SessionStore for PgSessionStore {
    /// Ends earlier sessions and inserts the new one in a single transaction.
    /// The partial unique index on active bookings turns a lost race into
    /// `StoreError::Conflict`.
    #[instrument(skip_all, name = "signaling.store.insert_session", fields(call_id = %session.id))]
    async fn insert(&self, session: &CallSession) -> Result<Vec<CallId>, StoreError> {
        timed("insert_session", async {
            let mut tx = self.pool.begin().await?;

            let superseded: Vec<Uuid> = sqlx::query_scalar(
                r#"
                UPDATE call_sessions
                SET status = 'ended', updated_at = NOW()
                WHERE booking_id = $1 AND status <> 'ended'
                RETURNING id
                "#,
            )
            .bind(&session.booking_id)
            .fetch_all(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO call_sessions (id, booking_id, status, initiator_role, created_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(session.id.0)
            .bind(&session.booking_id)
            .bind(session.status.as_str())
            .bind(session.initiator_role.as_str())
            .bind(session.created_at)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;

            Ok::<_, StoreError>(superseded.into_iter().map(CallId).collect())
        })
        .await
    }

    #[instrument(skip_all, name = "signaling.store.latest_active")]
    async fn query_latest_active(
        &self,
        booking_id: &str,
    ) -> Result<Option<CallSession>, StoreError> {
        timed("latest_active_session", async {
            let row = sqlx::query(&format!(
                r#"
                SELECT {SESSION_COLUMNS}
                FROM call_sessions
                WHERE booking_id = $1 AND status <> 'ended'
                ORDER BY created_at DESC
                LIMIT 1
                "#
            ))
            .bind(booking_id)
            .fetch_optional(&self.pool)
            .await?;
            row.as_ref().map(map_row_to_session).transpose()
        })
        .await
    }

    async fn get(&self, call_id: CallId) -> Result<Option<CallSession>, StoreError> {
        timed("get_session", fetch_session(self.pool.clone(), call_id.to_string())).await
    }

    #[instrument(skip_all, name = "signaling.store.update_status", fields(call_id = %call_id, status = %status))]
    async fn update_status(&self, call_id: CallId, status: CallStatus) -> Result<bool, StoreError> {
        timed("update_session_status", async {
            // Only forward moves: anything -> ended, calling -> connected.
            let result = sqlx::query(
                r#"
                UPDATE call_sessions
                SET status = $2, updated_at = NOW()
                WHERE id = $1
                  AND status <> 'ended'
                  AND status <> $2
                  AND ($2 = 'ended' OR status = 'calling')
                "#,
            )
            .bind(call_id.0)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
            Ok::<_, StoreError>(result.rows_affected() > 0)
        })
        .await
    }

    #[instrument(skip_all, name = "signaling.store.end_stale")]
    async fn end_stale(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        timed("end_stale_sessions", async {
            let result = sqlx::query(
                r#"
                UPDATE call_sessions
                SET status = 'ended', updated_at = NOW()
                WHERE status <> 'ended' AND created_at < $1
                "#,
            )
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
            Ok::<_, StoreError>(result.rows_affected())
        })
        .await
    }

    async fn subscribe_new_sessions(&self, booking_id: &str) -> Result<SessionFeed, StoreError> {
        listen(
            &self.pool,
            SESSIONS_CHANNEL,
            booking_id.to_string(),
            self.feed_buffer,
            fetch_session,
        )
        .await
    }
}
