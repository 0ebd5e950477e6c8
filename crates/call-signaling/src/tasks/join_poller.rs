//! Responder-side discovery of an active call session.
//!
//! Until a session is found the poller queries the registry every
//! `interval`. When a push feed is supplied, a notification for the booking
//! wins if it arrives first. Either way `on_found` runs exactly once and the
//! task stops.

use crate::config::timer_period;
use crate::models::CallSession;
use crate::observability::metrics;
use crate::registry::CallRegistry;
use crate::store::SessionFeed;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

/// Default registry poll interval in seconds.
pub const DEFAULT_JOIN_POLL_INTERVAL_SECONDS: u64 = 3;

/// Handle to a running join poller.
#[derive(Debug)]
pub struct JoinPollerHandle {
    cancel_token: CancellationToken,
    task: JoinHandle<Option<CallSession>>,
}

impl JoinPollerHandle {
    /// Stop polling. `on_found` will not run afterwards.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the poller to stop. Returns the session it found, or `None`
    /// if it was cancelled first.
    pub async fn wait(self) -> Option<CallSession> {
        self.task.await.ok().flatten()
    }
}

/// Spawn a join poller for `booking_id`.
pub fn spawn_join_poller<F>(
    registry: CallRegistry,
    booking_id: String,
    interval: Duration,
    push_feed: Option<SessionFeed>,
    on_found: F,
) -> JoinPollerHandle
where
    F: FnOnce(CallSession) + Send + 'static,
{
    let cancel_token = CancellationToken::new();
    let span = tracing::info_span!("signaling.poller", booking_id = %booking_id);
    let task = tokio::spawn(
        run_join_poller(
            registry,
            booking_id,
            interval,
            push_feed,
            cancel_token.clone(),
            on_found,
        )
        .instrument(span),
    );

    JoinPollerHandle { cancel_token, task }
}

async fn run_join_poller<F>(
    registry: CallRegistry,
    booking_id: String,
    interval: Duration,
    mut push_feed: Option<SessionFeed>,
    cancel_token: CancellationToken,
    on_found: F,
) -> Option<CallSession>
where
    F: FnOnce(CallSession) + Send + 'static,
{
    let interval = timer_period(interval);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    debug!(
        target: "signaling.poller",
        booking_id = %booking_id,
        interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
        push = push_feed.is_some(),
        "Join poller started"
    );

    let (session, source) = loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                debug!(target: "signaling.poller", booking_id = %booking_id, "Join poller cancelled");
                return None;
            }

            pushed = next_pushed(&mut push_feed) => {
                match pushed {
                    Some(session) if session.booking_id == booking_id && session.is_active() => {
                        break (session, "push");
                    }
                    Some(_) => {}
                    None => {
                        warn!(
                            target: "signaling.poller",
                            booking_id = %booking_id,
                            "Session push feed closed, polling only"
                        );
                        push_feed = None;
                    }
                }
            }

            _ = ticker.tick() => {
                match registry.find_active_session(&booking_id).await {
                    Ok(Some(session)) => break (session, "poll"),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(
                            target: "signaling.poller",
                            booking_id = %booking_id,
                            error = %e,
                            "Registry poll failed"
                        );
                    }
                }
            }
        }
    };

    if let Some(feed) = push_feed.take() {
        feed.close();
    }

    info!(
        target: "signaling.poller",
        booking_id = %booking_id,
        call_id = %session.id,
        source,
        "Active call session found"
    );
    metrics::record_join_discovery(source);
    on_found(session.clone());
    Some(session)
}

/// Next session from the push feed; pends forever when there is none.
async fn next_pushed(feed: &mut Option<SessionFeed>) -> Option<CallSession> {
    match feed {
        Some(feed) => feed.recv().await,
        None => std::future::pending().await,
    }
}
