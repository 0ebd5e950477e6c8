//! Stale session sweeper background task.
//!
//! Sessions left `calling` or `connected` by a client that crashed or lost
//! its connection never receive a `hangup`. The sweeper ends every
//! non-ended session created more than `ttl` ago so a booking does not stay
//! "in a call" forever.
//!
//! # Graceful Shutdown
//!
//! The task completes its current iteration and exits when the cancellation
//! token is triggered.

use crate::config::timer_period;
use crate::observability::metrics;
use crate::registry::CallRegistry;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Sweeper settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweeperConfig {
    /// Age after which a non-ended session is considered abandoned.
    pub ttl: Duration,
    pub interval: Duration,
}

/// Run the sweeper loop until `cancel_token` fires.
///
/// Callers should chain `.instrument(tracing::info_span!(...))` on the
/// returned future.
pub async fn start_stale_session_sweeper(
    registry: CallRegistry,
    config: SweeperConfig,
    cancel_token: CancellationToken,
) {
    info!(
        target: "signaling.sweeper",
        ttl_seconds = config.ttl.as_secs(),
        interval_seconds = config.interval.as_secs(),
        "Stale session sweeper starting"
    );

    let mut interval = tokio::time::interval(timer_period(config.interval));

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match registry.end_stale_sessions(config.ttl).await {
                    Ok(count) => {
                        metrics::record_sessions_swept(count);
                        if count > 0 {
                            warn!(
                                target: "signaling.sweeper",
                                swept = count,
                                "Ended stale call sessions"
                            );
                        }
                    }
                    Err(e) => {
                        error!(
                            target: "signaling.sweeper",
                            error = %e,
                            "Failed to sweep stale call sessions"
                        );
                    }
                }
            }
            () = cancel_token.cancelled() => {
                info!(
                    target: "signaling.sweeper",
                    "Stale session sweeper received shutdown signal, exiting"
                );
                break;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::{CallSession, CallStatus};
    use crate::store::MemorySessionStore;
    use chrono::Utc;
    use common::types::Role;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_sweeper_ends_old_sessions_and_stops_on_cancel() {
        let mut old = CallSession::new("booking-old", Role::Admin);
        old.created_at = Utc::now() - chrono::Duration::hours(3);
        let fresh = CallSession::new("booking-fresh", Role::Admin);

        let store = MemorySessionStore::new()
            .with_session(old.clone())
            .with_session(fresh.clone());
        let registry = CallRegistry::new(Arc::new(store.clone()));
        let cancel_token = CancellationToken::new();

        let task = tokio::spawn(start_stale_session_sweeper(
            registry,
            SweeperConfig {
                ttl: Duration::from_secs(3600),
                interval: Duration::from_millis(20),
            },
            cancel_token.clone(),
        ));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while store.status_of(old.id) != Some(CallStatus::Ended) {
            assert!(tokio::time::Instant::now() < deadline, "sweeper never ran");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.status_of(fresh.id), Some(CallStatus::Calling));

        cancel_token.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_sweeper_survives_store_errors() {
        let store = MemorySessionStore::new();
        store.set_fail_writes(true);
        let registry = CallRegistry::new(Arc::new(store));
        let cancel_token = CancellationToken::new();

        let task = tokio::spawn(start_stale_session_sweeper(
            registry,
            SweeperConfig {
                ttl: Duration::from_secs(60),
                interval: Duration::from_millis(10),
            },
            cancel_token.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());

        cancel_token.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
