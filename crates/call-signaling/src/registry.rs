//! Call session registry.
//!
//! One logical call per booking. Creating a session supersedes any session
//! of the same booking that is still active; status only moves forward.

use crate::errors::SignalingError;
use crate::models::{CallSession, CallStatus};
use crate::store::{SessionFeed, SessionStore, StoreError};
use chrono::Utc;
use common::types::{CallId, Role};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Result of registering a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedSession {
    pub session: CallSession,
    /// Earlier sessions of the same booking that were ended by this one.
    pub superseded: Vec<CallId>,
}

/// Registry of call sessions, backed by a [`SessionStore`].
#[derive(Clone)]
pub struct CallRegistry {
    store: Arc<dyn SessionStore>,
}

fn registry_error(operation: &str, err: &StoreError) -> SignalingError {
    SignalingError::Registry(format!("{operation}: {err}"))
}

impl CallRegistry {
    #[must_use]
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    /// Create a session in `calling` status for the booking.
    ///
    /// # Errors
    ///
    /// Returns `SignalingError::Registry` if the booking ID is empty or the
    /// store write fails.
    pub async fn create_session(
        &self,
        booking_id: &str,
        initiator_role: Role,
    ) -> Result<CreatedSession, SignalingError> {
        self.register_session(CallSession::new(booking_id, initiator_role))
            .await
    }

    /// Persist a session built by the caller.
    ///
    /// Used when the session ID must be known before the write (the
    /// initiator prepares media first, then registers).
    ///
    /// # Errors
    ///
    /// Returns `SignalingError::Registry` if the booking ID is empty or the
    /// store write fails, including a concurrent create for the same booking.
    #[instrument(skip_all, name = "signaling.registry.register", fields(call_id = %session.id))]
    pub async fn register_session(
        &self,
        mut session: CallSession,
    ) -> Result<CreatedSession, SignalingError> {
        if session.booking_id.trim().is_empty() {
            return Err(SignalingError::Registry("booking id is empty".to_string()));
        }
        session.status = CallStatus::Calling;

        let superseded = self.store.insert(&session).await.map_err(|e| {
            warn!(
                target: "signaling.registry",
                call_id = %session.id,
                error = %e,
                "Failed to create call session"
            );
            registry_error("create session", &e)
        })?;

        if !superseded.is_empty() {
            info!(
                target: "signaling.registry",
                call_id = %session.id,
                superseded = superseded.len(),
                "New session superseded active sessions for booking"
            );
        }
        info!(
            target: "signaling.registry",
            call_id = %session.id,
            initiator = %session.initiator_role,
            "Call session created"
        );

        Ok(CreatedSession {
            session,
            superseded,
        })
    }

    /// Most recently created non-ended session for the booking.
    ///
    /// # Errors
    ///
    /// Returns `SignalingError::Registry` if the store query fails.
    pub async fn find_active_session(
        &self,
        booking_id: &str,
    ) -> Result<Option<CallSession>, SignalingError> {
        self.store
            .query_latest_active(booking_id)
            .await
            .map_err(|e| registry_error("find active session", &e))
    }

    /// Look up a session by ID regardless of status.
    ///
    /// # Errors
    ///
    /// Returns `SignalingError::Registry` if the store query fails.
    pub async fn get_session(&self, call_id: CallId) -> Result<Option<CallSession>, SignalingError> {
        self.store
            .get(call_id)
            .await
            .map_err(|e| registry_error("get session", &e))
    }

    /// Move a `calling` session to `connected`.
    ///
    /// Returns `false` when the session was not in `calling` (already
    /// connected, ended, or missing).
    ///
    /// # Errors
    ///
    /// Returns `SignalingError::Registry` if the store write fails.
    pub async fn mark_connected(&self, call_id: CallId) -> Result<bool, SignalingError> {
        self.transition(call_id, CallStatus::Connected).await
    }

    /// End a session. Idempotent: ending an ended session returns `Ok(false)`.
    ///
    /// # Errors
    ///
    /// Returns `SignalingError::Registry` if the store write fails.
    pub async fn mark_ended(&self, call_id: CallId) -> Result<bool, SignalingError> {
        self.transition(call_id, CallStatus::Ended).await
    }

    async fn transition(&self, call_id: CallId, status: CallStatus) -> Result<bool, SignalingError> {
        let changed = self
            .store
            .update_status(call_id, status)
            .await
            .map_err(|e| registry_error("update status", &e))?;

        debug!(
            target: "signaling.registry",
            call_id = %call_id,
            status = %status,
            changed,
            "Session status update"
        );
        Ok(changed)
    }

    /// End every active session created more than `older_than` ago.
    ///
    /// # Errors
    ///
    /// Returns `SignalingError::Registry` if the store write fails, or
    /// `SignalingError::Internal` if `older_than` is out of range.
    pub async fn end_stale_sessions(&self, older_than: Duration) -> Result<u64, SignalingError> {
        let age = chrono::Duration::from_std(older_than)
            .map_err(|e| SignalingError::Internal(format!("invalid session ttl: {e}")))?;
        let cutoff = Utc::now() - age;

        self.store
            .end_stale(cutoff)
            .await
            .map_err(|e| registry_error("end stale sessions", &e))
    }

    /// Push feed of sessions created for the booking.
    ///
    /// # Errors
    ///
    /// Returns `SignalingError::Registry` if the subscription cannot be opened.
    pub async fn subscribe_new_sessions(
        &self,
        booking_id: &str,
    ) -> Result<SessionFeed, SignalingError> {
        self.store
            .subscribe_new_sessions(booking_id)
            .await
            .map_err(|e| registry_error("subscribe sessions", &e))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::MemorySessionStore;

    fn registry() -> (CallRegistry, MemorySessionStore) {
        let store = MemorySessionStore::new();
        (CallRegistry::new(Arc::new(store.clone())), store)
    }

    #[tokio::test]
    async fn test_create_session_is_calling() {
        let (registry, _) = registry();

        let created = registry
            .create_session("booking-42", Role::Admin)
            .await
            .unwrap();

        assert_eq!(created.session.status, CallStatus::Calling);
        assert_eq!(created.session.initiator_role, Role::Admin);
        assert!(created.superseded.is_empty());
    }

    #[tokio::test]
    async fn test_create_session_store_failure_is_registry_error() {
        let (registry, store) = registry();
        store.set_fail_writes(true);

        let err = registry
            .create_session("booking-42", Role::Admin)
            .await
            .unwrap_err();

        assert!(matches!(err, SignalingError::Registry(_)));
        assert!(store.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_create_session_rejects_empty_booking() {
        let (registry, _) = registry();
        assert!(matches!(
            registry.create_session("  ", Role::Client).await,
            Err(SignalingError::Registry(_))
        ));
    }

    #[tokio::test]
    async fn test_new_session_supersedes_previous() {
        let (registry, _) = registry();
        let first = registry
            .create_session("booking-42", Role::Admin)
            .await
            .unwrap();
        let second = registry
            .create_session("booking-42", Role::Admin)
            .await
            .unwrap();

        assert_eq!(second.superseded, vec![first.session.id]);
        let active = registry.find_active_session("booking-42").await.unwrap();
        assert_eq!(active.map(|s| s.id), Some(second.session.id));
    }

    #[tokio::test]
    async fn test_find_active_session_none() {
        let (registry, _) = registry();
        assert!(registry
            .find_active_session("booking-42")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_mark_ended_is_idempotent() {
        let (registry, store) = registry();
        let created = registry
            .create_session("booking-42", Role::Admin)
            .await
            .unwrap();
        let call_id = created.session.id;

        assert!(registry.mark_ended(call_id).await.unwrap());
        assert!(!registry.mark_ended(call_id).await.unwrap());
        assert_eq!(store.status_of(call_id), Some(CallStatus::Ended));
        assert!(registry
            .find_active_session("booking-42")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_mark_connected_never_revives_ended_session() {
        let (registry, store) = registry();
        let created = registry
            .create_session("booking-42", Role::Admin)
            .await
            .unwrap();
        let call_id = created.session.id;

        registry.mark_ended(call_id).await.unwrap();
        assert!(!registry.mark_connected(call_id).await.unwrap());
        assert_eq!(store.status_of(call_id), Some(CallStatus::Ended));
    }

    #[tokio::test]
    async fn test_end_stale_sessions() {
        let mut stale = CallSession::new("booking-1", Role::Admin);
        stale.created_at = Utc::now() - chrono::Duration::hours(2);
        let store = MemorySessionStore::new().with_session(stale.clone());
        let registry = CallRegistry::new(Arc::new(store.clone()));
        registry
            .create_session("booking-2", Role::Client)
            .await
            .unwrap();

        let ended = registry
            .end_stale_sessions(Duration::from_secs(3600))
            .await
            .unwrap();

        assert_eq!(ended, 1);
        assert_eq!(store.status_of(stale.id), Some(CallStatus::Ended));
    }
}
