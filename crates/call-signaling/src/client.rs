//! Participant-facing entry point.
//!
//! A [`CallClient`] is bound to one role and starts, joins, or waits for
//! calls. Every call it enters is returned as a [`CallAttemptHandle`]; the
//! client itself keeps no per-call state.

use crate::actors::{CallAttempt, CallAttemptHandle};
use crate::channel::SignalChannel;
use crate::config::CallConfig;
use crate::errors::SignalingError;
use crate::models::{CallSession, SignalKind};
use crate::peer::{CallMode, EndReason, PeerBackend, PeerController, PeerEvent};
use crate::registry::CallRegistry;
use crate::store::{SessionStore, SignalStore};
use crate::tasks::{spawn_join_poller, JoinPollerHandle};
use common::types::{CallId, Role};
use futures::future::join_all;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

/// One participant's view of the call service.
#[derive(Clone)]
pub struct CallClient {
    role: Role,
    registry: CallRegistry,
    channel: SignalChannel,
    backend: Arc<dyn PeerBackend>,
    config: CallConfig,
}

impl CallClient {
    #[must_use]
    pub fn new(
        role: Role,
        sessions: Arc<dyn SessionStore>,
        signals: Arc<dyn SignalStore>,
        backend: Arc<dyn PeerBackend>,
        config: CallConfig,
    ) -> Self {
        Self {
            role,
            registry: CallRegistry::new(sessions),
            channel: SignalChannel::new(signals, role),
            backend,
            config,
        }
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub fn registry(&self) -> &CallRegistry {
        &self.registry
    }

    /// Start a new call for the booking as the initiator.
    ///
    /// Media is acquired before the session is written, so a denied
    /// microphone leaves no session behind. Earlier active sessions for the
    /// booking are superseded and receive a `hangup`.
    ///
    /// # Errors
    ///
    /// - `SignalingError::MediaAcquisition` if the microphone is unavailable
    /// - `SignalingError::Capability` if the peer connection cannot be created
    /// - `SignalingError::Registry` if the session cannot be written
    #[instrument(skip_all, name = "signaling.client.start_call", fields(booking_id = %booking_id, role = %self.role))]
    pub async fn start_call(&self, booking_id: &str) -> Result<CallAttemptHandle, SignalingError> {
        let session = CallSession::new(booking_id, self.role);
        let (mut controller, events) = self.prepare(session.id, CallMode::Initiator).await?;

        let created = match self.registry.register_session(session).await {
            Ok(created) => created,
            Err(e) => {
                controller.teardown(EndReason::Cancelled).await;
                return Err(e);
            }
        };

        self.hang_up_superseded(&created.superseded).await;

        info!(
            target: "signaling.attempt",
            call_id = %created.session.id,
            booking_id = %booking_id,
            "Starting call"
        );
        Ok(self.spawn_attempt(created.session, controller, events))
    }

    /// Join the booking's active call as the responder.
    ///
    /// # Errors
    ///
    /// - `SignalingError::NoActiveCall` if no session is live; no peer
    ///   connection is created
    /// - `SignalingError::RoleConflict` if the live session was started by
    ///   this client's role
    /// - `SignalingError::MediaAcquisition` / `SignalingError::Capability`
    ///   if local setup fails
    /// - `SignalingError::Registry` if the lookup fails
    #[instrument(skip_all, name = "signaling.client.join_call", fields(booking_id = %booking_id, role = %self.role))]
    pub async fn join_call(&self, booking_id: &str) -> Result<CallAttemptHandle, SignalingError> {
        let session = self
            .registry
            .find_active_session(booking_id)
            .await?
            .ok_or_else(|| SignalingError::NoActiveCall(booking_id.to_string()))?;

        self.attach(session).await
    }

    /// Join a specific session, typically one announced by a push
    /// notification.
    ///
    /// # Errors
    ///
    /// - `SignalingError::SessionNotFound` if the session is missing or ended
    /// - otherwise as [`CallClient::join_call`]
    #[instrument(skip_all, name = "signaling.client.join_session", fields(call_id = %call_id, role = %self.role))]
    pub async fn join_session(&self, call_id: CallId) -> Result<CallAttemptHandle, SignalingError> {
        let session = self
            .registry
            .get_session(call_id)
            .await?
            .filter(CallSession::is_active)
            .ok_or_else(|| SignalingError::SessionNotFound(call_id.to_string()))?;

        self.attach(session).await
    }

    /// Wait for a session to appear for the booking.
    ///
    /// Uses the session push feed when it can be opened and always polls the
    /// registry every `join_poll_interval`. `on_found` runs once, typically
    /// calling [`CallClient::join_session`].
    pub async fn watch_for_call<F>(&self, booking_id: &str, on_found: F) -> JoinPollerHandle
    where
        F: FnOnce(CallSession) + Send + 'static,
    {
        let push_feed = match self.registry.subscribe_new_sessions(booking_id).await {
            Ok(feed) => Some(feed),
            Err(e) => {
                warn!(
                    target: "signaling.poller",
                    booking_id = %booking_id,
                    error = %e,
                    "Session push feed unavailable, polling only"
                );
                None
            }
        };

        spawn_join_poller(
            self.registry.clone(),
            booking_id.to_string(),
            self.config.join_poll_interval,
            push_feed,
            on_found,
        )
    }

    async fn attach(&self, session: CallSession) -> Result<CallAttemptHandle, SignalingError> {
        if session.initiator_role == self.role {
            return Err(SignalingError::RoleConflict(format!(
                "session {} was started by {}",
                session.id, session.initiator_role
            )));
        }

        let (controller, events) = self.prepare(session.id, CallMode::Responder).await?;

        info!(
            target: "signaling.attempt",
            call_id = %session.id,
            booking_id = %session.booking_id,
            "Joining call"
        );
        Ok(self.spawn_attempt(session, controller, events))
    }

    async fn prepare(
        &self,
        call_id: CallId,
        mode: CallMode,
    ) -> Result<(PeerController, mpsc::Receiver<PeerEvent>), SignalingError> {
        let (events_tx, events_rx) = mpsc::channel(self.config.signal_buffer.max(1));
        let mut controller = PeerController::new(call_id, mode, self.channel.clone());
        controller
            .prepare(self.backend.as_ref(), &self.config.rtc, events_tx)
            .await?;
        Ok((controller, events_rx))
    }

    fn spawn_attempt(
        &self,
        session: CallSession,
        controller: PeerController,
        events: mpsc::Receiver<PeerEvent>,
    ) -> CallAttemptHandle {
        let (handle, _task) = CallAttempt::spawn(
            session,
            controller,
            events,
            self.registry.clone(),
            self.channel.clone(),
            &self.config,
        );
        handle
    }

    /// Best effort: a peer still attached to a superseded call should end
    /// cleanly rather than wait for a timeout.
    async fn hang_up_superseded(&self, superseded: &[CallId]) {
        let publishes = superseded.iter().map(|&call_id| async move {
            let result = self
                .channel
                .publish(call_id, self.role, SignalKind::Hangup, json!({}))
                .await;
            (call_id, result)
        });

        for (call_id, result) in join_all(publishes).await {
            if let Err(e) = result {
                warn!(
                    target: "signaling.attempt",
                    call_id = %call_id,
                    error = %e,
                    "Failed to hang up superseded session"
                );
            }
        }
    }
}
