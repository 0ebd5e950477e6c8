//! `CallAttempt` - one participant's involvement in one call session.
//!
//! Each `CallAttempt`:
//! - Owns a prepared [`PeerController`] and the subscription feeding it
//! - Replays the signal log after subscribing, then re-reads it on an
//!   interval until connected so a dropped push cannot stall negotiation
//! - Checks the session on the same interval and ends once the registry
//!   no longer lists it as active (superseded or swept); once connected,
//!   only the capability reports loss
//! - Mirrors controller transitions into the registry (`connected`, `ended`)
//! - Publishes the display status and the last failure notice via `watch`
//!
//! # Lifecycle
//!
//! 1. Spawned by `CallClient` after media and the capability are ready
//! 2. Runs until the controller ends (hangup, remote hangup, lost
//!    connectivity, ended session, fatal error) or the attempt is cancelled
//! 3. Dropping every handle cancels the attempt

use super::messages::{AttemptMessage, AttemptSnapshot};
use crate::channel::{SignalChannel, Subscription};
use crate::config::{timer_period, CallConfig};
use crate::errors::SignalingError;
use crate::models::{CallDisplayStatus, CallSession, Signal};
use crate::observability::metrics;
use crate::peer::{DeliverySource, EndReason, PeerController, PeerEvent, PeerState};
use crate::registry::CallRegistry;
use common::types::CallId;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Mailbox size for handle commands.
const ATTEMPT_CHANNEL_BUFFER: usize = 32;

/// Ordering used to keep the displayed status from moving backwards.
fn status_rank(status: CallDisplayStatus) -> u8 {
    match status {
        CallDisplayStatus::Idle => 0,
        CallDisplayStatus::Calling | CallDisplayStatus::Joining => 1,
        CallDisplayStatus::Connected => 2,
        CallDisplayStatus::Disconnected | CallDisplayStatus::Ended => 3,
    }
}

/// Handle to a running call attempt.
#[derive(Clone, Debug)]
pub struct CallAttemptHandle {
    sender: mpsc::Sender<AttemptMessage>,
    cancel_token: CancellationToken,
    session: CallSession,
    status: watch::Receiver<CallDisplayStatus>,
    notices: watch::Receiver<Option<String>>,
}

impl CallAttemptHandle {
    #[must_use]
    pub fn call_id(&self) -> CallId {
        self.session.id
    }

    /// The session as it was when the attempt started.
    #[must_use]
    pub fn session(&self) -> &CallSession {
        &self.session
    }

    /// Hang up. Succeeds without effect if the call has already ended.
    ///
    /// # Errors
    ///
    /// Returns `SignalingError::SignalPublish` if the hangup signal could not
    /// be written (the local side is torn down regardless).
    pub async fn hangup(&self) -> Result<(), SignalingError> {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(AttemptMessage::Hangup { respond_to: tx })
            .await
            .is_err()
        {
            return Ok(());
        }
        match rx.await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Ok(()),
        }
    }

    /// Flip the outgoing audio. Returns the new muted flag.
    ///
    /// # Errors
    ///
    /// Returns `SignalingError::CallEnded` if the attempt has finished.
    pub async fn toggle_mute(&self) -> Result<bool, SignalingError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(AttemptMessage::ToggleMute { respond_to: tx })
            .await
            .map_err(|_| SignalingError::CallEnded)?;
        rx.await.map_err(|_| SignalingError::CallEnded)
    }

    /// # Errors
    ///
    /// Returns `SignalingError::CallEnded` if the attempt has finished.
    pub async fn snapshot(&self) -> Result<AttemptSnapshot, SignalingError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(AttemptMessage::GetSnapshot { respond_to: tx })
            .await
            .map_err(|_| SignalingError::CallEnded)?;
        rx.await.map_err(|_| SignalingError::CallEnded)
    }

    /// Current display status.
    #[must_use]
    pub fn status(&self) -> CallDisplayStatus {
        *self.status.borrow()
    }

    /// Subscribe to display status changes.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<CallDisplayStatus> {
        self.status.clone()
    }

    /// Last hard-failure notice, if any.
    #[must_use]
    pub fn notice(&self) -> Option<String> {
        self.notices.borrow().clone()
    }

    #[must_use]
    pub fn notices(&self) -> watch::Receiver<Option<String>> {
        self.notices.clone()
    }

    /// Tear the attempt down without publishing a hangup.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.status().is_final()
    }

    /// Wait until the attempt reaches a final status and return it.
    pub async fn wait_for_end(&self) -> CallDisplayStatus {
        let mut status = self.status.clone();
        let reached = status.wait_for(|s| s.is_final()).await.map(|s| *s);
        // Actor gone: whatever it last published is final.
        reached.unwrap_or_else(|_| *status.borrow())
    }
}

/// The `CallAttempt` actor.
pub struct CallAttempt {
    session: CallSession,
    controller: PeerController,
    registry: CallRegistry,
    channel: SignalChannel,
    receiver: mpsc::Receiver<AttemptMessage>,
    signal_tx: mpsc::Sender<Signal>,
    signal_rx: mpsc::Receiver<Signal>,
    events: mpsc::Receiver<PeerEvent>,
    cancel_token: CancellationToken,
    status: watch::Sender<CallDisplayStatus>,
    notices: watch::Sender<Option<String>>,
    resync_interval: Duration,
    subscription: Option<Subscription>,
    /// Controller state last mirrored into the registry.
    mirrored_state: PeerState,
}

impl CallAttempt {
    /// Spawn an attempt around a prepared controller.
    ///
    /// `events` must be the receiving end of the sink the controller's
    /// capability was created with.
    pub fn spawn(
        session: CallSession,
        controller: PeerController,
        events: mpsc::Receiver<PeerEvent>,
        registry: CallRegistry,
        channel: SignalChannel,
        config: &CallConfig,
    ) -> (CallAttemptHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ATTEMPT_CHANNEL_BUFFER);
        let (signal_tx, signal_rx) = mpsc::channel(config.signal_buffer.max(1));
        let (status_tx, status_rx) = watch::channel(controller.display_status());
        let (notice_tx, notice_rx) = watch::channel(None);
        let cancel_token = CancellationToken::new();

        let actor = Self {
            session: session.clone(),
            mirrored_state: controller.state(),
            controller,
            registry,
            channel,
            receiver,
            signal_tx,
            signal_rx,
            events,
            cancel_token: cancel_token.clone(),
            status: status_tx,
            notices: notice_tx,
            resync_interval: timer_period(config.resync_interval),
            subscription: None,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = CallAttemptHandle {
            sender,
            cancel_token,
            session,
            status: status_rx,
            notices: notice_rx,
        };

        (handle, task_handle)
    }

    #[instrument(
        skip_all,
        name = "signaling.attempt",
        fields(call_id = %self.session.id, mode = self.controller.mode().as_str())
    )]
    async fn run(mut self) {
        let call_id = self.session.id;
        metrics::record_call_attempt_started(self.controller.mode().as_str());
        debug!(target: "signaling.attempt", call_id = %call_id, "CallAttempt started");

        // Subscribe before replaying so nothing written in between is missed.
        match self.channel.subscribe(call_id, self.signal_tx.clone()).await {
            Ok(subscription) => self.subscription = Some(subscription),
            Err(e) => {
                warn!(
                    target: "signaling.attempt",
                    call_id = %call_id,
                    error = %e,
                    "Live signal feed unavailable, relying on resync"
                );
                self.post_notice(&e);
            }
        }

        if let Err(e) = self.controller.begin().await {
            self.handle_error(e).await;
        }
        self.resync().await;
        self.after_step().await;

        let mut resync = tokio::time::interval_at(
            Instant::now() + self.resync_interval,
            self.resync_interval,
        );
        resync.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while !self.controller.is_ended() {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(target: "signaling.attempt", call_id = %call_id, "CallAttempt cancelled");
                    self.controller.teardown(EndReason::Cancelled).await;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => self.handle_message(message).await,
                        None => {
                            debug!(target: "signaling.attempt", call_id = %call_id, "All handles dropped");
                            self.controller.teardown(EndReason::Cancelled).await;
                        }
                    }
                }

                Some(signal) = self.signal_rx.recv() => {
                    let result = self.controller.handle_signal(signal, DeliverySource::Push).await;
                    if let Err(e) = result {
                        self.handle_error(e).await;
                    }
                }

                Some(event) = self.events.recv() => {
                    if let Err(e) = self.controller.handle_peer_event(event).await {
                        self.handle_error(e).await;
                    }
                }

                _ = resync.tick(), if self.controller.state() != PeerState::Connected => {
                    self.check_session().await;
                    self.resync().await;
                }
            }

            self.after_step().await;
        }

        self.finish().await;
    }

    async fn handle_message(&mut self, message: AttemptMessage) {
        match message {
            AttemptMessage::Hangup { respond_to } => {
                let result = self.controller.hangup().await;
                if let Err(e) = &result {
                    self.post_notice(e);
                }
                let _ = respond_to.send(result);
            }
            AttemptMessage::ToggleMute { respond_to } => {
                let muted = self.controller.toggle_mute();
                debug!(target: "signaling.attempt", call_id = %self.session.id, muted, "Mute toggled");
                let _ = respond_to.send(muted);
            }
            AttemptMessage::GetSnapshot { respond_to } => {
                let _ = respond_to.send(AttemptSnapshot {
                    call_id: self.session.id,
                    booking_id: self.session.booking_id.clone(),
                    status: *self.status.borrow(),
                    peer: self.controller.snapshot(),
                });
            }
        }
    }

    /// Re-read the log and apply anything the live feed missed.
    async fn resync(&mut self) {
        if self.controller.is_ended() {
            return;
        }
        let signals = match self.channel.history(self.session.id).await {
            Ok(signals) => signals,
            Err(e) => {
                warn!(
                    target: "signaling.attempt",
                    call_id = %self.session.id,
                    error = %e,
                    "Signal replay failed"
                );
                self.post_notice(&e);
                return;
            }
        };

        for signal in signals {
            if let Err(e) = self
                .controller
                .handle_signal(signal, DeliverySource::Replay)
                .await
            {
                self.handle_error(e).await;
            }
            if self.controller.is_ended() {
                break;
            }
        }
    }

    /// End the attempt once the registry no longer lists the session as
    /// active. A same-role restart supersedes the session without any
    /// signal this side would accept.
    async fn check_session(&mut self) {
        if self.controller.is_ended() {
            return;
        }
        match self.registry.get_session(self.session.id).await {
            Ok(Some(session)) if session.is_active() => {}
            Ok(_) => {
                info!(
                    target: "signaling.attempt",
                    call_id = %self.session.id,
                    "Session no longer active, ending call attempt"
                );
                self.controller.teardown(EndReason::SessionEnded).await;
            }
            Err(e) => {
                warn!(
                    target: "signaling.attempt",
                    call_id = %self.session.id,
                    error = %e,
                    "Session status check failed"
                );
            }
        }
    }

    async fn handle_error(&mut self, err: SignalingError) {
        match err {
            // Already logged and counted by the controller.
            SignalingError::MalformedSignal { .. } => {}
            err if err.ends_attempt() => {
                warn!(
                    target: "signaling.attempt",
                    call_id = %self.session.id,
                    error = %err,
                    "Fatal error, ending call attempt"
                );
                self.post_notice(&err);
                self.controller.teardown(EndReason::Cancelled).await;
            }
            err => self.post_notice(&err),
        }
    }

    /// Publish status and mirror controller transitions into the registry.
    async fn after_step(&mut self) {
        self.publish_status(self.controller.display_status());

        let state = self.controller.state();
        if state == self.mirrored_state {
            return;
        }
        self.mirrored_state = state;

        match state {
            PeerState::Connected => {
                if let Err(e) = self.registry.mark_connected(self.session.id).await {
                    warn!(
                        target: "signaling.attempt",
                        call_id = %self.session.id,
                        error = %e,
                        "Failed to mark session connected"
                    );
                }
            }
            PeerState::Ended => {
                let ends_session = !matches!(
                    self.controller.end_reason(),
                    Some(EndReason::Cancelled | EndReason::SessionEnded) | None
                );
                if ends_session {
                    if let Err(e) = self.registry.mark_ended(self.session.id).await {
                        warn!(
                            target: "signaling.attempt",
                            call_id = %self.session.id,
                            error = %e,
                            "Failed to mark session ended"
                        );
                    }
                }
            }
            PeerState::Idle | PeerState::Negotiating => {}
        }
    }

    fn publish_status(&self, next: CallDisplayStatus) {
        self.status.send_if_modified(|current| {
            if *current != next && status_rank(next) >= status_rank(*current) {
                *current = next;
                true
            } else {
                false
            }
        });
    }

    fn post_notice(&self, err: &SignalingError) {
        let message = err.client_message();
        self.notices.send_if_modified(|current| {
            if current.as_deref() == Some(message.as_str()) {
                false
            } else {
                *current = Some(message.clone());
                true
            }
        });
    }

    async fn finish(mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.dispose().await;
        }
        self.after_step().await;

        let reason = self.controller.end_reason().unwrap_or(EndReason::Cancelled);
        metrics::record_call_ended(reason.as_str());
        info!(
            target: "signaling.attempt",
            call_id = %self.session.id,
            reason = reason.as_str(),
            status = %self.controller.display_status(),
            "CallAttempt finished"
        );
    }
}
