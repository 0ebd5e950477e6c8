//! Peer connection controller.
//!
//! Runs the offer/answer/candidate state machine for one participant in one
//! call:
//!
//! ```text
//! idle ──begin (initiator)──▶ negotiating ──connectivity──▶ connected
//!  │   ──offer (responder)──▶      │                            │
//!  └──────────── hangup / remote hangup / failure ─────────────┴──▶ ended
//! ```
//!
//! Every input is idempotent: signals are de-duplicated by ID, candidates
//! that arrive before the remote description are queued and flushed in
//! arrival order exactly once, and `ended` absorbs everything.
//!
//! The controller is owned by a single call attempt actor and is never
//! shared between tasks.

use super::{CapabilityError, LocalMedia, PeerBackend, PeerConnection, PeerConnectionState, PeerEvent, RtcConfiguration};
use crate::channel::SignalChannel;
use crate::errors::SignalingError;
use crate::models::{
    CallDisplayStatus, IceCandidate, SdpType, SessionDescription, Signal, SignalKind,
};
use crate::observability::metrics;
use common::types::{CallId, Role};
use serde_json::json;
use std::collections::{HashSet, VecDeque};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Controller lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerState {
    Idle,
    Negotiating,
    Connected,
    /// Terminal.
    Ended,
}

/// Which side of the negotiation this participant plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallMode {
    /// Creates the session and sends the offer.
    Initiator,
    /// Joins an existing session and answers.
    Responder,
}

impl CallMode {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            CallMode::Initiator => "initiator",
            CallMode::Responder => "responder",
        }
    }
}

/// Why a controller reached `ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndReason {
    LocalHangup,
    RemoteHangup,
    /// The capability reported failure or lost connectivity.
    ConnectionLost,
    /// The attempt was torn down without a hangup (cancel, fatal error).
    Cancelled,
    /// The registry ended the session without a hangup reaching this side,
    /// e.g. a restart by the same role superseded it.
    SessionEnded,
}

impl EndReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            EndReason::LocalHangup => "local_hangup",
            EndReason::RemoteHangup => "remote_hangup",
            EndReason::ConnectionLost => "connection_lost",
            EndReason::Cancelled => "cancelled",
            EndReason::SessionEnded => "session_ended",
        }
    }
}

/// How a signal reached the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverySource {
    /// Live push feed.
    Push,
    /// History fetched from the log.
    Replay,
}

impl DeliverySource {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            DeliverySource::Push => "push",
            DeliverySource::Replay => "replay",
        }
    }
}

/// Point-in-time view of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub state: PeerState,
    pub mode: CallMode,
    pub muted: bool,
    pub remote_description_set: bool,
    /// Remote candidates waiting for the remote description.
    pub pending_candidates: usize,
    /// Remote candidates handed to the capability.
    pub applied_candidates: usize,
    pub end_reason: Option<EndReason>,
}

/// Drives one peer connection through negotiation.
pub struct PeerController {
    call_id: CallId,
    local_role: Role,
    mode: CallMode,
    channel: SignalChannel,
    state: PeerState,
    connection: Option<Box<dyn PeerConnection>>,
    media: Option<Box<dyn LocalMedia>>,
    remote_description_set: bool,
    /// SDP of the offer this responder answered.
    answered_offer: Option<String>,
    /// Offer received before the capability existed.
    held_offer: Option<SessionDescription>,
    pending_candidates: VecDeque<IceCandidate>,
    seen_signal_ids: HashSet<i64>,
    applied_candidates: usize,
    muted: bool,
    end_reason: Option<EndReason>,
}

impl PeerController {
    #[must_use]
    pub fn new(call_id: CallId, mode: CallMode, channel: SignalChannel) -> Self {
        Self {
            call_id,
            local_role: channel.local_role(),
            mode,
            channel,
            state: PeerState::Idle,
            connection: None,
            media: None,
            remote_description_set: false,
            answered_offer: None,
            held_offer: None,
            pending_candidates: VecDeque::new(),
            seen_signal_ids: HashSet::new(),
            applied_candidates: 0,
            muted: false,
            end_reason: None,
        }
    }

    #[must_use]
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    #[must_use]
    pub fn mode(&self) -> CallMode {
        self.mode
    }

    #[must_use]
    pub fn state(&self) -> PeerState {
        self.state
    }

    #[must_use]
    pub fn end_reason(&self) -> Option<EndReason> {
        self.end_reason
    }

    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.state == PeerState::Ended
    }

    /// Whether media and the capability are in place.
    #[must_use]
    pub fn is_prepared(&self) -> bool {
        self.connection.is_some() && self.media.is_some()
    }

    #[must_use]
    pub fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            state: self.state,
            mode: self.mode,
            muted: self.muted,
            remote_description_set: self.remote_description_set,
            pending_candidates: self.pending_candidates.len(),
            applied_candidates: self.applied_candidates,
            end_reason: self.end_reason,
        }
    }

    /// Status text for the user.
    #[must_use]
    pub fn display_status(&self) -> CallDisplayStatus {
        match (self.state, self.mode) {
            (PeerState::Idle, _) if !self.is_prepared() => CallDisplayStatus::Idle,
            (PeerState::Idle | PeerState::Negotiating, CallMode::Initiator) => {
                CallDisplayStatus::Calling
            }
            (PeerState::Idle | PeerState::Negotiating, CallMode::Responder) => {
                CallDisplayStatus::Joining
            }
            (PeerState::Connected, _) => CallDisplayStatus::Connected,
            (PeerState::Ended, _) => match self.end_reason {
                Some(EndReason::ConnectionLost) => CallDisplayStatus::Disconnected,
                _ => CallDisplayStatus::Ended,
            },
        }
    }

    /// Acquire local audio and create the capability.
    ///
    /// On failure nothing is left allocated and the controller stays `idle`.
    ///
    /// # Errors
    ///
    /// - `SignalingError::MediaAcquisition` if the microphone is unavailable
    /// - `SignalingError::Capability` if the connection cannot be created
    /// - `SignalingError::CallEnded` if the controller has already ended
    pub async fn prepare(
        &mut self,
        backend: &dyn PeerBackend,
        rtc: &RtcConfiguration,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<(), SignalingError> {
        if self.is_ended() {
            return Err(SignalingError::CallEnded);
        }
        if self.is_prepared() {
            return Ok(());
        }

        let mut media = backend.acquire_audio().await.map_err(|e| {
            warn!(
                target: "signaling.controller",
                call_id = %self.call_id,
                error = %e,
                "Media acquisition failed"
            );
            SignalingError::MediaAcquisition(e.to_string())
        })?;

        let mut connection = match backend.create_connection(rtc, events).await {
            Ok(connection) => connection,
            Err(e) => {
                media.stop();
                return Err(SignalingError::Capability(e.to_string()));
            }
        };

        for track_id in media.track_ids() {
            if let Err(e) = connection.add_track(&track_id).await {
                connection.close().await;
                media.stop();
                return Err(SignalingError::Capability(e.to_string()));
            }
        }

        debug!(
            target: "signaling.controller",
            call_id = %self.call_id,
            mode = self.mode.as_str(),
            "Media acquired and peer connection created"
        );

        self.media = Some(media);
        self.connection = Some(connection);
        Ok(())
    }

    /// Start negotiating.
    ///
    /// The initiator generates and publishes an offer. The responder waits
    /// for one, applying an offer that arrived during setup.
    ///
    /// # Errors
    ///
    /// - `SignalingError::Capability` if offer generation fails (fatal)
    /// - `SignalingError::SignalPublish` if the offer could not be written;
    ///   the controller stays `negotiating`
    pub async fn begin(&mut self) -> Result<(), SignalingError> {
        if self.state != PeerState::Idle {
            return Ok(());
        }
        if !self.is_prepared() {
            return Err(SignalingError::Internal(
                "begin called before prepare".to_string(),
            ));
        }

        match self.mode {
            CallMode::Initiator => {
                let offer = {
                    let connection = self.connection_mut()?;
                    let offer = connection
                        .create_offer()
                        .await
                        .map_err(|e| SignalingError::Capability(e.to_string()))?;
                    connection
                        .set_local_description(&offer)
                        .await
                        .map_err(|e| SignalingError::Capability(e.to_string()))?;
                    offer
                };
                self.state = PeerState::Negotiating;
                info!(target: "signaling.controller", call_id = %self.call_id, "Offer created");

                let payload = offer.to_payload()?;
                self.publish(SignalKind::Offer, payload).await
            }
            CallMode::Responder => match self.held_offer.take() {
                Some(offer) => {
                    debug!(target: "signaling.controller", call_id = %self.call_id, "Applying held offer");
                    self.apply_offer(offer).await
                }
                None => Ok(()),
            },
        }
    }

    /// Apply one remote signal.
    ///
    /// # Errors
    ///
    /// - `SignalingError::MalformedSignal` if the signal was dropped; the
    ///   controller is unchanged
    /// - `SignalingError::SignalPublish` if the answer could not be written
    /// - `SignalingError::Capability` if answer generation fails (fatal)
    pub async fn handle_signal(
        &mut self,
        signal: Signal,
        source: DeliverySource,
    ) -> Result<(), SignalingError> {
        if self.is_ended() || signal.call_id != self.call_id {
            return Ok(());
        }
        if signal.sender_role == self.local_role {
            debug!(
                target: "signaling.controller",
                call_id = %self.call_id,
                signal_id = signal.id,
                "Ignoring self-authored signal"
            );
            return Ok(());
        }
        if !self.seen_signal_ids.insert(signal.id) {
            metrics::record_signal_duplicate(signal.kind.as_str());
            return Ok(());
        }
        metrics::record_signal_received(signal.kind.as_str(), source.as_str());

        let result = match signal.kind {
            SignalKind::Offer => self.on_offer(&signal).await,
            SignalKind::Answer => self.on_answer(&signal).await,
            SignalKind::Ice => self.on_ice(&signal).await,
            SignalKind::Hangup => {
                info!(target: "signaling.controller", call_id = %self.call_id, "Remote hangup");
                self.teardown(EndReason::RemoteHangup).await;
                Ok(())
            }
        };

        if let Err(SignalingError::MalformedSignal { kind, reason }) = &result {
            metrics::record_signal_malformed(kind.as_str());
            warn!(
                target: "signaling.controller",
                call_id = %self.call_id,
                signal_id = signal.id,
                kind = %kind,
                reason = %reason,
                "Dropping malformed signal"
            );
        }
        result
    }

    async fn on_offer(&mut self, signal: &Signal) -> Result<(), SignalingError> {
        if self.mode == CallMode::Initiator {
            warn!(
                target: "signaling.controller",
                call_id = %self.call_id,
                signal_id = signal.id,
                "Initiator received an offer, ignoring"
            );
            return Ok(());
        }

        let offer = SessionDescription::from_payload(&signal.payload, SdpType::Offer)?;

        if let Some(answered) = &self.answered_offer {
            if *answered != offer.sdp {
                warn!(
                    target: "signaling.controller",
                    call_id = %self.call_id,
                    signal_id = signal.id,
                    "Second offer for an answered call, ignoring"
                );
            }
            return Ok(());
        }

        if self.connection.is_none() {
            debug!(target: "signaling.controller", call_id = %self.call_id, "Holding offer until setup completes");
            self.held_offer = Some(offer);
            return Ok(());
        }

        self.apply_offer(offer).await
    }

    async fn apply_offer(&mut self, offer: SessionDescription) -> Result<(), SignalingError> {
        self.connection_mut()?
            .set_remote_description(&offer)
            .await
            .map_err(|e| SignalingError::malformed(SignalKind::Offer, e.to_string()))?;
        self.remote_description_set = true;
        self.answered_offer = Some(offer.sdp);
        self.flush_pending_candidates().await;

        let answer = {
            let connection = self.connection_mut()?;
            let answer = connection
                .create_answer()
                .await
                .map_err(|e| SignalingError::Capability(e.to_string()))?;
            connection
                .set_local_description(&answer)
                .await
                .map_err(|e| SignalingError::Capability(e.to_string()))?;
            answer
        };
        self.state = PeerState::Negotiating;
        info!(target: "signaling.controller", call_id = %self.call_id, "Answer created");

        let payload = answer.to_payload()?;
        self.publish(SignalKind::Answer, payload).await
    }

    async fn on_answer(&mut self, signal: &Signal) -> Result<(), SignalingError> {
        if self.mode == CallMode::Responder {
            warn!(
                target: "signaling.controller",
                call_id = %self.call_id,
                signal_id = signal.id,
                "Responder received an answer, ignoring"
            );
            return Ok(());
        }
        if self.state != PeerState::Negotiating || self.remote_description_set {
            debug!(
                target: "signaling.controller",
                call_id = %self.call_id,
                signal_id = signal.id,
                "Answer not expected in current state, ignoring"
            );
            return Ok(());
        }

        let answer = SessionDescription::from_payload(&signal.payload, SdpType::Answer)?;
        self.connection_mut()?
            .set_remote_description(&answer)
            .await
            .map_err(|e| SignalingError::malformed(SignalKind::Answer, e.to_string()))?;
        self.remote_description_set = true;
        info!(target: "signaling.controller", call_id = %self.call_id, "Answer applied");

        self.flush_pending_candidates().await;
        Ok(())
    }

    async fn on_ice(&mut self, signal: &Signal) -> Result<(), SignalingError> {
        let candidate = IceCandidate::from_payload(&signal.payload)?;

        if !self.remote_description_set {
            self.pending_candidates.push_back(candidate);
            debug!(
                target: "signaling.controller",
                call_id = %self.call_id,
                pending = self.pending_candidates.len(),
                "Queued candidate until remote description is set"
            );
            return Ok(());
        }

        self.apply_candidate(&candidate).await
    }

    async fn apply_candidate(&mut self, candidate: &IceCandidate) -> Result<(), SignalingError> {
        self.connection_mut()?
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| SignalingError::malformed(SignalKind::Ice, e.to_string()))?;
        self.applied_candidates += 1;
        Ok(())
    }

    /// Apply queued candidates in arrival order. Each is attempted once;
    /// rejected ones are dropped.
    async fn flush_pending_candidates(&mut self) {
        if self.pending_candidates.is_empty() {
            return;
        }
        debug!(
            target: "signaling.controller",
            call_id = %self.call_id,
            count = self.pending_candidates.len(),
            "Flushing queued candidates"
        );
        while let Some(candidate) = self.pending_candidates.pop_front() {
            if let Err(e) = self.apply_candidate(&candidate).await {
                metrics::record_signal_malformed(SignalKind::Ice.as_str());
                warn!(
                    target: "signaling.controller",
                    call_id = %self.call_id,
                    error = %e,
                    "Dropping queued candidate"
                );
            }
        }
    }

    /// React to a notification from the capability.
    ///
    /// # Errors
    ///
    /// Returns `SignalingError::SignalPublish` if a local candidate could not
    /// be written.
    pub async fn handle_peer_event(&mut self, event: PeerEvent) -> Result<(), SignalingError> {
        if self.is_ended() {
            return Ok(());
        }

        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let payload = candidate.to_payload()?;
                self.publish(SignalKind::Ice, payload).await
            }
            PeerEvent::ConnectionStateChanged(connection_state) => {
                self.on_connection_state(connection_state).await;
                Ok(())
            }
            PeerEvent::RemoteTrack { track_id } => {
                debug!(
                    target: "signaling.controller",
                    call_id = %self.call_id,
                    track_id = %track_id,
                    "Remote audio track attached"
                );
                Ok(())
            }
        }
    }

    async fn on_connection_state(&mut self, connection_state: PeerConnectionState) {
        match (self.state, connection_state) {
            (PeerState::Negotiating, PeerConnectionState::Connected) => {
                self.state = PeerState::Connected;
                info!(target: "signaling.controller", call_id = %self.call_id, "Peer connected");
            }
            (PeerState::Negotiating | PeerState::Connected, PeerConnectionState::Failed)
            | (
                PeerState::Connected,
                PeerConnectionState::Disconnected | PeerConnectionState::Closed,
            ) => {
                warn!(
                    target: "signaling.controller",
                    call_id = %self.call_id,
                    state = ?connection_state,
                    "Peer connection lost"
                );
                self.teardown(EndReason::ConnectionLost).await;
            }
            _ => {
                debug!(
                    target: "signaling.controller",
                    call_id = %self.call_id,
                    state = ?connection_state,
                    "Connection state change ignored"
                );
            }
        }
    }

    /// End the call from this side: publish `hangup`, then release
    /// everything.
    ///
    /// Returns `false` if the controller had already ended (nothing is
    /// published).
    ///
    /// # Errors
    ///
    /// Returns `SignalingError::SignalPublish` if the hangup could not be
    /// written. Local teardown happens regardless.
    pub async fn hangup(&mut self) -> Result<bool, SignalingError> {
        if self.is_ended() {
            return Ok(false);
        }

        let published = self.publish(SignalKind::Hangup, json!({})).await;
        self.teardown(EndReason::LocalHangup).await;
        published.map(|()| true)
    }

    /// Flip the outgoing audio. Returns the new muted flag.
    pub fn toggle_mute(&mut self) -> bool {
        if let Some(media) = self.media.as_mut() {
            self.muted = !self.muted;
            media.set_enabled(!self.muted);
        }
        self.muted
    }

    /// Release media, close the capability and enter `ended`.
    ///
    /// Never publishes. Idempotent.
    pub async fn teardown(&mut self, reason: EndReason) {
        if self.is_ended() {
            return;
        }

        if let Some(mut media) = self.media.take() {
            media.stop();
        }
        if let Some(mut connection) = self.connection.take() {
            connection.close().await;
        }
        self.pending_candidates.clear();
        self.held_offer = None;
        self.state = PeerState::Ended;
        self.end_reason = Some(reason);

        info!(
            target: "signaling.controller",
            call_id = %self.call_id,
            reason = reason.as_str(),
            "Call ended"
        );
    }

    async fn publish(
        &self,
        kind: SignalKind,
        payload: serde_json::Value,
    ) -> Result<(), SignalingError> {
        self.channel
            .publish(self.call_id, self.local_role, kind, payload)
            .await
            .map(|_| ())
    }

    fn connection_mut(&mut self) -> Result<&mut Box<dyn PeerConnection>, SignalingError> {
        self.connection
            .as_mut()
            .ok_or_else(|| SignalingError::Capability(CapabilityError::Closed.to_string()))
    }
}
