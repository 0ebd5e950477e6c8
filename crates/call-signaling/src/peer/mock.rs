//! Scriptable peer capability for tests.
//!
//! A [`MockPeerBackend`] hands out one media object and one connection per
//! call attempt and records everything done to them in a shared
//! [`MockPeerProbe`]. The probe also drives the connection from the
//! outside: emit a local candidate, report connectivity, or inject failures.
//!
//! ```rust,ignore
//! let (backend, probe) = MockPeerBackend::new();
//! // ... start a call with `backend` ...
//! probe.emit(PeerEvent::ConnectionStateChanged(PeerConnectionState::Connected));
//! assert!(probe.remote_description().is_some());
//! ```

use super::{
    CapabilityError, LocalMedia, PeerBackend, PeerConnection, PeerConnectionState, PeerEvent,
    RtcConfiguration,
};
use crate::models::{IceCandidate, SdpType, SessionDescription};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

const MOCK_TRACK_ID: &str = "mock-audio-0";

#[derive(Debug, Default)]
struct ProbeState {
    // Scripted behavior.
    deny_media: bool,
    fail_create_connection: bool,
    fail_create_offer: bool,
    reject_candidates_containing: Option<String>,
    auto_connect: bool,
    local_candidates: Vec<IceCandidate>,

    // Recorded effects.
    media_acquired: usize,
    media_stopped: bool,
    media_enabled: bool,
    connections_created: usize,
    tracks_added: Vec<String>,
    rtc_config: Option<RtcConfiguration>,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    applied_candidates: Vec<IceCandidate>,
    rejected_candidates: usize,
    closed: bool,
    events: Option<mpsc::Sender<PeerEvent>>,
}

/// Shared view into one mock participant's capability.
#[derive(Debug, Clone, Default)]
pub struct MockPeerProbe {
    state: Arc<Mutex<ProbeState>>,
}

impl MockPeerProbe {
    fn lock(&self) -> MutexGuard<'_, ProbeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail media acquisition with `PermissionDenied`.
    pub fn deny_media(&self) {
        self.lock().deny_media = true;
    }

    /// Fail connection creation.
    pub fn fail_create_connection(&self) {
        self.lock().fail_create_connection = true;
    }

    /// Fail offer generation.
    pub fn fail_create_offer(&self) {
        self.lock().fail_create_offer = true;
    }

    /// Reject remote candidates whose attribute line contains `pattern`.
    pub fn reject_candidates_containing(&self, pattern: &str) {
        self.lock().reject_candidates_containing = Some(pattern.to_string());
    }

    /// Report `Connected` as soon as both descriptions are set.
    pub fn auto_connect(&self) {
        self.lock().auto_connect = true;
    }

    /// Candidates to "gather" after the local description is set.
    pub fn gather_candidates(&self, candidates: Vec<IceCandidate>) {
        self.lock().local_candidates = candidates;
    }

    /// Raise an event on the live connection. Returns `false` when no
    /// connection exists or its event sink is gone.
    pub fn emit(&self, event: PeerEvent) -> bool {
        let sender = self.lock().events.clone();
        match sender {
            Some(sender) => sender.try_send(event).is_ok(),
            None => false,
        }
    }

    /// Shorthand for `emit(ConnectionStateChanged(state))`.
    pub fn set_connection_state(&self, state: PeerConnectionState) -> bool {
        self.emit(PeerEvent::ConnectionStateChanged(state))
    }

    #[must_use]
    pub fn media_acquired(&self) -> usize {
        self.lock().media_acquired
    }

    #[must_use]
    pub fn media_stopped(&self) -> bool {
        self.lock().media_stopped
    }

    #[must_use]
    pub fn media_enabled(&self) -> bool {
        self.lock().media_enabled
    }

    #[must_use]
    pub fn connections_created(&self) -> usize {
        self.lock().connections_created
    }

    #[must_use]
    pub fn tracks_added(&self) -> Vec<String> {
        self.lock().tracks_added.clone()
    }

    #[must_use]
    pub fn rtc_config(&self) -> Option<RtcConfiguration> {
        self.lock().rtc_config.clone()
    }

    #[must_use]
    pub fn local_description(&self) -> Option<SessionDescription> {
        self.lock().local_description.clone()
    }

    #[must_use]
    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.lock().remote_description.clone()
    }

    #[must_use]
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.lock().applied_candidates.clone()
    }

    #[must_use]
    pub fn rejected_candidates(&self) -> usize {
        self.lock().rejected_candidates
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

/// Mock capability factory.
#[derive(Debug, Clone, Default)]
pub struct MockPeerBackend {
    probe: MockPeerProbe,
}

impl MockPeerBackend {
    /// Create a backend together with the probe that observes it.
    #[must_use]
    pub fn new() -> (Self, MockPeerProbe) {
        let probe = MockPeerProbe::default();
        (
            Self {
                probe: probe.clone(),
            },
            probe,
        )
    }

    #[must_use]
    pub fn probe(&self) -> MockPeerProbe {
        self.probe.clone()
    }
}

#[async_trait]
impl PeerBackend for MockPeerBackend {
    async fn acquire_audio(&self) -> Result<Box<dyn LocalMedia>, CapabilityError> {
        let mut state = self.probe.lock();
        if state.deny_media {
            return Err(CapabilityError::PermissionDenied);
        }
        state.media_acquired += 1;
        state.media_stopped = false;
        state.media_enabled = true;
        Ok(Box::new(MockLocalMedia {
            probe: self.probe.clone(),
        }))
    }

    async fn create_connection(
        &self,
        config: &RtcConfiguration,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Box<dyn PeerConnection>, CapabilityError> {
        let mut state = self.probe.lock();
        if state.fail_create_connection {
            return Err(CapabilityError::Operation(
                "connection creation rejected".to_string(),
            ));
        }
        state.connections_created += 1;
        state.closed = false;
        state.rtc_config = Some(config.clone());
        state.events = Some(events);
        let generation = state.connections_created;
        Ok(Box::new(MockPeerConnection {
            probe: self.probe.clone(),
            generation,
        }))
    }
}

struct MockLocalMedia {
    probe: MockPeerProbe,
}

impl LocalMedia for MockLocalMedia {
    fn track_ids(&self) -> Vec<String> {
        vec![MOCK_TRACK_ID.to_string()]
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.probe.lock().media_enabled = enabled;
    }

    fn stop(&mut self) {
        let mut state = self.probe.lock();
        state.media_stopped = true;
        state.media_enabled = false;
    }
}

struct MockPeerConnection {
    probe: MockPeerProbe,
    generation: usize,
}

impl MockPeerConnection {
    fn description(&self, sdp_type: SdpType) -> SessionDescription {
        let sdp = format!(
            "v=0\r\no=mock {} 1 IN IP4 127.0.0.1\r\ns=-\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n",
            self.generation
        );
        match sdp_type {
            SdpType::Offer => SessionDescription::offer(sdp),
            SdpType::Answer => SessionDescription::answer(sdp),
        }
    }

    fn ensure_open(state: &ProbeState) -> Result<(), CapabilityError> {
        if state.closed {
            Err(CapabilityError::Closed)
        } else {
            Ok(())
        }
    }

    /// Gathered candidates and auto-connect, once both descriptions are known.
    fn after_description(state: &ProbeState, local_changed: bool) {
        let Some(events) = state.events.as_ref() else {
            return;
        };
        if local_changed {
            for candidate in &state.local_candidates {
                let _ = events.try_send(PeerEvent::LocalCandidate(candidate.clone()));
            }
        }
        if state.auto_connect
            && state.local_description.is_some()
            && state.remote_description.is_some()
        {
            let _ = events.try_send(PeerEvent::ConnectionStateChanged(
                PeerConnectionState::Connected,
            ));
        }
    }
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn add_track(&mut self, track_id: &str) -> Result<(), CapabilityError> {
        let mut state = self.probe.lock();
        Self::ensure_open(&state)?;
        state.tracks_added.push(track_id.to_string());
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, CapabilityError> {
        let state = self.probe.lock();
        Self::ensure_open(&state)?;
        if state.fail_create_offer {
            return Err(CapabilityError::Operation("offer generation failed".to_string()));
        }
        Ok(self.description(SdpType::Offer))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, CapabilityError> {
        let state = self.probe.lock();
        Self::ensure_open(&state)?;
        if state.remote_description.is_none() {
            return Err(CapabilityError::Operation(
                "cannot answer without a remote offer".to_string(),
            ));
        }
        Ok(self.description(SdpType::Answer))
    }

    async fn set_local_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), CapabilityError> {
        let mut state = self.probe.lock();
        Self::ensure_open(&state)?;
        state.local_description = Some(description.clone());
        Self::after_description(&state, true);
        Ok(())
    }

    async fn set_remote_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), CapabilityError> {
        let mut state = self.probe.lock();
        Self::ensure_open(&state)?;
        if !description.sdp.starts_with("v=0") {
            return Err(CapabilityError::Operation("unparseable sdp".to_string()));
        }
        state.remote_description = Some(description.clone());
        Self::after_description(&state, false);
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), CapabilityError> {
        let mut state = self.probe.lock();
        Self::ensure_open(&state)?;
        if state.remote_description.is_none() {
            return Err(CapabilityError::Operation(
                "remote description not set".to_string(),
            ));
        }
        let rejected = state
            .reject_candidates_containing
            .as_deref()
            .is_some_and(|pattern| candidate.candidate.contains(pattern));
        if rejected {
            state.rejected_candidates += 1;
            return Err(CapabilityError::InvalidCandidate(candidate.candidate.clone()));
        }
        state.applied_candidates.push(candidate.clone());
        Ok(())
    }

    async fn close(&mut self) {
        let mut state = self.probe.lock();
        state.closed = true;
        state.events = None;
    }
}
