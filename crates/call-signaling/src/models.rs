//! Call session and signal data model.
//!
//! Sessions and signals are the only persisted state. Signals are immutable
//! once written; a session only ever moves its `status` forward.
//!
//! Payloads use the browser's JSON shapes (`RTCSessionDescriptionInit`,
//! `RTCIceCandidateInit`) so rows written by either peer implementation are
//! interchangeable.

use crate::errors::SignalingError;
use chrono::{DateTime, Utc};
use common::types::{CallId, Role};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Call session lifecycle status.
///
/// Transitions are monotonic: `calling -> connected -> ended` or
/// `calling -> ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    /// Initiator is waiting for the responder.
    Calling,
    /// A peer reported connectivity.
    Connected,
    /// Terminal.
    Ended,
}

impl CallStatus {
    /// Returns the status as stored in the database.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Calling => "calling",
            CallStatus::Connected => "connected",
            CallStatus::Ended => "ended",
        }
    }

    /// Whether moving from `self` to `next` is a forward transition.
    #[must_use]
    pub const fn can_transition_to(&self, next: CallStatus) -> bool {
        matches!(
            (self, next),
            (CallStatus::Calling, CallStatus::Connected)
                | (CallStatus::Calling, CallStatus::Ended)
                | (CallStatus::Connected, CallStatus::Ended)
        )
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, CallStatus::Ended)
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "calling" => Ok(CallStatus::Calling),
            "connected" => Ok(CallStatus::Connected),
            "ended" => Ok(CallStatus::Ended),
            other => Err(format!("unknown call status: {other}")),
        }
    }
}

/// One logical call attempt tied to a booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSession {
    pub id: CallId,
    /// Reference to the booking owned by the portal's booking store.
    pub booking_id: String,
    pub status: CallStatus,
    pub initiator_role: Role,
    pub created_at: DateTime<Utc>,
}

impl CallSession {
    /// Create a new session in `calling` status with a fresh ID.
    #[must_use]
    pub fn new(booking_id: impl Into<String>, initiator_role: Role) -> Self {
        Self {
            id: CallId::new(),
            booking_id: booking_id.into(),
            status: CallStatus::Calling,
            initiator_role,
            created_at: Utc::now(),
        }
    }

    /// Whether the session can still be joined.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// Signal message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Ice,
    Hangup,
}

impl SignalKind {
    /// Returns the kind as stored in the signal log (also the metric label).
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Ice => "ice",
            SignalKind::Hangup => "hangup",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "offer" => Ok(SignalKind::Offer),
            "answer" => Ok(SignalKind::Answer),
            "ice" => Ok(SignalKind::Ice),
            "hangup" => Ok(SignalKind::Hangup),
            other => Err(format!("unknown signal kind: {other}")),
        }
    }
}

/// A signal as written by a publisher, before the store assigns identity.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSignal {
    pub call_id: CallId,
    pub sender_role: Role,
    pub kind: SignalKind,
    pub payload: Value,
}

/// A persisted signal.
///
/// `id` is assigned by the store and increases with insertion order; it
/// breaks ties between equal `created_at` values and is the de-duplication
/// key on the consuming side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: i64,
    pub call_id: CallId,
    pub sender_role: Role,
    pub kind: SignalKind,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl Signal {
    /// Consumption order: `created_at` ascending, then `id`.
    pub fn sort_for_delivery(signals: &mut [Signal]) {
        signals.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    }
}

/// Session description type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description exchanged in `offer`/`answer` signals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    #[must_use]
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    #[must_use]
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// Parse a signal payload, requiring the given description type.
    ///
    /// # Errors
    ///
    /// Returns `SignalingError::MalformedSignal` when the payload does not
    /// parse, has the wrong `type`, or carries an empty SDP.
    pub fn from_payload(payload: &Value, expected: SdpType) -> Result<Self, SignalingError> {
        let kind = match expected {
            SdpType::Offer => SignalKind::Offer,
            SdpType::Answer => SignalKind::Answer,
        };

        let description: SessionDescription = serde_json::from_value(payload.clone())
            .map_err(|e| SignalingError::malformed(kind, e.to_string()))?;

        if description.sdp_type != expected {
            return Err(SignalingError::malformed(
                kind,
                format!("expected {kind} description"),
            ));
        }
        if description.sdp.trim().is_empty() {
            return Err(SignalingError::malformed(kind, "empty sdp"));
        }

        Ok(description)
    }

    /// Serialize into a signal payload.
    ///
    /// # Errors
    ///
    /// Returns `SignalingError::Internal` if serialization fails.
    pub fn to_payload(&self) -> Result<Value, SignalingError> {
        serde_json::to_value(self).map_err(|e| SignalingError::Internal(e.to_string()))
    }
}

/// Connectivity candidate exchanged in `ice` signals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate attribute line. Empty means end-of-candidates.
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_m_line_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    #[must_use]
    pub fn new(candidate: impl Into<String>, sdp_mid: &str, sdp_m_line_index: u16) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some(sdp_mid.to_string()),
            sdp_m_line_index: Some(sdp_m_line_index),
            username_fragment: None,
        }
    }

    /// Parse an `ice` signal payload.
    ///
    /// # Errors
    ///
    /// Returns `SignalingError::MalformedSignal` when `candidate` is missing
    /// or when neither `sdpMid` nor `sdpMLineIndex` identifies the media
    /// section.
    pub fn from_payload(payload: &Value) -> Result<Self, SignalingError> {
        let candidate: IceCandidate = serde_json::from_value(payload.clone())
            .map_err(|e| SignalingError::malformed(SignalKind::Ice, e.to_string()))?;

        if candidate.sdp_mid.is_none() && candidate.sdp_m_line_index.is_none() {
            return Err(SignalingError::malformed(
                SignalKind::Ice,
                "sdpMid and sdpMLineIndex are both null",
            ));
        }

        Ok(candidate)
    }

    /// Serialize into a signal payload.
    ///
    /// # Errors
    ///
    /// Returns `SignalingError::Internal` if serialization fails.
    pub fn to_payload(&self) -> Result<Value, SignalingError> {
        serde_json::to_value(self).map_err(|e| SignalingError::Internal(e.to_string()))
    }
}

/// Status text shown to the user for a call attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallDisplayStatus {
    Idle,
    Calling,
    Joining,
    Connected,
    Disconnected,
    Ended,
}

impl CallDisplayStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            CallDisplayStatus::Idle => "Idle",
            CallDisplayStatus::Calling => "Calling...",
            CallDisplayStatus::Joining => "Joining...",
            CallDisplayStatus::Connected => "Connected",
            CallDisplayStatus::Disconnected => "Disconnected",
            CallDisplayStatus::Ended => "Ended",
        }
    }

    /// Whether the attempt has finished (either cleanly or by losing the peer).
    #[must_use]
    pub const fn is_final(&self) -> bool {
        matches!(
            self,
            CallDisplayStatus::Ended | CallDisplayStatus::Disconnected
        )
    }
}

impl fmt::Display for CallDisplayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
