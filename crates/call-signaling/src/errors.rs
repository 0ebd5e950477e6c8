//! Call signaling error types.
//!
//! Each variant maps to a client-safe notice via [`SignalingError::client_message`].
//! Internal details are logged where the error is raised but not shown to users.

use crate::models::SignalKind;
use thiserror::Error;

/// Call signaling error type.
///
/// Propagation policy:
/// - `MediaAcquisition`: aborts the attempt, never retried automatically
/// - `Registry`: aborts session creation; on status updates it is only logged
/// - `SignalPublish`: logged and surfaced, never tears down negotiation
/// - `MalformedSignal`: the offending signal is dropped, processing continues
#[derive(Debug, Error)]
pub enum SignalingError {
    /// Session create/update/query failed against the store.
    #[error("Registry error: {0}")]
    Registry(String),

    /// Appending a signal to the log failed.
    #[error("Signal publish failed: {0}")]
    SignalPublish(String),

    /// Local microphone unavailable or permission denied.
    #[error("Media acquisition failed: {0}")]
    MediaAcquisition(String),

    /// A signal payload failed to parse or to apply to the peer capability.
    #[error("Malformed {kind} signal: {reason}")]
    MalformedSignal { kind: SignalKind, reason: String },

    /// Reading or subscribing to the signal log failed.
    #[error("Signal feed error: {0}")]
    SignalFeed(String),

    /// Responder found no live session for the booking.
    #[error("No active call for booking {0}")]
    NoActiveCall(String),

    /// The session referenced by a notification does not exist or has ended.
    #[error("Call session not found: {0}")]
    SessionNotFound(String),

    /// The session was started by the same role that tried to join it.
    #[error("Role conflict: {0}")]
    RoleConflict(String),

    /// The peer-connection capability failed outside of signal application
    /// (creating the connection, generating an offer or answer).
    #[error("Peer capability error: {0}")]
    Capability(String),

    /// Command sent to a call attempt that has already finished.
    #[error("Call attempt has ended")]
    CallEnded,

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SignalingError {
    pub(crate) fn malformed(kind: SignalKind, reason: impl Into<String>) -> Self {
        SignalingError::MalformedSignal {
            kind,
            reason: reason.into(),
        }
    }

    /// Whether this error ends the call attempt it occurred in.
    #[must_use]
    pub fn ends_attempt(&self) -> bool {
        match self {
            SignalingError::MediaAcquisition(_)
            | SignalingError::Capability(_)
            | SignalingError::Internal(_) => true,
            SignalingError::Registry(_)
            | SignalingError::SignalPublish(_)
            | SignalingError::MalformedSignal { .. }
            | SignalingError::SignalFeed(_)
            | SignalingError::NoActiveCall(_)
            | SignalingError::SessionNotFound(_)
            | SignalingError::RoleConflict(_)
            | SignalingError::CallEnded => false,
        }
    }

    /// Returns a client-safe message for the notice area (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            SignalingError::Registry(_) => "Could not reach the call service.".to_string(),
            SignalingError::SignalPublish(_) | SignalingError::SignalFeed(_) => {
                "Connection to the call service is unstable; still trying.".to_string()
            }
            SignalingError::MediaAcquisition(_) => {
                "Microphone permission denied or unavailable.".to_string()
            }
            SignalingError::NoActiveCall(_) => "No active call yet.".to_string(),
            SignalingError::SessionNotFound(_) => "Session not found.".to_string(),
            SignalingError::RoleConflict(_) => {
                "This call was started from your side and cannot be joined here.".to_string()
            }
            SignalingError::CallEnded => "The call has already ended.".to_string(),
            SignalingError::MalformedSignal { .. }
            | SignalingError::Capability(_)
            | SignalingError::Internal(_) => "An internal error occurred".to_string(),
        }
    }
}
