//! Message types for call attempt actors.
//!
//! Request/reply uses `tokio::sync::oneshot`.

use crate::errors::SignalingError;
use crate::models::CallDisplayStatus;
use crate::peer::PeerSnapshot;
use common::types::CallId;
use tokio::sync::oneshot;

/// Messages sent to a `CallAttempt`.
#[derive(Debug)]
pub enum AttemptMessage {
    /// Hang up from this side.
    Hangup {
        /// `Ok(false)` if the call had already ended.
        respond_to: oneshot::Sender<Result<bool, SignalingError>>,
    },

    /// Flip the outgoing audio.
    ToggleMute {
        /// New muted flag.
        respond_to: oneshot::Sender<bool>,
    },

    GetSnapshot {
        respond_to: oneshot::Sender<AttemptSnapshot>,
    },
}

/// Point-in-time view of a call attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptSnapshot {
    pub call_id: CallId,
    pub booking_id: String,
    pub status: CallDisplayStatus,
    pub peer: PeerSnapshot,
}
