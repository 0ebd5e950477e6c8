//! Peer connection capability and the controller that drives it.
//!
//! The native peer-connection and media-capture primitives are consumed
//! through [`PeerBackend`], [`PeerConnection`] and [`LocalMedia`]. The
//! engine never implements them; a host binds them to a real WebRTC stack.
//! [`mock`] provides a scriptable implementation for tests.

pub mod controller;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

use crate::models::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

pub use controller::{CallMode, DeliverySource, EndReason, PeerController, PeerSnapshot, PeerState};

/// Public STUN server used when no ICE servers are configured.
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// One ICE server entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
}

/// Configuration handed to the capability when a connection is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcConfiguration {
    #[serde(rename = "iceServers")]
    pub ice_servers: Vec<IceServer>,
}

impl Default for RtcConfiguration {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer {
                urls: vec![DEFAULT_STUN_SERVER.to_string()],
            }],
        }
    }
}

impl RtcConfiguration {
    /// Build from a list of server URLs, one server entry per URL.
    #[must_use]
    pub fn from_urls<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ice_servers: urls
                .into_iter()
                .map(|url| IceServer {
                    urls: vec![url.into()],
                })
                .collect(),
        }
    }
}

/// Connectivity state reported by the capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Notifications raised by a peer connection.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// A local connectivity candidate was gathered.
    LocalCandidate(IceCandidate),
    ConnectionStateChanged(PeerConnectionState),
    /// Remote audio arrived.
    RemoteTrack { track_id: String },
}

/// Errors raised by the capability.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("Media unavailable: {0}")]
    MediaUnavailable(String),

    #[error("Media permission denied")]
    PermissionDenied,

    #[error("Operation failed: {0}")]
    Operation(String),

    #[error("Invalid candidate: {0}")]
    InvalidCandidate(String),

    #[error("Peer connection closed")]
    Closed,
}

/// Captured local audio.
pub trait LocalMedia: Send + Sync {
    fn track_ids(&self) -> Vec<String>;

    /// Enable or disable the outgoing audio (mute).
    fn set_enabled(&mut self, enabled: bool);

    /// Release the capture device. Safe to call more than once.
    fn stop(&mut self);
}

/// One peer-to-peer connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&mut self, track_id: &str) -> Result<(), CapabilityError>;

    async fn create_offer(&mut self) -> Result<SessionDescription, CapabilityError>;

    async fn create_answer(&mut self) -> Result<SessionDescription, CapabilityError>;

    async fn set_local_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), CapabilityError>;

    async fn set_remote_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), CapabilityError>;

    async fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), CapabilityError>;

    /// Close the connection. Safe to call more than once.
    async fn close(&mut self);
}

/// Factory for media and connections.
#[async_trait]
pub trait PeerBackend: Send + Sync {
    async fn acquire_audio(&self) -> Result<Box<dyn LocalMedia>, CapabilityError>;

    /// Create a connection that reports its events on `events`.
    async fn create_connection(
        &self,
        config: &RtcConfiguration,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Box<dyn PeerConnection>, CapabilityError>;
}
