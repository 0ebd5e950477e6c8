//! Call Signaling Engine Library
//!
//! Peer-to-peer audio calls between a portal admin and a client, where the
//! only rendezvous is a shared store: a table of call sessions and an
//! append-only log of signals (offer, answer, ICE candidate, hangup).
//!
//! # Architecture
//!
//! ```text
//! CallClient (one per participant)
//!   ├── CallRegistry      -> SessionStore (call_sessions)
//!   ├── SignalChannel     -> SignalStore  (call_signals, push + replay)
//!   ├── JoinPoller        (responder discovery, poll + push)
//!   └── CallAttempt actor (one per call the participant is in)
//!         └── PeerController -> PeerBackend / PeerConnection / LocalMedia
//! ```
//!
//! # Key Design Decisions
//!
//! - **Owned call attempts**: each call is an actor task with one mailbox
//!   per input source; callers hold a cloneable [`CallAttemptHandle`].
//! - **Push with replay**: live delivery may drop or duplicate rows; the
//!   attempt replays the log until connected and the controller
//!   de-duplicates by signal ID.
//! - **One live session per booking**: a new initiation supersedes earlier
//!   sessions; the store rejects concurrent duplicates.
//!
//! # Modules
//!
//! - `actors` - Call attempt actor and its handle
//! - `channel` - Ordered signal delivery and replay
//! - `client` - Participant entry point
//! - `config` - Engine and service configuration
//! - `errors` - Error types
//! - `models` - Sessions, signals and payload formats
//! - `observability` - Prometheus metrics
//! - `peer` - Peer capability seams and the negotiation state machine
//! - `registry` - Call session registry
//! - `store` - Store traits with in-memory and Postgres implementations
//! - `tasks` - Join poller and stale session sweeper

pub mod actors;
pub mod channel;
pub mod client;
pub mod config;
pub mod errors;
pub mod models;
pub mod observability;
pub mod peer;
pub mod registry;
pub mod store;
pub mod tasks;

pub use actors::{AttemptSnapshot, CallAttemptHandle};
pub use client::CallClient;
pub use config::CallConfig;
pub use errors::SignalingError;
pub use models::{CallDisplayStatus, CallSession, CallStatus, Signal, SignalKind};
pub use registry::CallRegistry;
