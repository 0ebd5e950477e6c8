//! Background tasks.
//!
//! # Tasks
//!
//! - `join_poller` - Responder-side discovery of an active session (poll + push)
//! - `stale_session_sweeper` - Ends sessions abandoned by crashed clients

pub mod join_poller;
pub mod stale_session_sweeper;

pub use join_poller::{spawn_join_poller, JoinPollerHandle, DEFAULT_JOIN_POLL_INTERVAL_SECONDS};
pub use stale_session_sweeper::{start_stale_session_sweeper, SweeperConfig};
