//! Actor model for call attempts.
//!
//! One [`CallAttempt`] actor per participant per call. The actor owns the
//! peer controller and serializes three inputs with `tokio::select!`:
//!
//! - commands from [`CallAttemptHandle`] (hangup, mute, snapshot)
//! - remote signals from the signal channel subscription
//! - events from the peer capability
//!
//! No call state is shared between tasks; the handle observes status and
//! notices through `watch` channels.

pub mod call_attempt;
pub mod messages;

pub use call_attempt::{CallAttempt, CallAttemptHandle};
pub use messages::{AttemptMessage, AttemptSnapshot};
