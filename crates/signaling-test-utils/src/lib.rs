//! # Signaling Test Utilities
//!
//! Shared test utilities for the call signaling engine.
//!
//! ## Modules
//!
//! - `harness` - Two participants (admin and client) sharing in-memory stores
//! - `fixtures` - Booking IDs, candidates and raw signal payloads
//!
//! ## Usage
//!
//! ```rust,ignore
//! use signaling_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let harness = CallHarness::new();
//!     let booking = unique_booking_id();
//!
//!     let admin_call = harness.admin.client.start_call(&booking).await.unwrap();
//!     let client_call = harness.client.client.join_call(&booking).await.unwrap();
//!
//!     harness.connect_both();
//!     wait_for_status(&admin_call, CallDisplayStatus::Connected).await;
//! }
//! ```

pub mod fixtures;
pub mod harness;

pub use fixtures::*;
pub use harness::*;
