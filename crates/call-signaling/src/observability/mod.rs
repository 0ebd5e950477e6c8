//! Observability for the call signaling engine.
//!
//! All spans use `#[instrument(skip_all)]` with explicit field allow-listing.
//! SDP and candidate payloads are never logged or used as labels; they carry
//! network addresses.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `signaling_signals_published_total` | Counter | `kind`, `status` | Publish attempts |
//! | `signaling_signals_received_total` | Counter | `kind`, `source` | Signals applied by a controller |
//! | `signaling_signals_duplicate_total` | Counter | `kind` | Redeliveries skipped |
//! | `signaling_signals_malformed_total` | Counter | `kind` | Signals dropped as unusable |
//! | `signaling_call_attempts_total` | Counter | `mode` | Attempts started |
//! | `signaling_call_attempts_active` | Gauge | none | Attempts currently running |
//! | `signaling_calls_ended_total` | Counter | `reason` | Attempt outcomes |
//! | `signaling_store_operation_duration_seconds` | Histogram | `operation`, `status` | Store latency |
//! | `signaling_sessions_swept_total` | Counter | none | Stale sessions ended |
//! | `signaling_join_discoveries_total` | Counter | `source` | How responders found a call |

pub mod metrics;

pub use metrics::init_metrics_recorder;
