//! Two-party call harness.
//!
//! Both participants share one pair of in-memory stores, the way two
//! browsers share the hosted database. Each has its own mock peer capability
//! so the test can observe and drive either side.

use call_signaling::config::CallConfig;
use call_signaling::models::CallDisplayStatus;
use call_signaling::peer::mock::{MockPeerBackend, MockPeerProbe};
use call_signaling::peer::{PeerConnectionState, RtcConfiguration};
use call_signaling::store::{MemorySessionStore, MemorySignalStore};
use call_signaling::{CallAttemptHandle, CallClient};
use common::types::Role;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Default wait used by the assertion helpers.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(5);

/// Engine settings with short intervals so fallback paths run quickly.
pub fn fast_config() -> CallConfig {
    CallConfig {
        rtc: RtcConfiguration::default(),
        join_poll_interval: Duration::from_millis(50),
        resync_interval: Duration::from_millis(50),
        signal_buffer: 64,
    }
}

/// One side of the call.
#[derive(Clone)]
pub struct Participant {
    pub client: CallClient,
    pub probe: MockPeerProbe,
}

impl Participant {
    fn new(
        role: Role,
        sessions: &MemorySessionStore,
        signals: &MemorySignalStore,
        config: CallConfig,
    ) -> Self {
        let (backend, probe) = MockPeerBackend::new();
        let client = CallClient::new(
            role,
            Arc::new(sessions.clone()),
            Arc::new(signals.clone()),
            Arc::new(backend),
            config,
        );
        Self { client, probe }
    }

    /// Report connectivity on this side's capability.
    pub fn connect(&self) {
        assert!(
            self.probe.set_connection_state(PeerConnectionState::Connected),
            "no live connection to report connectivity on"
        );
    }
}

/// Admin (initiator) and client (responder) sharing stores.
pub struct CallHarness {
    pub sessions: MemorySessionStore,
    pub signals: MemorySignalStore,
    pub admin: Participant,
    pub client: Participant,
    config: CallConfig,
}

impl CallHarness {
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    pub fn with_config(config: CallConfig) -> Self {
        let sessions = MemorySessionStore::new();
        let signals = MemorySignalStore::new();
        let admin = Participant::new(Role::Admin, &sessions, &signals, config.clone());
        let client = Participant::new(Role::Client, &sessions, &signals, config.clone());
        Self {
            sessions,
            signals,
            admin,
            client,
            config,
        }
    }

    /// Another device for `role` on the same stores, with its own capability.
    pub fn participant(&self, role: Role) -> Participant {
        Participant::new(role, &self.sessions, &self.signals, self.config.clone())
    }

    /// Report connectivity on both sides.
    pub fn connect_both(&self) {
        self.admin.connect();
        self.client.connect();
    }
}

impl Default for CallHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait until `handle` shows `expected`, panicking after [`DEFAULT_WAIT`].
pub async fn wait_for_status(handle: &CallAttemptHandle, expected: CallDisplayStatus) {
    let mut status = handle.watch_status();
    let reached = match tokio::time::timeout(DEFAULT_WAIT, status.wait_for(|s| *s == expected)).await {
        Ok(Ok(_)) => Some(true),
        Ok(Err(_)) => Some(false),
        Err(_) => None,
    };
    match reached {
        Some(true) => {}
        Some(false) => panic!(
            "attempt stopped at {} before reaching {expected}",
            handle.status()
        ),
        None => panic!(
            "timed out waiting for {expected}, status is {}",
            handle.status()
        ),
    }
}

/// Poll `condition` until it holds, panicking after [`DEFAULT_WAIT`].
pub async fn wait_until<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + DEFAULT_WAIT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Await `future`, panicking after [`DEFAULT_WAIT`].
pub async fn within<F, T>(what: &str, future: F) -> T
where
    F: Future<Output = T>,
{
    match tokio::time::timeout(DEFAULT_WAIT, future).await {
        Ok(value) => value,
        Err(_) => panic!("timed out waiting for {what}"),
    }
}
