//! Signal channel: ordered delivery of one call's signals.
//!
//! Live delivery comes from the store's push feed; [`SignalChannel::replay`]
//! covers whatever the feed missed. Both exclude signals authored by the
//! local role. The two paths overlap, so consumers de-duplicate by
//! signal ID.

use crate::errors::SignalingError;
use crate::models::{NewSignal, Signal, SignalKind};
use crate::observability::metrics;
use crate::store::SignalStore;
use common::types::{CallId, Role};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Publish, subscribe to, and replay signals for the local role.
#[derive(Clone)]
pub struct SignalChannel {
    store: Arc<dyn SignalStore>,
    local_role: Role,
}

impl SignalChannel {
    #[must_use]
    pub fn new(store: Arc<dyn SignalStore>, local_role: Role) -> Self {
        Self { store, local_role }
    }

    #[must_use]
    pub fn local_role(&self) -> Role {
        self.local_role
    }

    /// Append one signal to the log.
    ///
    /// # Errors
    ///
    /// Returns `SignalingError::SignalPublish` if the store write fails.
    #[instrument(skip_all, name = "signaling.channel.publish", fields(call_id = %call_id, kind = %kind))]
    pub async fn publish(
        &self,
        call_id: CallId,
        sender_role: Role,
        kind: SignalKind,
        payload: Value,
    ) -> Result<Signal, SignalingError> {
        let new_signal = NewSignal {
            call_id,
            sender_role,
            kind,
            payload,
        };

        match self.store.insert(new_signal).await {
            Ok(signal) => {
                metrics::record_signal_published(kind.as_str(), "success");
                debug!(
                    target: "signaling.channel",
                    call_id = %call_id,
                    signal_id = signal.id,
                    kind = %kind,
                    "Signal published"
                );
                Ok(signal)
            }
            Err(e) => {
                metrics::record_signal_published(kind.as_str(), "error");
                warn!(
                    target: "signaling.channel",
                    call_id = %call_id,
                    kind = %kind,
                    error = %e,
                    "Signal publish failed"
                );
                Err(SignalingError::SignalPublish(e.to_string()))
            }
        }
    }

    /// Forward newly inserted signals for `call_id` to `sink`, in arrival
    /// order, skipping the local role's own.
    ///
    /// Forwarding stops when the returned [`Subscription`] is disposed or
    /// dropped, or when `sink` closes.
    ///
    /// # Errors
    ///
    /// Returns `SignalingError::SignalFeed` if the store feed cannot be opened.
    pub async fn subscribe(
        &self,
        call_id: CallId,
        sink: mpsc::Sender<Signal>,
    ) -> Result<Subscription, SignalingError> {
        let mut feed = self
            .store
            .subscribe_inserts(call_id)
            .await
            .map_err(|e| SignalingError::SignalFeed(e.to_string()))?;

        let cancel_token = CancellationToken::new();
        let task_token = cancel_token.clone();
        let local_role = self.local_role;

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = task_token.cancelled() => break,
                    next = feed.recv() => {
                        let Some(signal) = next else {
                            debug!(target: "signaling.channel", call_id = %call_id, "Signal feed closed");
                            break;
                        };
                        if signal.call_id != call_id || signal.sender_role == local_role {
                            continue;
                        }
                        if sink.send(signal).await.is_err() {
                            break;
                        }
                    }
                }
            }
            feed.close();
        });

        debug!(target: "signaling.channel", call_id = %call_id, "Subscribed to signals");

        Ok(Subscription {
            cancel_token,
            task: Some(task),
        })
    }

    /// All signals of the call from the other role, in consumption order.
    ///
    /// # Errors
    ///
    /// Returns `SignalingError::SignalFeed` if the store query fails.
    pub async fn history(&self, call_id: CallId) -> Result<Vec<Signal>, SignalingError> {
        let mut signals = self
            .store
            .query_by_call(call_id)
            .await
            .map_err(|e| SignalingError::SignalFeed(e.to_string()))?;

        signals.retain(|s| s.call_id == call_id && s.sender_role != self.local_role);
        Signal::sort_for_delivery(&mut signals);
        Ok(signals)
    }

    /// Deliver [`history`](Self::history) to `sink` once.
    ///
    /// Returns the number of signals delivered.
    ///
    /// # Errors
    ///
    /// Returns `SignalingError::SignalFeed` if the store query fails or the
    /// sink closes mid-replay.
    pub async fn replay(
        &self,
        call_id: CallId,
        sink: &mpsc::Sender<Signal>,
    ) -> Result<usize, SignalingError> {
        let signals = self.history(call_id).await?;
        let count = signals.len();
        for signal in signals {
            sink.send(signal)
                .await
                .map_err(|_| SignalingError::SignalFeed("replay sink closed".to_string()))?;
        }
        Ok(count)
    }
}

/// Disposer for a live signal subscription.
#[derive(Debug)]
pub struct Subscription {
    cancel_token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Stop forwarding and wait for the forwarding task to exit.
    pub async fn dispose(mut self) {
        self.cancel_token.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(target: "signaling.channel", error = %e, "Subscription task failed");
            }
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.cancel_token.is_cancelled()
            && self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
