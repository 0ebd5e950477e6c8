//! Responder discovery through `CallClient::watch_for_call`.

use call_signaling::models::CallDisplayStatus;
use signaling_test_utils::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

#[tokio::test]
async fn test_watch_finds_call_through_push() -> Result<(), anyhow::Error> {
    let harness = CallHarness::new();
    harness.admin.probe.auto_connect();
    harness.client.probe.auto_connect();
    let booking = unique_booking_id();
    let (found_tx, mut found_rx) = mpsc::unbounded_channel();

    let poller = harness
        .client
        .client
        .watch_for_call(&booking, move |session| {
            let _ = found_tx.send(session);
        })
        .await;

    let admin_call = harness.admin.client.start_call(&booking).await?;

    let session = within("session found", found_rx.recv())
        .await
        .expect("on_found should deliver the session");
    assert_eq!(session.id, admin_call.call_id());
    assert_eq!(within("poller stop", poller.wait()).await.map(|s| s.id), Some(session.id));

    let client_call = harness.client.client.join_session(session.id).await?;
    wait_for_status(&client_call, CallDisplayStatus::Connected).await;

    admin_call.hangup().await?;
    within("client end", client_call.wait_for_end()).await;
    Ok(())
}

#[tokio::test]
async fn test_watch_falls_back_to_polling_when_push_is_dropped() -> Result<(), anyhow::Error> {
    let harness = CallHarness::new();
    harness.sessions.set_drop_notifications(true);
    let booking = unique_booking_id();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);

    let poller = harness
        .client
        .client
        .watch_for_call(&booking, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await;

    let admin_call = harness.admin.client.start_call(&booking).await?;

    let found = within("poller found session", poller.wait()).await;
    assert_eq!(found.map(|s| s.id), Some(admin_call.call_id()));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    admin_call.cancel();
    Ok(())
}

#[tokio::test]
async fn test_cancelled_watch_never_fires() {
    let harness = CallHarness::new();
    let booking = unique_booking_id();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);

    let poller = harness
        .client
        .client
        .watch_for_call(&booking, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await;
    poller.cancel();
    assert!(within("poller stop", poller.wait()).await.is_none());

    let admin_call = harness
        .admin
        .client
        .start_call(&booking)
        .await
        .expect("start should succeed");
    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    admin_call.cancel();
}
