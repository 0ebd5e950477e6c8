//! End-to-end call flows between an admin and a client.
//!
//! Both participants run against shared in-memory stores and mock peer
//! capabilities from `signaling-test-utils`.

use call_signaling::models::{CallDisplayStatus, CallStatus, SignalKind};
use call_signaling::peer::{PeerConnectionState, PeerState};
use call_signaling::{CallConfig, SignalingError};
use common::types::Role;
use signaling_test_utils::*;
use std::time::Duration;

fn count_kind(harness: &CallHarness, call_id: common::types::CallId, kind: SignalKind) -> usize {
    harness
        .signals
        .signals_for(call_id)
        .iter()
        .filter(|s| s.kind == kind)
        .count()
}

/// Admin starts, client joins, both reach Connected.
#[tokio::test]
async fn test_booking_42_admin_and_client_connect() -> Result<(), anyhow::Error> {
    let harness = CallHarness::new();
    harness.admin.probe.auto_connect();
    harness.client.probe.auto_connect();

    let admin_call = harness.admin.client.start_call("booking-42").await?;
    assert_eq!(admin_call.status(), CallDisplayStatus::Calling);

    let call_id = admin_call.call_id();
    let sessions = harness.sessions.sessions();
    assert_eq!(sessions.len(), 1);
    let session = sessions.first().expect("session should exist");
    assert_eq!(session.id, call_id);
    assert_eq!(session.booking_id, "booking-42");
    assert_eq!(session.initiator_role, Role::Admin);

    wait_until("offer published", || count_kind(&harness, call_id, SignalKind::Offer) == 1).await;
    assert_eq!(harness.sessions.status_of(call_id), Some(CallStatus::Calling));

    let client_call = harness.client.client.join_call("booking-42").await?;
    assert_eq!(client_call.call_id(), call_id);

    wait_for_status(&admin_call, CallDisplayStatus::Connected).await;
    wait_for_status(&client_call, CallDisplayStatus::Connected).await;

    let answers: Vec<_> = harness
        .signals
        .signals_for(call_id)
        .into_iter()
        .filter(|s| s.kind == SignalKind::Answer)
        .collect();
    assert_eq!(answers.len(), 1);
    assert_eq!(answers.first().map(|s| s.sender_role), Some(Role::Client));

    wait_until("session marked connected", || {
        harness.sessions.status_of(call_id) == Some(CallStatus::Connected)
    })
    .await;

    Ok(())
}

#[tokio::test]
async fn test_join_without_active_call_reports_no_active_call() {
    let harness = CallHarness::new();

    let err = harness
        .client
        .client
        .join_call("booking-none")
        .await
        .expect_err("join should fail without a session");

    assert!(matches!(err, SignalingError::NoActiveCall(_)));
    assert_eq!(err.client_message(), "No active call yet.");
    assert_eq!(harness.client.probe.connections_created(), 0);
}

#[tokio::test]
async fn test_initiator_hangup_before_connected_ends_both_sides() -> Result<(), anyhow::Error> {
    let harness = CallHarness::new();
    let booking = unique_booking_id();

    let admin_call = harness.admin.client.start_call(&booking).await?;
    let client_call = harness.client.client.join_call(&booking).await?;
    let call_id = admin_call.call_id();

    wait_until("client applied offer", || {
        harness.client.probe.remote_description().is_some()
    })
    .await;

    admin_call.hangup().await?;

    assert_eq!(
        within("admin end", admin_call.wait_for_end()).await,
        CallDisplayStatus::Ended
    );
    assert_eq!(
        within("client end", client_call.wait_for_end()).await,
        CallDisplayStatus::Ended
    );

    assert!(harness.admin.probe.media_stopped());
    assert!(harness.client.probe.media_stopped());
    assert!(harness.admin.probe.is_closed());
    assert!(harness.client.probe.is_closed());

    wait_until("session ended", || {
        harness.sessions.status_of(call_id) == Some(CallStatus::Ended)
    })
    .await;

    // The remote hangup is not echoed back.
    let hangups: Vec<_> = harness
        .signals
        .signals_for(call_id)
        .into_iter()
        .filter(|s| s.kind == SignalKind::Hangup)
        .collect();
    assert_eq!(hangups.len(), 1);
    assert_eq!(hangups.first().map(|s| s.sender_role), Some(Role::Admin));

    Ok(())
}

#[tokio::test]
async fn test_double_hangup_publishes_once() -> Result<(), anyhow::Error> {
    let harness = CallHarness::new();
    let booking = unique_booking_id();

    let admin_call = harness.admin.client.start_call(&booking).await?;
    let call_id = admin_call.call_id();

    admin_call.hangup().await?;
    admin_call.hangup().await?;

    assert_eq!(admin_call.wait_for_end().await, CallDisplayStatus::Ended);
    assert_eq!(count_kind(&harness, call_id, SignalKind::Hangup), 1);
    assert!(matches!(
        admin_call.toggle_mute().await,
        Err(SignalingError::CallEnded)
    ));

    Ok(())
}

#[tokio::test]
async fn test_connection_loss_shows_disconnected_without_hangup() -> Result<(), anyhow::Error> {
    let harness = CallHarness::new();
    harness.admin.probe.auto_connect();
    harness.client.probe.auto_connect();
    let booking = unique_booking_id();

    let admin_call = harness.admin.client.start_call(&booking).await?;
    let client_call = harness.client.client.join_call(&booking).await?;
    let call_id = admin_call.call_id();

    wait_for_status(&admin_call, CallDisplayStatus::Connected).await;
    wait_for_status(&client_call, CallDisplayStatus::Connected).await;

    assert!(harness
        .admin
        .probe
        .set_connection_state(PeerConnectionState::Disconnected));

    assert_eq!(
        within("admin end", admin_call.wait_for_end()).await,
        CallDisplayStatus::Disconnected
    );
    assert!(harness.admin.probe.media_stopped());
    assert_eq!(count_kind(&harness, call_id, SignalKind::Hangup), 0);

    wait_until("session ended", || {
        harness.sessions.status_of(call_id) == Some(CallStatus::Ended)
    })
    .await;

    // The client only learns about it from its own capability.
    assert_eq!(client_call.status(), CallDisplayStatus::Connected);
    harness.client.probe.set_connection_state(PeerConnectionState::Failed);
    assert_eq!(
        within("client end", client_call.wait_for_end()).await,
        CallDisplayStatus::Disconnected
    );

    Ok(())
}

#[tokio::test]
async fn test_toggle_mute_flips_local_audio() -> Result<(), anyhow::Error> {
    let harness = CallHarness::new();
    let admin_call = harness.admin.client.start_call(&unique_booking_id()).await?;

    assert!(admin_call.toggle_mute().await?);
    assert!(!harness.admin.probe.media_enabled());

    let snapshot = admin_call.snapshot().await?;
    assert!(snapshot.peer.muted);

    assert!(!admin_call.toggle_mute().await?);
    assert!(harness.admin.probe.media_enabled());

    admin_call.cancel();
    admin_call.wait_for_end().await;
    Ok(())
}

#[tokio::test]
async fn test_local_candidates_reach_the_other_side() -> Result<(), anyhow::Error> {
    let harness = CallHarness::new();
    harness
        .admin
        .probe
        .gather_candidates(vec![host_candidate(1), host_candidate(2)]);
    harness.client.probe.gather_candidates(vec![host_candidate(3)]);
    let booking = unique_booking_id();

    let admin_call = harness.admin.client.start_call(&booking).await?;
    let client_call = harness.client.client.join_call(&booking).await?;

    wait_until("client applied admin candidates", || {
        harness.client.probe.applied_candidates().len() == 2
    })
    .await;
    wait_until("admin applied client candidate", || {
        harness.admin.probe.applied_candidates().len() == 1
    })
    .await;

    assert_eq!(
        harness.client.probe.applied_candidates(),
        vec![host_candidate(1), host_candidate(2)]
    );
    assert_eq!(harness.admin.probe.applied_candidates(), vec![host_candidate(3)]);

    let snapshot = client_call.snapshot().await?;
    assert_eq!(snapshot.peer.applied_candidates, 2);
    assert_eq!(snapshot.peer.pending_candidates, 0);
    assert_eq!(snapshot.peer.state, PeerState::Negotiating);

    admin_call.hangup().await?;
    within("client end", client_call.wait_for_end()).await;
    Ok(())
}

#[tokio::test]
async fn test_cancel_releases_resources_without_ending_session() -> Result<(), anyhow::Error> {
    let harness = CallHarness::new();
    let admin_call = harness.admin.client.start_call(&unique_booking_id()).await?;
    let call_id = admin_call.call_id();

    admin_call.cancel();

    assert_eq!(
        within("cancel", admin_call.wait_for_end()).await,
        CallDisplayStatus::Ended
    );
    assert!(harness.admin.probe.media_stopped());
    assert!(harness.admin.probe.is_closed());
    assert_eq!(count_kind(&harness, call_id, SignalKind::Hangup), 0);
    assert_eq!(harness.sessions.status_of(call_id), Some(CallStatus::Calling));

    Ok(())
}

#[tokio::test]
async fn test_dropping_every_handle_tears_down() -> Result<(), anyhow::Error> {
    let harness = CallHarness::new();
    let admin_call = harness.admin.client.start_call(&unique_booking_id()).await?;

    drop(admin_call);

    wait_until("media released", || harness.admin.probe.media_stopped()).await;
    assert!(harness.admin.probe.is_closed());
    Ok(())
}

#[tokio::test]
async fn test_restart_hangs_up_peer_on_superseded_call() -> Result<(), anyhow::Error> {
    let harness = CallHarness::new();
    let booking = unique_booking_id();

    let first_call = harness.admin.client.start_call(&booking).await?;
    let client_call = harness.client.client.join_call(&booking).await?;
    assert_eq!(client_call.call_id(), first_call.call_id());
    first_call.cancel();

    let second_call = harness.admin.client.start_call(&booking).await?;
    assert_ne!(second_call.call_id(), first_call.call_id());

    assert_eq!(
        within("client end", client_call.wait_for_end()).await,
        CallDisplayStatus::Ended
    );
    assert_eq!(
        harness.sessions.status_of(first_call.call_id()),
        Some(CallStatus::Ended)
    );
    assert_eq!(second_call.status(), CallDisplayStatus::Calling);

    second_call.cancel();
    Ok(())
}

#[tokio::test]
async fn test_same_role_restart_ends_superseded_attempt() -> Result<(), anyhow::Error> {
    let harness = CallHarness::new();
    let booking = unique_booking_id();

    let first_call = harness.admin.client.start_call(&booking).await?;
    let second_call = harness.admin.client.start_call(&booking).await?;
    assert_ne!(second_call.call_id(), first_call.call_id());

    assert_eq!(
        within("superseded end", first_call.wait_for_end()).await,
        CallDisplayStatus::Ended
    );
    assert!(matches!(
        first_call.toggle_mute().await,
        Err(SignalingError::CallEnded)
    ));
    assert_eq!(
        harness.sessions.status_of(first_call.call_id()),
        Some(CallStatus::Ended)
    );
    // The peer-directed hangup is still the only one on the old session.
    assert_eq!(count_kind(&harness, first_call.call_id(), SignalKind::Hangup), 1);

    assert_eq!(second_call.status(), CallDisplayStatus::Calling);
    assert_eq!(
        harness.sessions.status_of(second_call.call_id()),
        Some(CallStatus::Calling)
    );

    second_call.cancel();
    Ok(())
}

#[tokio::test]
async fn test_restart_from_another_device_releases_old_media() -> Result<(), anyhow::Error> {
    let harness = CallHarness::new();
    let old_device = harness.participant(Role::Admin);
    let booking = unique_booking_id();

    let first_call = old_device.client.start_call(&booking).await?;
    let second_call = harness.admin.client.start_call(&booking).await?;

    within("superseded end", first_call.wait_for_end()).await;
    assert!(old_device.probe.media_stopped());
    assert!(old_device.probe.is_closed());

    assert!(!harness.admin.probe.media_stopped());
    assert_eq!(second_call.status(), CallDisplayStatus::Calling);

    second_call.cancel();
    Ok(())
}

#[tokio::test]
async fn test_zero_intervals_do_not_stall_attempts() -> Result<(), anyhow::Error> {
    let harness = CallHarness::with_config(CallConfig {
        join_poll_interval: Duration::ZERO,
        resync_interval: Duration::ZERO,
        ..fast_config()
    });
    let booking = unique_booking_id();

    let admin_call = harness.admin.client.start_call(&booking).await?;
    let client_call = harness.client.client.join_call(&booking).await?;
    let call_id = admin_call.call_id();

    wait_until("client applied offer", || {
        harness.client.probe.remote_description().is_some()
    })
    .await;
    assert_eq!(admin_call.status(), CallDisplayStatus::Calling);
    assert!(admin_call.toggle_mute().await?);

    admin_call.hangup().await?;

    assert_eq!(
        within("admin end", admin_call.wait_for_end()).await,
        CallDisplayStatus::Ended
    );
    assert_eq!(
        within("client end", client_call.wait_for_end()).await,
        CallDisplayStatus::Ended
    );
    assert!(harness.admin.probe.media_stopped());
    assert!(harness.client.probe.media_stopped());
    wait_until("session ended", || {
        harness.sessions.status_of(call_id) == Some(CallStatus::Ended)
    })
    .await;

    Ok(())
}

#[tokio::test]
async fn test_denied_media_on_join_leaves_initiator_waiting() -> Result<(), anyhow::Error> {
    let harness = CallHarness::new();
    let booking = unique_booking_id();
    harness.client.probe.deny_media();

    let admin_call = harness.admin.client.start_call(&booking).await?;
    let err = harness
        .client
        .client
        .join_call(&booking)
        .await
        .expect_err("join should fail without a microphone");

    assert!(matches!(err, SignalingError::MediaAcquisition(_)));
    assert_eq!(harness.client.probe.connections_created(), 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(admin_call.status(), CallDisplayStatus::Calling);

    admin_call.cancel();
    Ok(())
}
