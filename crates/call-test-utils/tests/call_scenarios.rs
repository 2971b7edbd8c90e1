//! End-to-end call scenarios: session controllers talking through a real
//! relay over WebSocket, with mock media and negotiation.

use std::time::Duration;

use call_session::testing::{MockMediaDevices, MockNegotiationFactory};
use call_session::{CallError, CallRole, CallSnapshot, CallState, EndReason};
use call_test_utils::{uid, RawClient, TestClient, TestRelayServer};
use signaling_protocol::{CallerProfile, ServerFrame, SignalingMessage, UserRole};

const QUIET: Duration = Duration::from_millis(200);

/// Drive `caller` -> `callee` to `Connected`.
async fn connect_call(caller: &mut TestClient, callee: &mut TestClient) {
    caller
        .handle()
        .initiate(callee.user_id().clone())
        .await
        .unwrap();
    callee.wait_incoming().await;
    callee.handle().accept_locally().await.unwrap();

    caller.wait_state(CallState::Connected).await;
    callee.wait_state(CallState::Connected).await;
}

fn assert_released(client: &TestClient) {
    assert_eq!(client.devices().live_count(), 0, "{} leaked media", client.user_id());
    for stream in client.devices().streams() {
        assert_eq!(stream.stop_count(), 1);
    }
    for engine in client.factory().engines() {
        assert_eq!(engine.close_count(), 1);
    }
}

// ============================================================================
// Scenarios
// ============================================================================

/// Scenario A: doc1 and pat1 register, pat1 calls doc1, doc1 accepts, both
/// connect after negotiation.
#[tokio::test]
async fn test_scenario_a_call_connects() {
    let server = TestRelayServer::spawn().await.unwrap();
    let mut doc = TestClient::connect(&server, "doc1").await.unwrap();
    let mut pat = TestClient::connect(&server, "pat1").await.unwrap();

    pat.handle().initiate(uid("doc1")).await.unwrap();

    let caller = doc.wait_incoming().await;
    assert_eq!(caller.id, uid("pat1"));
    assert_eq!(caller.name, "Test pat1");
    assert_eq!(caller.role, UserRole::Patient);
    assert_eq!(server.partner_of(&uid("doc1")).await, Some(uid("pat1")));

    doc.handle().accept_locally().await.unwrap();

    pat.wait_state(CallState::Connecting).await;
    doc.wait_state(CallState::Connecting).await;
    let pat_connected = pat.wait_state(CallState::Connected).await;
    let doc_connected = doc.wait_state(CallState::Connected).await;

    assert_eq!(pat_connected.role, Some(CallRole::Initiator));
    assert_eq!(doc_connected.role, Some(CallRole::Responder));
    assert_eq!(doc_connected.peer_profile.map(|p| p.id), Some(uid("pat1")));

    let pat_snapshot = pat.snapshot().await;
    assert!(pat_snapshot.local_media.is_some());
    assert!(pat_snapshot.remote_media.is_some());

    let pat_engine = pat.factory().last_engine().unwrap();
    let doc_engine = doc.factory().last_engine().unwrap();
    eventually(|| !pat_engine.applied_candidates().is_empty()).await;
    eventually(|| !doc_engine.applied_candidates().is_empty()).await;
}

/// Scenario B: calling a user who never registered ends as unreachable.
#[tokio::test]
async fn test_scenario_b_unreachable() {
    let server = TestRelayServer::spawn().await.unwrap();
    let mut pat = TestClient::connect(&server, "pat1").await.unwrap();

    pat.handle().initiate(uid("doc1")).await.unwrap();

    assert_eq!(pat.wait_ended().await, (uid("doc1"), EndReason::Unreachable));
    assert_eq!(pat.snapshot().await, CallSnapshot::idle());
    assert_released(&pat);
    assert_eq!(server.partner_of(&uid("pat1")).await, None);
}

/// Scenario C: the callee's channel drops mid-call; the caller is told.
#[tokio::test]
async fn test_scenario_c_callee_drops() {
    let server = TestRelayServer::spawn().await.unwrap();
    let mut doc = TestClient::connect(&server, "doc1").await.unwrap();
    let mut pat = TestClient::connect(&server, "pat1").await.unwrap();
    connect_call(&mut pat, &mut doc).await;

    doc.disconnect().await;

    assert_eq!(pat.wait_ended().await, (uid("doc1"), EndReason::RemoteEnded));
    assert_eq!(doc.wait_ended().await.1, EndReason::ChannelClosed);
    assert_eq!(pat.snapshot().await.state, CallState::Idle);
    assert_released(&pat);
    assert_released(&doc);
    assert_eq!(server.status().await.unwrap().active_pairings, 0);
}

/// Scenario D: a second caller gets busy; the first pairing is untouched.
#[tokio::test]
async fn test_scenario_d_second_caller_busy() {
    let server = TestRelayServer::spawn().await.unwrap();
    let mut doc1 = TestClient::connect(&server, "doc1").await.unwrap();
    let mut pat = TestClient::connect(&server, "pat1").await.unwrap();
    let mut doc2 = TestClient::connect(&server, "doc2").await.unwrap();

    pat.handle().initiate(uid("doc1")).await.unwrap();
    doc1.wait_incoming().await;

    doc2.handle().initiate(uid("doc1")).await.unwrap();

    assert_eq!(doc2.wait_ended().await, (uid("doc1"), EndReason::Busy));
    assert_eq!(server.partner_of(&uid("doc1")).await, Some(uid("pat1")));
    assert_eq!(server.partner_of(&uid("doc2")).await, None);

    doc1.handle().accept_locally().await.unwrap();
    pat.wait_state(CallState::Connected).await;
    doc1.wait_state(CallState::Connected).await;
    assert_eq!(doc1.snapshot().await.peer_id, Some(uid("pat1")));
}

/// Two invites racing for the same callee: exactly one pairs.
#[tokio::test]
async fn test_racing_invites_pair_exactly_one() {
    let server = TestRelayServer::spawn().await.unwrap();
    let mut doc = TestClient::connect(&server, "doc1").await.unwrap();
    let mut pat1 = TestClient::connect(&server, "pat1").await.unwrap();
    let mut pat2 = TestClient::connect(&server, "pat2").await.unwrap();

    let (r1, r2) = tokio::join!(
        pat1.handle().initiate(uid("doc1")),
        pat2.handle().initiate(uid("doc1")),
    );
    r1.unwrap();
    r2.unwrap();

    let caller = doc.wait_incoming().await;
    let (mut winner, mut loser) = if caller.id == uid("pat1") {
        (pat1, pat2)
    } else {
        (pat2, pat1)
    };

    assert_eq!(loser.wait_ended().await.1, EndReason::Busy);
    assert_eq!(server.partner_of(&uid("doc1")).await, Some(caller.id));

    doc.handle().accept_locally().await.unwrap();
    winner.wait_state(CallState::Connected).await;
    winner.expect_no_end(QUIET).await;
}

// ============================================================================
// Properties
// ============================================================================

/// P1: while A and B are paired, invites from or to a third user are busy.
#[tokio::test]
async fn test_pairing_exclusivity() {
    let server = TestRelayServer::spawn().await.unwrap();
    let mut a = RawClient::online(&server, &uid("a")).await.unwrap();
    let mut b = RawClient::online(&server, &uid("b")).await.unwrap();
    let mut c = RawClient::online(&server, &uid("c")).await.unwrap();

    let invite = |from: &str, to: &str| SignalingMessage::Invite {
        from: uid(from),
        to: uid(to),
        caller: CallerProfile::new(uid(from), from, UserRole::Patient),
    };

    a.signal(invite("a", "b")).await.unwrap();
    assert!(matches!(
        b.recv_non_presence().await,
        ServerFrame::Signal(SignalingMessage::Invite { .. })
    ));

    c.signal(invite("c", "a")).await.unwrap();
    assert_eq!(
        c.recv_non_presence().await,
        ServerFrame::UserBusy { user_id: uid("a") }
    );

    a.signal(invite("a", "c")).await.unwrap();
    assert_eq!(
        a.recv_non_presence().await,
        ServerFrame::UserBusy { user_id: uid("c") }
    );

    assert_eq!(server.partner_of(&uid("a")).await, Some(uid("b")));
    assert_eq!(server.partner_of(&uid("b")).await, Some(uid("a")));
    assert_eq!(server.partner_of(&uid("c")).await, None);
}

/// P2: ending twice releases once and sends one End.
#[tokio::test]
async fn test_idempotent_teardown() {
    let server = TestRelayServer::spawn().await.unwrap();
    let mut doc = TestClient::connect(&server, "doc1").await.unwrap();
    let mut pat = TestClient::connect(&server, "pat1").await.unwrap();
    connect_call(&mut pat, &mut doc).await;

    pat.handle().end_call().await.unwrap();
    pat.handle().end_call().await.unwrap();

    assert_eq!(pat.wait_ended().await.1, EndReason::LocalEnded);
    assert_eq!(doc.wait_ended().await, (uid("pat1"), EndReason::RemoteEnded));
    doc.expect_no_end(QUIET).await;
    assert_released(&pat);
    assert_released(&doc);

    // Ending after the remote End is a no-op: nothing reaches the relay.
    let dropped = server.metrics().messages_dropped();
    doc.handle().end_call().await.unwrap();
    server.status().await.unwrap();
    assert_eq!(server.metrics().messages_dropped(), dropped);
    assert_released(&doc);
}

/// P3: Invite then End from one sender arrive in order.
#[tokio::test]
async fn test_per_channel_ordering() {
    let server = TestRelayServer::spawn().await.unwrap();
    let mut doc = TestClient::connect(&server, "doc1").await.unwrap();
    let mut pat = RawClient::online(&server, &uid("pat1")).await.unwrap();

    for _ in 0..5 {
        pat.signal(SignalingMessage::Invite {
            from: uid("pat1"),
            to: uid("doc1"),
            caller: CallerProfile::new(uid("pat1"), "Pat", UserRole::Patient),
        })
        .await
        .unwrap();
        pat.signal(SignalingMessage::End {
            from: uid("pat1"),
            to: uid("doc1"),
        })
        .await
        .unwrap();

        assert_eq!(doc.wait_incoming().await.id, uid("pat1"));
        assert_eq!(doc.wait_ended().await, (uid("pat1"), EndReason::RemoteEnded));
        assert_eq!(doc.snapshot().await.state, CallState::Idle);
    }
}

/// P4: an invite to an offline user gets one unreachable reply and no pairing.
#[tokio::test]
async fn test_unreachable_round_trip() {
    let server = TestRelayServer::spawn().await.unwrap();
    let mut pat = RawClient::online(&server, &uid("pat1")).await.unwrap();

    pat.signal(SignalingMessage::Invite {
        from: uid("pat1"),
        to: uid("ghost"),
        caller: CallerProfile::new(uid("pat1"), "Pat", UserRole::Patient),
    })
    .await
    .unwrap();

    assert_eq!(
        pat.recv_non_presence().await,
        ServerFrame::UserUnreachable { user_id: uid("ghost") }
    );
    assert_eq!(pat.try_recv(QUIET).await, None);
    assert_eq!(server.partner_of(&uid("pat1")).await, None);
    assert_eq!(server.status().await.unwrap().active_pairings, 0);
}

// ============================================================================
// P5: every non-terminal state reaches Ended on remote End or channel close
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Stage {
    Calling,
    Ringing,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy)]
enum Trigger {
    /// The peer's channel drops; the relay sends End.
    RemoteEnd,
    /// The subject's own channel drops.
    ChannelClose,
}

/// Returns (subject, peer) with the subject in `stage`.
async fn reach(server: &TestRelayServer, stage: Stage) -> (TestClient, TestClient) {
    let factory = || match stage {
        Stage::Connecting => MockNegotiationFactory::manual(),
        _ => MockNegotiationFactory::new(),
    };
    let mut pat = TestClient::connect_with(server, "pat1", MockMediaDevices::new(), factory())
        .await
        .unwrap();
    let mut doc = TestClient::connect_with(server, "doc1", MockMediaDevices::new(), factory())
        .await
        .unwrap();

    pat.handle().initiate(uid("doc1")).await.unwrap();
    doc.wait_incoming().await;

    match stage {
        Stage::Calling => (pat, doc),
        Stage::Ringing => (doc, pat),
        Stage::Connecting => {
            doc.handle().accept_locally().await.unwrap();
            pat.wait_state(CallState::Connecting).await;
            (pat, doc)
        }
        Stage::Connected => {
            doc.handle().accept_locally().await.unwrap();
            pat.wait_state(CallState::Connected).await;
            (pat, doc)
        }
    }
}

async fn end_from(stage: Stage, trigger: Trigger) {
    let server = TestRelayServer::spawn().await.unwrap();
    let (mut subject, mut peer) = reach(&server, stage).await;

    match trigger {
        Trigger::RemoteEnd => peer.disconnect().await,
        Trigger::ChannelClose => subject.disconnect().await,
    }

    let ended = subject.wait_state(CallState::Ended).await;
    assert!(ended.peer_id.is_none(), "{stage:?}/{trigger:?}");
    assert!(ended.local_media.is_none(), "{stage:?}/{trigger:?}");
    assert!(ended.remote_media.is_none(), "{stage:?}/{trigger:?}");

    let expected = match trigger {
        Trigger::RemoteEnd => EndReason::RemoteEnded,
        Trigger::ChannelClose => EndReason::ChannelClosed,
    };
    assert_eq!(subject.wait_ended().await.1, expected, "{stage:?}/{trigger:?}");
    subject.wait_state(CallState::Idle).await;
    assert_released(&subject);
}

#[tokio::test]
async fn test_calling_reaches_ended() {
    end_from(Stage::Calling, Trigger::RemoteEnd).await;
    end_from(Stage::Calling, Trigger::ChannelClose).await;
}

#[tokio::test]
async fn test_ringing_reaches_ended() {
    end_from(Stage::Ringing, Trigger::RemoteEnd).await;
    end_from(Stage::Ringing, Trigger::ChannelClose).await;
}

#[tokio::test]
async fn test_connecting_reaches_ended() {
    end_from(Stage::Connecting, Trigger::RemoteEnd).await;
    end_from(Stage::Connecting, Trigger::ChannelClose).await;
}

#[tokio::test]
async fn test_connected_reaches_ended() {
    end_from(Stage::Connected, Trigger::RemoteEnd).await;
    end_from(Stage::Connected, Trigger::ChannelClose).await;
}

#[tokio::test]
async fn test_media_pending_reaches_ended_and_releases_late_media() {
    let server = TestRelayServer::spawn().await.unwrap();
    let (devices, gate) = MockMediaDevices::gated();
    let mut pat = TestClient::connect_with(&server, "pat1", devices, MockNegotiationFactory::new())
        .await
        .unwrap();
    let _doc = TestClient::connect(&server, "doc1").await.unwrap();

    let handle = pat.handle().clone();
    let initiate = tokio::spawn(async move { handle.initiate(uid("doc1")).await });
    pat.wait_state(CallState::Calling).await;

    pat.disconnect().await;

    let ended = pat.wait_state(CallState::Ended).await;
    assert!(ended.peer_id.is_none());
    assert!(matches!(
        initiate.await.unwrap(),
        Err(CallError::CallEnded(EndReason::ChannelClosed))
    ));

    gate.add_permits(1);
    eventually(|| pat.devices().acquired_count() == 1).await;
    eventually(|| pat.devices().live_count() == 0).await;
    assert_eq!(server.partner_of(&uid("doc1")).await, None);
}

// ============================================================================
// Reconnect
// ============================================================================

#[tokio::test]
async fn test_reconnect_accepts_new_calls() {
    let server = TestRelayServer::spawn().await.unwrap();
    let mut doc = TestClient::connect(&server, "doc1").await.unwrap();
    let mut pat = TestClient::connect(&server, "pat1").await.unwrap();

    pat.disconnect().await;
    assert!(matches!(
        pat.handle().initiate(uid("doc1")).await,
        Err(CallError::ChannelClosed)
    ));

    pat.reconnect().await.unwrap();
    connect_call(&mut pat, &mut doc).await;
}

#[tokio::test]
async fn test_superseding_connection_keeps_controller_online() {
    let server = TestRelayServer::spawn().await.unwrap();
    let mut doc = TestClient::connect(&server, "doc1").await.unwrap();
    let mut pat = TestClient::connect(&server, "pat1").await.unwrap();

    pat.reconnect().await.unwrap();
    server.status().await.unwrap();
    tokio::time::sleep(QUIET).await;

    connect_call(&mut pat, &mut doc).await;
    assert_eq!(server.status().await.unwrap().online_users, 2);
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}
