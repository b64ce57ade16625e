//! End-to-end duel tests.
//!
//! Two or three real `DuelClient`s share one `MemoryHub`, which plays the
//! store, the realtime service, and the reward ledger. The scripted
//! `MockTransport` covers the wire-level behaviour a hub cannot fake.

mod common;

use std::time::Duration;

use chrono::Utc;
use duel_sync::protocol::{CompetitionStatus, PresenceRecord, ServerFrame};
use duel_sync::transports::MemoryHub;
use duel_sync::{ClientFrame, DuelClient, DuelError, DuelEvent, Store};
use tokio_test::{assert_err, assert_ok};

use common::{
    ada, bo, cy, drain_for, expect_event, fast_config, start_client, wait_until_online,
    MockTransport,
};

// ════════════════════════════════════════════════════════════════════
// Helper: two clients that can see each other
// ════════════════════════════════════════════════════════════════════

struct Duel {
    hub: MemoryHub,
    ada: DuelClient,
    ada_events: tokio::sync::mpsc::Receiver<DuelEvent>,
    bo: DuelClient,
    bo_events: tokio::sync::mpsc::Receiver<DuelEvent>,
}

async fn duel() -> Duel {
    let hub = MemoryHub::new();
    let (ada, ada_events) = start_client(&hub, ada()).await;
    let (bo, bo_events) = start_client(&hub, bo()).await;
    wait_until_online(&ada, common::bo().id).await;
    wait_until_online(&bo, common::ada().id).await;
    Duel {
        hub,
        ada,
        ada_events,
        bo,
        bo_events,
    }
}

impl Duel {
    async fn shutdown(mut self) {
        self.ada.shutdown().await;
        self.bo.shutdown().await;
    }
}

/// Ada challenges Bo and Bo accepts. Returns the competition id.
async fn accepted_match(d: &mut Duel) -> uuid::Uuid {
    let handle = assert_ok!(d.ada.send_invite(bo().id).await);
    let event = expect_event(&mut d.bo_events, |e| {
        matches!(e, DuelEvent::InviteReceived { .. })
    })
    .await;
    let DuelEvent::InviteReceived { invite_id, .. } = event else {
        unreachable!()
    };
    let competition = assert_ok!(d.bo.respond_to_invite(invite_id, true).await);
    assert_eq!(competition.id, handle.competition.id);
    assert_eq!(competition.status, CompetitionStatus::Active);

    let resolved = expect_event(&mut d.ada_events, |e| {
        matches!(e, DuelEvent::InviteResolved { .. })
    })
    .await;
    assert_eq!(
        resolved,
        DuelEvent::InviteResolved {
            competition_id: competition.id,
            accepted: true,
        }
    );
    competition.id
}

// ════════════════════════════════════════════════════════════════════
// Lifecycle
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn connected_is_first_event() {
    let hub = MemoryHub::new();
    let (mut client, mut events) = start_client(&hub, ada()).await;
    assert_eq!(events.recv().await, Some(DuelEvent::Connected));
    client.shutdown().await;
}

#[tokio::test]
async fn roster_lists_others_with_display_data() {
    let d = duel().await;
    let roster = assert_ok!(d.bo.online_roster().await);
    assert_eq!(roster.len(), 1);
    assert_eq!(roster[0].name, "Ada");
    assert_eq!(roster[0].avatar.as_deref(), Some("owl"));
    d.shutdown().await;
}

#[tokio::test]
async fn a_new_player_coming_online_changes_the_roster() {
    let hub = MemoryHub::new();
    let (mut ada_client, mut ada_events) = start_client(&hub, ada()).await;
    let (mut cy_client, _cy_events) = start_client(&hub, cy()).await;

    expect_event(&mut ada_events, |e| matches!(e, DuelEvent::RosterChanged)).await;
    wait_until_online(&ada_client, cy().id).await;

    cy_client.shutdown().await;
    ada_client.shutdown().await;
}

#[tokio::test]
async fn outage_ends_the_event_stream_with_disconnected() {
    let hub = MemoryHub::new();
    let (_client, mut events) = start_client(&hub, ada()).await;
    assert_eq!(events.recv().await, Some(DuelEvent::Connected));

    hub.disconnect_all();
    let event = expect_event(&mut events, |e| matches!(e, DuelEvent::Disconnected { .. })).await;
    assert_eq!(event, DuelEvent::Disconnected { reason: None });
    assert_eq!(events.recv().await, None);
}

// ════════════════════════════════════════════════════════════════════
// Invitations
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn invite_is_delivered_once_with_sender_name() {
    let mut d = duel().await;
    let handle = assert_ok!(d.ada.send_invite(bo().id).await);

    let event = expect_event(&mut d.bo_events, |e| {
        matches!(e, DuelEvent::InviteReceived { .. })
    })
    .await;
    assert_eq!(
        event,
        DuelEvent::InviteReceived {
            invite_id: handle.invitation.id,
            from_profile_id: ada().id,
            from_name: "Ada".into(),
            competition_id: handle.competition.id,
        }
    );

    let later = drain_for(&mut d.bo_events, Duration::from_millis(150)).await;
    assert!(
        !later
            .iter()
            .any(|e| matches!(e, DuelEvent::InviteReceived { .. })),
        "duplicate invite: {later:?}"
    );
    d.shutdown().await;
}

#[tokio::test]
async fn second_invite_before_an_answer_is_refused() {
    let d = duel().await;
    assert_ok!(d.ada.send_invite(bo().id).await);
    let err = assert_err!(d.ada.send_invite(bo().id).await);
    assert!(matches!(err, DuelError::AlreadyInviting));
    d.shutdown().await;
}

#[tokio::test]
async fn self_and_offline_invites_are_refused() {
    let d = duel().await;
    assert!(matches!(
        d.ada.send_invite(ada().id).await,
        Err(DuelError::SelfInvite)
    ));
    d.hub.register_profile(cy());
    assert!(matches!(
        d.ada.send_invite(cy().id).await,
        Err(DuelError::TargetOffline)
    ));
    d.shutdown().await;
}

#[tokio::test]
async fn invites_sent_while_away_arrive_on_start() {
    let hub = MemoryHub::new();
    let (mut ada_client, _ada_events) = start_client(&hub, ada()).await;
    let (killed, _killed_events) = start_client(&hub, bo()).await;
    wait_until_online(&ada_client, bo().id).await;

    // Bo's app goes away, but another device keeps Bo's presence fresh.
    drop(killed);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_ok!(
        Store::upsert_presence(&hub, PresenceRecord::online(bo().id, Utc::now())).await
    );

    let handle = assert_ok!(ada_client.send_invite(bo().id).await);

    let (mut bo_client, mut events) = start_client(&hub, bo()).await;
    assert_eq!(events.recv().await, Some(DuelEvent::Connected));
    let event = expect_event(&mut events, |e| matches!(e, DuelEvent::InviteReceived { .. })).await;
    let DuelEvent::InviteReceived { invite_id, .. } = event else {
        unreachable!()
    };
    assert_eq!(invite_id, handle.invitation.id);
    assert_eq!(assert_ok!(bo_client.pending_invitations().await).len(), 1);

    bo_client.shutdown().await;
    ada_client.shutdown().await;
}

#[tokio::test]
async fn decline_tells_the_sender_and_a_late_accept_is_stale() {
    let mut d = duel().await;
    assert_ok!(d.ada.send_invite(bo().id).await);
    let DuelEvent::InviteReceived { invite_id, .. } = expect_event(&mut d.bo_events, |e| {
        matches!(e, DuelEvent::InviteReceived { .. })
    })
    .await
    else {
        unreachable!()
    };

    let competition = assert_ok!(d.bo.respond_to_invite(invite_id, false).await);
    assert_eq!(competition.status, CompetitionStatus::Cancelled);
    let resolved = expect_event(&mut d.ada_events, |e| {
        matches!(e, DuelEvent::InviteResolved { .. })
    })
    .await;
    assert_eq!(
        resolved,
        DuelEvent::InviteResolved {
            competition_id: competition.id,
            accepted: false,
        }
    );

    let err = assert_err!(d.bo.respond_to_invite(invite_id, true).await);
    assert!(matches!(err, DuelError::StaleInvite));

    // The pair is free again.
    assert_ok!(d.ada.send_invite(bo().id).await);
    d.shutdown().await;
}

#[tokio::test]
async fn cancelled_invite_drops_the_prompt_without_a_resolution() {
    let mut d = duel().await;
    let handle = assert_ok!(d.ada.send_invite(bo().id).await);
    expect_event(&mut d.bo_events, |e| {
        matches!(e, DuelEvent::InviteReceived { .. })
    })
    .await;

    assert_ok!(d.ada.cancel_invite(&handle).await);
    let cancelled = expect_event(&mut d.bo_events, |e| {
        matches!(e, DuelEvent::InviteCancelled { .. })
    })
    .await;
    assert_eq!(
        cancelled,
        DuelEvent::InviteCancelled {
            from_profile_id: ada().id,
            competition_id: handle.competition.id,
        }
    );

    let err = assert_err!(d.bo.respond_to_invite(handle.invitation.id, true).await);
    assert!(matches!(err, DuelError::StaleInvite));

    let ada_later = drain_for(&mut d.ada_events, Duration::from_millis(150)).await;
    assert!(!ada_later
        .iter()
        .any(|e| matches!(e, DuelEvent::InviteResolved { .. })));
    d.shutdown().await;
}

#[tokio::test]
async fn invite_that_cannot_be_announced_is_taken_back() {
    let mut d = duel().await;
    d.hub.reject_joins(Some("channel limit".into()));
    let err = assert_err!(d.ada.send_invite(bo().id).await);
    assert!(matches!(err, DuelError::JoinRejected { .. }));
    d.hub.reject_joins(None);

    // Bo may still have seen the insert on the change feed; answering it is stale.
    let bo_events = drain_for(&mut d.bo_events, Duration::from_millis(150)).await;
    for event in bo_events {
        if let DuelEvent::InviteReceived { invite_id, .. } = event {
            let err = assert_err!(d.bo.respond_to_invite(invite_id, true).await);
            assert!(matches!(err, DuelError::StaleInvite));
        }
    }
    assert!(assert_ok!(d.bo.pending_invitations().await).is_empty());

    let ada_events = drain_for(&mut d.ada_events, Duration::from_millis(150)).await;
    assert!(!ada_events
        .iter()
        .any(|e| matches!(e, DuelEvent::InviteResolved { accepted: true, .. })));
    d.shutdown().await;
}

#[tokio::test]
async fn only_the_receiver_can_answer() {
    let d = duel().await;
    let handle = assert_ok!(d.ada.send_invite(bo().id).await);
    let err = assert_err!(d.ada.respond_to_invite(handle.invitation.id, true).await);
    assert!(matches!(err, DuelError::NotReceiver));
    d.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════
// Matches
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn first_to_fifteen_wins_once_and_is_rewarded_once() {
    let mut d = duel().await;
    let competition = accepted_match(&mut d).await;

    for expected in 1..=15u32 {
        let report = assert_ok!(d.ada.report_correct_answer(competition).await);
        assert_eq!(report.score, expected);
        assert_eq!(report.won, expected == 15);
    }

    let completed = expect_event(&mut d.ada_events, |e| {
        matches!(e, DuelEvent::MatchCompleted { .. })
    })
    .await;
    let DuelEvent::MatchCompleted { competition: row, won } = completed else {
        unreachable!()
    };
    assert!(won);
    assert_eq!(row.status, CompetitionStatus::Completed);
    assert_eq!(row.winner_id, Some(ada().id));
    assert_eq!((row.player1_score, row.player2_score), (15, 0));

    let bo_view = expect_event(&mut d.bo_events, |e| {
        matches!(e, DuelEvent::MatchCompleted { .. })
    })
    .await;
    assert!(matches!(bo_view, DuelEvent::MatchCompleted { won: false, .. }));

    // Neither player can score after completion.
    let err = assert_err!(d.bo.report_correct_answer(competition).await);
    assert!(matches!(err, DuelError::MatchNotActive));
    let err = assert_err!(d.ada.report_correct_answer(competition).await);
    assert!(matches!(err, DuelError::MatchNotActive));

    assert_eq!(d.hub.free_games(ada().id), 1);
    assert_eq!(d.hub.free_games(bo().id), 0);
    d.shutdown().await;
}

#[tokio::test]
async fn redelivered_completion_is_reported_and_rewarded_once() {
    let mut d = duel().await;
    let competition = accepted_match(&mut d).await;
    for _ in 0..15 {
        assert_ok!(d.ada.report_correct_answer(competition).await);
    }
    expect_event(&mut d.ada_events, |e| {
        matches!(e, DuelEvent::MatchCompleted { .. })
    })
    .await;

    // The finished match is no longer tracked, and late rows stay ignored.
    assert_eq!(d.ada.match_view(competition), None);
    assert!(d.hub.redeliver_competition(competition));
    assert!(d.hub.redeliver_competition(competition));

    let later = drain_for(&mut d.ada_events, Duration::from_millis(150)).await;
    assert!(!later
        .iter()
        .any(|e| matches!(e, DuelEvent::MatchCompleted { .. })));
    assert_eq!(d.hub.free_games(ada().id), 1);
    d.shutdown().await;
}

#[tokio::test]
async fn both_players_see_each_others_scores() {
    let mut d = duel().await;
    let competition = accepted_match(&mut d).await;

    assert_ok!(d.bo.report_correct_answer(competition).await);
    let update = expect_event(&mut d.ada_events, |e| {
        matches!(e, DuelEvent::MatchUpdated(row) if row.player2_score == 1)
    })
    .await;
    assert!(matches!(update, DuelEvent::MatchUpdated(_)));

    assert_ok!(d.ada.report_correct_answer(competition).await);
    expect_event(&mut d.bo_events, |e| {
        matches!(e, DuelEvent::MatchUpdated(row) if row.player1_score == 1)
    })
    .await;

    let view = d.ada.match_view(competition).expect("match is followed");
    assert_eq!((view.player1_score, view.player2_score), (1, 1));
    d.shutdown().await;
}

#[tokio::test]
async fn scoring_a_pending_match_is_refused() {
    let d = duel().await;
    let handle = assert_ok!(d.ada.send_invite(bo().id).await);
    let err = assert_err!(d.ada.report_correct_answer(handle.competition.id).await);
    assert!(matches!(err, DuelError::MatchNotActive));
    d.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════
// Degraded paths
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn expired_session_surfaces_as_an_event() {
    let mut d = duel().await;
    d.hub.expire_session();

    let err = assert_err!(d.ada.send_invite(bo().id).await);
    assert!(matches!(err, DuelError::SessionExpired));
    expect_event(&mut d.ada_events, |e| matches!(e, DuelEvent::SessionExpired)).await;
    d.shutdown().await;
}

#[tokio::test]
async fn store_outage_keeps_presence_quiet_but_fails_reads() {
    let d = duel().await;
    d.hub.set_store_offline(true);
    let err = assert_err!(d.ada.online_roster().await);
    assert!(matches!(err, DuelError::Store(_)));
    d.ada.visibility_changed(false).await;
    d.hub.set_store_offline(false);
    d.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════
// Wire level
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn start_joins_every_listening_channel() {
    let hub = MemoryHub::new();
    hub.register_profile(ada());
    let (transport, service) = MockTransport::new();
    let (mut client, _events) = DuelClient::start(
        ada(),
        transport,
        std::sync::Arc::new(hub.clone()),
        std::sync::Arc::new(hub.clone()),
        fast_config(),
    )
    .await
    .unwrap();

    let me = ada().id;
    let joined = service.joined();
    for prefix in [
        format!("game-invites:{me}"),
        format!("user:{me}"),
        format!("invitations-to:{me}:"),
        format!("competitions-from:{me}:"),
        "presence-changes:".to_owned(),
    ] {
        assert!(
            joined.iter().any(|name| name.starts_with(&prefix)),
            "missing {prefix} in {joined:?}"
        );
    }

    client.shutdown().await;
    assert!(service.closed.load(std::sync::atomic::Ordering::Relaxed));
    let sent = service.sent.lock().unwrap();
    assert!(sent.iter().all(|frame| !matches!(frame, ClientFrame::Broadcast { .. })));
}

#[tokio::test]
async fn service_error_with_expired_token_is_session_expiry() {
    let hub = MemoryHub::new();
    let (transport, service) = MockTransport::new();
    let (mut client, mut events) = DuelClient::start(
        ada(),
        transport,
        std::sync::Arc::new(hub.clone()),
        std::sync::Arc::new(hub.clone()),
        fast_config(),
    )
    .await
    .unwrap();

    service.push_raw("not json at all");
    service.push(&ServerFrame::Error {
        message: "JWT expired".into(),
        error_code: None,
    });
    expect_event(&mut events, |e| matches!(e, DuelEvent::SessionExpired)).await;
    assert!(client.is_connected());
    client.shutdown().await;
}
