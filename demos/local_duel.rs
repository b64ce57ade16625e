//! # Local Duel
//!
//! Two players, one in-process [`MemoryHub`]. Ada challenges Bo, Bo accepts,
//! and Ada answers fifteen questions in a row.
//!
//! ```sh
//! RUST_LOG=duel_sync=debug cargo run --example local_duel
//! ```

use std::sync::Arc;
use std::time::Duration;

use duel_sync::transports::MemoryHub;
use duel_sync::{DuelClient, DuelConfig, DuelError, DuelEvent, Profile};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

async fn start(
    hub: &MemoryHub,
    profile: Profile,
) -> Result<(DuelClient, mpsc::Receiver<DuelEvent>), DuelError> {
    hub.register_profile(profile.clone());
    let config = DuelConfig::default().with_heartbeat_interval(Duration::from_millis(200));
    DuelClient::start(
        profile,
        hub.connect(),
        Arc::new(hub.clone()),
        Arc::new(hub.clone()),
        config,
    )
    .await
}

/// Print events until one matches `stop`.
async fn until(
    who: &str,
    events: &mut mpsc::Receiver<DuelEvent>,
    stop: impl Fn(&DuelEvent) -> bool,
) -> Option<DuelEvent> {
    while let Some(event) = events.recv().await {
        println!("[{who}] {event:?}");
        if stop(&event) {
            return Some(event);
        }
    }
    None
}

#[tokio::main]
async fn main() -> Result<(), DuelError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let hub = MemoryHub::new();
    let ada = Profile::new(Uuid::new_v4(), "Ada").with_avatar("owl");
    let bo = Profile::new(Uuid::new_v4(), "Bo");

    let (mut ada_client, mut ada_events) = start(&hub, ada.clone()).await?;
    let (mut bo_client, mut bo_events) = start(&hub, bo.clone()).await?;

    // Wait for Bo's first heartbeat to land.
    while !ada_client
        .online_roster()
        .await?
        .iter()
        .any(|user| user.profile_id == bo.id)
    {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    println!("Ada sees: {:?}", ada_client.online_roster().await?);

    let handle = ada_client.send_invite(bo.id).await?;
    println!("Ada challenged Bo (match {})", handle.competition.id);

    let Some(DuelEvent::InviteReceived {
        invite_id,
        from_name,
        ..
    }) = until("Bo", &mut bo_events, |e| {
        matches!(e, DuelEvent::InviteReceived { .. })
    })
    .await
    else {
        return Ok(());
    };
    println!("Bo accepts the challenge from {from_name}");
    let competition = bo_client.respond_to_invite(invite_id, true).await?;

    until("Ada", &mut ada_events, |e| {
        matches!(e, DuelEvent::InviteResolved { .. })
    })
    .await;

    loop {
        let report = ada_client.report_correct_answer(competition.id).await?;
        println!("Ada scores {}", report.score);
        if report.won {
            break;
        }
    }

    until("Bo", &mut bo_events, |e| {
        matches!(e, DuelEvent::MatchCompleted { .. })
    })
    .await;
    println!("Ada's free games: {}", hub.free_games(ada.id));

    ada_client.shutdown().await;
    bo_client.shutdown().await;
    Ok(())
}
