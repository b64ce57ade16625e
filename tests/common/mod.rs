#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for duel-sync integration tests.
//!
//! Provides a scripted [`MockTransport`] for wire-level tests and helpers for
//! running real clients against a shared [`MemoryHub`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use duel_sync::protocol::{ProfileId, ServerFrame};
use duel_sync::transports::MemoryHub;
use duel_sync::{ClientFrame, DuelClient, DuelConfig, DuelError, DuelEvent, Profile, Transport};
use tokio::sync::mpsc;
use uuid::Uuid;

/// How long a test waits for an expected event.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

// ── MockTransport ───────────────────────────────────────────────────

/// A transport that records every client frame and replays whatever the test
/// pushes through its [`MockService`]. Joins are accepted automatically.
pub struct MockTransport {
    incoming: mpsc::UnboundedReceiver<String>,
    loopback: mpsc::UnboundedSender<String>,
    sent: Arc<StdMutex<Vec<ClientFrame>>>,
    closed: Arc<AtomicBool>,
}

/// The test's side of a [`MockTransport`].
#[derive(Clone)]
pub struct MockService {
    tx: mpsc::UnboundedSender<String>,
    pub sent: Arc<StdMutex<Vec<ClientFrame>>>,
    pub closed: Arc<AtomicBool>,
}

impl MockTransport {
    pub fn new() -> (Self, MockService) {
        let (tx, incoming) = mpsc::unbounded_channel();
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let transport = Self {
            incoming,
            loopback: tx.clone(),
            sent: Arc::clone(&sent),
            closed: Arc::clone(&closed),
        };
        (transport, MockService { tx, sent, closed })
    }
}

impl MockService {
    /// Deliver `frame` to the client.
    pub fn push(&self, frame: &ServerFrame) {
        self.tx.send(serde_json::to_string(frame).unwrap()).unwrap();
    }

    /// Deliver raw text to the client.
    pub fn push_raw(&self, text: &str) {
        self.tx.send(text.to_owned()).unwrap();
    }

    /// Wire names of every channel joined so far.
    pub fn joined(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|frame| match frame {
                ClientFrame::Join { topic, .. } => Some(topic.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, frame: String) -> Result<(), DuelError> {
        let frame: ClientFrame = serde_json::from_str(&frame)?;
        if let ClientFrame::Join { topic, .. } = &frame {
            let reply = ServerFrame::JoinReply {
                topic: topic.clone(),
                ok: true,
                reason: None,
                error_code: None,
            };
            let _ = self.loopback.send(serde_json::to_string(&reply)?);
        }
        self.sent.lock().unwrap().push(frame);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, DuelError>> {
        self.incoming.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), DuelError> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

// ── Profiles and clients ────────────────────────────────────────────

pub fn ada() -> Profile {
    Profile::new(Uuid::from_u128(1), "Ada").with_avatar("owl")
}

pub fn bo() -> Profile {
    Profile::new(Uuid::from_u128(2), "Bo")
}

pub fn cy() -> Profile {
    Profile::new(Uuid::from_u128(3), "Cy")
}

/// Short timeouts and a fast heartbeat so tests settle quickly.
pub fn fast_config() -> DuelConfig {
    DuelConfig::default()
        .with_heartbeat_interval(Duration::from_millis(50))
        .with_subscribe_timeout(Duration::from_millis(500))
        .with_shutdown_timeout(Duration::from_millis(200))
}

/// Start a client for `profile` on `hub`.
pub async fn start_client(
    hub: &MemoryHub,
    profile: Profile,
) -> (DuelClient, mpsc::Receiver<DuelEvent>) {
    hub.register_profile(profile.clone());
    DuelClient::start(
        profile,
        hub.connect(),
        Arc::new(hub.clone()),
        Arc::new(hub.clone()),
        fast_config(),
    )
    .await
    .expect("client should start")
}

/// Wait for the first event matching `pred`, discarding the others.
pub async fn expect_event<F>(events: &mut mpsc::Receiver<DuelEvent>, mut pred: F) -> DuelEvent
where
    F: FnMut(&DuelEvent) -> bool,
{
    tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            let event = events.recv().await.expect("event stream ended");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Every event that arrives within `window`.
pub async fn drain_for(events: &mut mpsc::Receiver<DuelEvent>, window: Duration) -> Vec<DuelEvent> {
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, events.recv()).await {
        seen.push(event);
    }
    seen
}

/// Poll `client`'s roster until `profile` shows up.
pub async fn wait_until_online(client: &DuelClient, profile: ProfileId) {
    tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            let roster = client.online_roster().await.unwrap();
            if roster.iter().any(|user| user.profile_id == profile) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("profile never came online");
}
