//! In-process backend for tests, demos, and offline play.
//!
//! [`MemoryHub`] plays all three external collaborators at once: it is a
//! [`Store`], a [`Progress`] ledger, and a realtime service that any number of
//! clients reach through [`MemoryTransport`]s from [`MemoryHub::connect`].
//! Every store write is fanned out as a change frame to the channels whose
//! filters match, exactly like a hosted change feed.
//!
//! Faults can be injected to exercise the degraded paths: an offline store, an
//! expired session, join replies that never arrive, and dropped connections.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::DuelError;
use crate::lock;
use crate::protocol::{
    ChangeEvent, ChangeKind, ClientFrame, Competition, CompetitionGuard, CompetitionId,
    CompetitionPatch, CompetitionStatus, InviteId, InviteStatus, Invitation, JoinConfig,
    NewCompetition, NewInvitation, PresenceRecord, Profile, ProfileId, Row, ServerFrame,
};
use crate::store::{InvitationQuery, Progress, Store, StoreError, StoreResult};
use crate::transport::Transport;

#[derive(Debug, Default)]
struct Faults {
    store_offline: bool,
    session_expired: bool,
    mute_joins: bool,
    reject_joins: Option<String>,
    invitation_update_failures: u32,
}

#[derive(Debug)]
struct Connection {
    tx: mpsc::UnboundedSender<String>,
    channels: HashMap<String, JoinConfig>,
}

#[derive(Debug, Default)]
struct HubState {
    profiles: HashMap<ProfileId, Profile>,
    presence: HashMap<ProfileId, PresenceRecord>,
    invitations: HashMap<InviteId, Invitation>,
    competitions: HashMap<CompetitionId, Competition>,
    free_games: HashMap<ProfileId, u32>,
    connections: HashMap<u64, Connection>,
    next_connection: u64,
    faults: Faults,
}

impl HubState {
    fn check(&self) -> StoreResult<()> {
        if self.faults.session_expired {
            return Err(StoreError::rejected(Some("PGRST301"), "JWT expired"));
        }
        if self.faults.store_offline {
            return Err(StoreError::offline("memory hub is offline"));
        }
        Ok(())
    }

    fn send_to(connection: &Connection, frame: &ServerFrame) {
        match serde_json::to_string(frame) {
            Ok(json) => {
                let _ = connection.tx.send(json);
            }
            Err(e) => warn!("failed to serialize ServerFrame: {e}"),
        }
    }

    fn handle_frame(&mut self, from: u64, frame: ClientFrame) {
        match frame {
            ClientFrame::Join { topic, config } => {
                if self.faults.mute_joins {
                    debug!(topic = %topic, "hub: swallowing join");
                    return;
                }
                let rejection = self.faults.reject_joins.clone();
                let Some(connection) = self.connections.get_mut(&from) else {
                    return;
                };
                let reply = match rejection {
                    Some(reason) => ServerFrame::JoinReply {
                        topic,
                        ok: false,
                        reason: Some(reason),
                        error_code: None,
                    },
                    None => {
                        connection.channels.insert(topic.clone(), config);
                        ServerFrame::JoinReply {
                            topic,
                            ok: true,
                            reason: None,
                            error_code: None,
                        }
                    }
                };
                Self::send_to(connection, &reply);
            }
            ClientFrame::Leave { topic } => {
                if let Some(connection) = self.connections.get_mut(&from) {
                    connection.channels.remove(&topic);
                }
            }
            ClientFrame::Broadcast { topic, event } => {
                let frame = ServerFrame::Broadcast {
                    topic: topic.clone(),
                    event,
                };
                for (id, connection) in &self.connections {
                    let joined = connection
                        .channels
                        .get(&topic)
                        .is_some_and(|config| config.broadcast);
                    if *id != from && joined {
                        Self::send_to(connection, &frame);
                    }
                }
            }
        }
    }

    fn publish_change(&self, kind: ChangeKind, row: Row) {
        let change = ChangeEvent {
            kind,
            row,
            commit_timestamp: Utc::now(),
        };
        for connection in self.connections.values() {
            for (topic, config) in &connection.channels {
                if config
                    .changes
                    .iter()
                    .any(|filter| filter.matches(kind, &change.row))
                {
                    let frame = ServerFrame::Change {
                        topic: topic.clone(),
                        change: change.clone(),
                    };
                    Self::send_to(connection, &frame);
                }
            }
        }
    }
}

/// Shared in-process store, realtime service, and reward ledger.
#[derive(Debug, Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a realtime connection to this hub.
    pub fn connect(&self) -> MemoryTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = lock(&self.state);
        let id = state.next_connection;
        state.next_connection += 1;
        state.connections.insert(
            id,
            Connection {
                tx,
                channels: HashMap::new(),
            },
        );
        debug!(connection = id, "hub: client connected");
        MemoryTransport {
            hub: self.clone(),
            id,
            rx,
            closed: false,
        }
    }

    /// Make a profile's display data available to roster lookups.
    pub fn register_profile(&self, profile: Profile) {
        lock(&self.state).profiles.insert(profile.id, profile);
    }

    /// Free games granted to `profile` so far.
    pub fn free_games(&self, profile: ProfileId) -> u32 {
        lock(&self.state)
            .free_games
            .get(&profile)
            .copied()
            .unwrap_or(0)
    }

    /// Fail every store call with an unavailable error.
    pub fn set_store_offline(&self, offline: bool) {
        lock(&self.state).faults.store_offline = offline;
    }

    /// Fail every store call with an expired-credential rejection.
    pub fn expire_session(&self) {
        lock(&self.state).faults.session_expired = true;
    }

    /// Never answer join requests.
    pub fn mute_joins(&self, mute: bool) {
        lock(&self.state).faults.mute_joins = mute;
    }

    /// Fail the next `count` invitation updates, as a dropped request between
    /// two writes would.
    pub fn fail_invitation_updates(&self, count: u32) {
        lock(&self.state).faults.invitation_update_failures = count;
    }

    /// Refuse join requests with `reason`, or accept them again with `None`.
    pub fn reject_joins(&self, reason: Option<String>) {
        lock(&self.state).faults.reject_joins = reason;
    }

    /// Deliver the current competition row again, as an at-least-once change
    /// feed may. Returns `false` if the competition does not exist.
    pub fn redeliver_competition(&self, id: CompetitionId) -> bool {
        let state = lock(&self.state);
        match state.competitions.get(&id) {
            Some(competition) => {
                state.publish_change(ChangeKind::Update, Row::Competitions(competition.clone()));
                true
            }
            None => false,
        }
    }

    /// Drop every connection, as a network outage would.
    pub fn disconnect_all(&self) {
        lock(&self.state).connections.clear();
    }

    /// Channels currently joined across all connections.
    pub fn joined_channels(&self) -> usize {
        lock(&self.state)
            .connections
            .values()
            .map(|connection| connection.channels.len())
            .sum()
    }

    fn handle_frame(&self, from: u64, frame: ClientFrame) {
        lock(&self.state).handle_frame(from, frame);
    }

    fn drop_connection(&self, id: u64) {
        if lock(&self.state).connections.remove(&id).is_some() {
            debug!(connection = id, "hub: client disconnected");
        }
    }
}

#[async_trait]
impl Store for MemoryHub {
    async fn upsert_presence(&self, record: PresenceRecord) -> StoreResult<PresenceRecord> {
        let mut state = lock(&self.state);
        state.check()?;
        let kind = if state.presence.contains_key(&record.profile_id) {
            ChangeKind::Update
        } else {
            ChangeKind::Insert
        };
        state.presence.insert(record.profile_id, record.clone());
        state.publish_change(kind, Row::Presence(record.clone()));
        Ok(record)
    }

    async fn online_presence(&self, since: DateTime<Utc>) -> StoreResult<Vec<PresenceRecord>> {
        let state = lock(&self.state);
        state.check()?;
        Ok(state
            .presence
            .values()
            .filter(|record| record.online && record.last_seen >= since)
            .cloned()
            .collect())
    }

    async fn profiles(&self, ids: &[ProfileId]) -> StoreResult<Vec<Profile>> {
        let state = lock(&self.state);
        state.check()?;
        Ok(ids
            .iter()
            .filter_map(|id| state.profiles.get(id).cloned())
            .collect())
    }

    async fn insert_competition(&self, new: NewCompetition) -> StoreResult<Competition> {
        let mut state = lock(&self.state);
        state.check()?;
        let competition = Competition {
            id: Uuid::new_v4(),
            player1_id: new.player1_id,
            player2_id: new.player2_id,
            player1_score: 0,
            player2_score: 0,
            status: CompetitionStatus::Pending,
            winner_id: None,
            started_at: None,
            ended_at: None,
            revision: 1,
        };
        state
            .competitions
            .insert(competition.id, competition.clone());
        state.publish_change(ChangeKind::Insert, Row::Competitions(competition.clone()));
        Ok(competition)
    }

    async fn competition(&self, id: CompetitionId) -> StoreResult<Option<Competition>> {
        let state = lock(&self.state);
        state.check()?;
        Ok(state.competitions.get(&id).cloned())
    }

    async fn update_competition(
        &self,
        id: CompetitionId,
        guard: CompetitionGuard,
        patch: CompetitionPatch,
    ) -> StoreResult<Option<Competition>> {
        let mut state = lock(&self.state);
        state.check()?;
        let Some(competition) = state.competitions.get_mut(&id) else {
            return Ok(None);
        };
        if !guard.holds(competition) {
            return Ok(None);
        }
        patch.apply(competition);
        competition.revision += 1;
        let updated = competition.clone();
        state.publish_change(ChangeKind::Update, Row::Competitions(updated.clone()));
        Ok(Some(updated))
    }

    async fn insert_invitation(&self, new: NewInvitation) -> StoreResult<Invitation> {
        let mut state = lock(&self.state);
        state.check()?;
        let invitation = Invitation {
            id: Uuid::new_v4(),
            sender_id: new.sender_id,
            receiver_id: new.receiver_id,
            competition_id: new.competition_id,
            status: InviteStatus::Pending,
            created_at: Utc::now(),
        };
        state.invitations.insert(invitation.id, invitation.clone());
        state.publish_change(ChangeKind::Insert, Row::Invitations(invitation.clone()));
        Ok(invitation)
    }

    async fn invitation(&self, id: InviteId) -> StoreResult<Option<Invitation>> {
        let state = lock(&self.state);
        state.check()?;
        Ok(state.invitations.get(&id).cloned())
    }

    async fn invitations(&self, query: InvitationQuery) -> StoreResult<Vec<Invitation>> {
        let state = lock(&self.state);
        state.check()?;
        let mut found: Vec<Invitation> = state
            .invitations
            .values()
            .filter(|invitation| query.matches(invitation))
            .cloned()
            .collect();
        found.sort_by_key(|invitation| invitation.created_at);
        Ok(found)
    }

    async fn update_invitation(
        &self,
        id: InviteId,
        expected: InviteStatus,
        next: InviteStatus,
    ) -> StoreResult<Option<Invitation>> {
        let mut state = lock(&self.state);
        state.check()?;
        if state.faults.invitation_update_failures > 0 {
            state.faults.invitation_update_failures -= 1;
            return Err(StoreError::offline("network blip"));
        }
        let Some(invitation) = state.invitations.get_mut(&id) else {
            return Ok(None);
        };
        if invitation.status != expected {
            return Ok(None);
        }
        invitation.status = next;
        let updated = invitation.clone();
        state.publish_change(ChangeKind::Update, Row::Invitations(updated.clone()));
        Ok(Some(updated))
    }
}

#[async_trait]
impl Progress for MemoryHub {
    async fn award_free_game(&self, profile: ProfileId) -> StoreResult<()> {
        let mut state = lock(&self.state);
        state.check()?;
        *state.free_games.entry(profile).or_insert(0) += 1;
        Ok(())
    }
}

/// One client's realtime connection to a [`MemoryHub`].
///
/// [`recv`](Transport::recv) is cancel-safe: it only awaits an unbounded
/// channel.
#[derive(Debug)]
pub struct MemoryTransport {
    hub: MemoryHub,
    id: u64,
    rx: mpsc::UnboundedReceiver<String>,
    closed: bool,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&mut self, frame: String) -> Result<(), DuelError> {
        if self.closed {
            return Err(DuelError::TransportClosed);
        }
        let frame: ClientFrame = serde_json::from_str(&frame)?;
        self.hub.handle_frame(self.id, frame);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, DuelError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), DuelError> {
        if !self.closed {
            self.closed = true;
            self.hub.drop_connection(self.id);
        }
        Ok(())
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.hub.drop_connection(self.id);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::protocol::{BroadcastEvent, Seat};
    use crate::realtime::Topic;

    async fn next_frame(transport: &mut MemoryTransport) -> ServerFrame {
        let text = transport.recv().await.unwrap().unwrap();
        serde_json::from_str(&text).unwrap()
    }

    async fn join(transport: &mut MemoryTransport, topic: Topic) -> String {
        let name = topic.channel_name();
        let frame = ClientFrame::Join {
            topic: name.clone(),
            config: topic.join_config(),
        };
        transport
            .send(serde_json::to_string(&frame).unwrap())
            .await
            .unwrap();
        match next_frame(transport).await {
            ServerFrame::JoinReply { ok: true, .. } => name,
            other => panic!("expected successful JoinReply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_other_members_only() {
        let hub = MemoryHub::new();
        let mut alice = hub.connect();
        let mut bob = hub.connect();
        let inbox = Topic::InviteInbox(Uuid::from_u128(2));
        let topic = join(&mut alice, inbox).await;
        join(&mut bob, inbox).await;

        let event = BroadcastEvent::InviteCancelled {
            from_profile_id: Uuid::from_u128(1),
            competition_id: Uuid::from_u128(3),
        };
        let frame = ClientFrame::Broadcast {
            topic: topic.clone(),
            event: event.clone(),
        };
        alice
            .send(serde_json::to_string(&frame).unwrap())
            .await
            .unwrap();

        assert_eq!(
            next_frame(&mut bob).await,
            ServerFrame::Broadcast { topic, event }
        );
        assert!(alice.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn guarded_update_bumps_revision_and_notifies() {
        let hub = MemoryHub::new();
        let mut watcher = hub.connect();
        let competition = hub
            .insert_competition(NewCompetition {
                player1_id: Uuid::from_u128(1),
                player2_id: Uuid::from_u128(2),
            })
            .await
            .unwrap();
        join(&mut watcher, Topic::Competition(competition.id)).await;

        let updated = hub
            .update_competition(
                competition.id,
                CompetitionGuard::status(CompetitionStatus::Pending),
                CompetitionPatch::activate(Utc::now()),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.revision, 2);
        assert_eq!(updated.status, CompetitionStatus::Active);

        match next_frame(&mut watcher).await {
            ServerFrame::Change { change, .. } => {
                assert_eq!(change.kind, ChangeKind::Update);
                assert_eq!(change.row, Row::Competitions(updated));
            }
            other => panic!("expected Change, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_guard_leaves_row_untouched() {
        let hub = MemoryHub::new();
        let competition = hub
            .insert_competition(NewCompetition {
                player1_id: Uuid::from_u128(1),
                player2_id: Uuid::from_u128(2),
            })
            .await
            .unwrap();
        let result = hub
            .update_competition(
                competition.id,
                CompetitionGuard::status(CompetitionStatus::Active),
                CompetitionPatch::score(Seat::Player1, 1),
            )
            .await
            .unwrap();
        assert!(result.is_none());
        let stored = hub.competition(competition.id).await.unwrap().unwrap();
        assert_eq!(stored, competition);
    }

    #[tokio::test]
    async fn expired_session_rejects_store_calls() {
        let hub = MemoryHub::new();
        hub.expire_session();
        let err = hub.profiles(&[Uuid::nil()]).await.unwrap_err();
        assert!(err.is_session_expiry());
    }

    #[tokio::test]
    async fn closing_the_transport_forgets_its_channels() {
        let hub = MemoryHub::new();
        let mut client = hub.connect();
        join(&mut client, Topic::Presence).await;
        assert_eq!(hub.joined_channels(), 1);
        client.close().await.unwrap();
        assert_eq!(hub.joined_channels(), 0);
        assert!(matches!(
            client.send("{}".into()).await,
            Err(DuelError::TransportClosed)
        ));
    }
}
