//! Shared records and wire frames.
//!
//! The persisted rows ([`PresenceRecord`], [`Invitation`], [`Competition`])
//! mirror the store's tables field for field. The realtime frames
//! ([`ClientFrame`], [`ServerFrame`]) are adjacently tagged JSON
//! (`{"type": "...", "data": {...}}`), and every event kind that can travel
//! over a channel is a closed enum rather than a free-form string.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Type aliases ────────────────────────────────────────────────────

/// Unique identifier for an in-app player profile.
pub type ProfileId = Uuid;

/// Unique identifier for a competition (one online match).
pub type CompetitionId = Uuid;

/// Unique identifier for an invitation.
pub type InviteId = Uuid;

/// Convert a std duration into a chrono span, saturating at one year.
pub(crate) fn span(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}

// ── Profiles and presence ───────────────────────────────────────────

/// Identity and display data of a profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: ProfileId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl Profile {
    pub fn new(id: ProfileId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            avatar: None,
        }
    }

    #[must_use]
    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
    }
}

/// One row per profile, refreshed by the heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub profile_id: ProfileId,
    pub online: bool,
    pub last_seen: DateTime<Utc>,
}

impl PresenceRecord {
    pub fn online(profile_id: ProfileId, now: DateTime<Utc>) -> Self {
        Self {
            profile_id,
            online: true,
            last_seen: now,
        }
    }

    pub fn offline(profile_id: ProfileId, now: DateTime<Utc>) -> Self {
        Self {
            profile_id,
            online: false,
            last_seen: now,
        }
    }

    /// Online and seen within `window` of `now`. A stale record counts as
    /// offline whatever its flag says.
    pub fn is_fresh(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.online && now.signed_duration_since(self.last_seen) <= span(window)
    }
}

/// An entry of the online roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineUser {
    pub profile_id: ProfileId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub last_seen: DateTime<Utc>,
}

// ── Invitations ─────────────────────────────────────────────────────

/// Invitation state. `Accepted` and `Declined` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InviteStatus {
    Pending,
    Accepted,
    Declined,
}

/// A challenge from one profile to another, linked to a pending competition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invitation {
    pub id: InviteId,
    pub sender_id: ProfileId,
    pub receiver_id: ProfileId,
    pub competition_id: CompetitionId,
    pub status: InviteStatus,
    pub created_at: DateTime<Utc>,
}

/// Insert payload for an invitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewInvitation {
    pub sender_id: ProfileId,
    pub receiver_id: ProfileId,
    pub competition_id: CompetitionId,
}

// ── Competitions ────────────────────────────────────────────────────

/// Competition lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompetitionStatus {
    Pending,
    Active,
    Completed,
    Cancelled,
}

impl CompetitionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

/// Which of the two score fields a participant owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Seat {
    Player1,
    Player2,
}

/// One head-to-head match. Each player's client writes only its own score.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Competition {
    pub id: CompetitionId,
    pub player1_id: ProfileId,
    pub player2_id: ProfileId,
    pub player1_score: u32,
    pub player2_score: u32,
    pub status: CompetitionStatus,
    #[serde(default)]
    pub winner_id: Option<ProfileId>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    /// Bumped by the store on every write.
    pub revision: u64,
}

impl Competition {
    pub fn seat_of(&self, profile: ProfileId) -> Option<Seat> {
        if profile == self.player1_id {
            Some(Seat::Player1)
        } else if profile == self.player2_id {
            Some(Seat::Player2)
        } else {
            None
        }
    }

    pub fn score(&self, seat: Seat) -> u32 {
        match seat {
            Seat::Player1 => self.player1_score,
            Seat::Player2 => self.player2_score,
        }
    }

    pub fn opponent_of(&self, profile: ProfileId) -> Option<ProfileId> {
        match self.seat_of(profile)? {
            Seat::Player1 => Some(self.player2_id),
            Seat::Player2 => Some(self.player1_id),
        }
    }
}

/// Insert payload for a competition. Scores start at zero, status pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCompetition {
    pub player1_id: ProfileId,
    pub player2_id: ProfileId,
}

/// Condition a stored competition must meet for an update to land.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompetitionGuard {
    pub status: CompetitionStatus,
    /// The owner's score must still equal this value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<(Seat, u32)>,
}

impl CompetitionGuard {
    pub fn status(status: CompetitionStatus) -> Self {
        Self {
            status,
            score: None,
        }
    }

    #[must_use]
    pub fn with_score(mut self, seat: Seat, score: u32) -> Self {
        self.score = Some((seat, score));
        self
    }

    pub fn holds(&self, competition: &Competition) -> bool {
        competition.status == self.status
            && self
                .score
                .is_none_or(|(seat, score)| competition.score(seat) == score)
    }
}

/// Partial update of a competition. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompetitionPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<CompetitionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player1_score: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player2_score: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner_id: Option<ProfileId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl CompetitionPatch {
    pub fn activate(now: DateTime<Utc>) -> Self {
        Self {
            status: Some(CompetitionStatus::Active),
            started_at: Some(now),
            ..Self::default()
        }
    }

    pub fn cancel(now: DateTime<Utc>) -> Self {
        Self {
            status: Some(CompetitionStatus::Cancelled),
            ended_at: Some(now),
            ..Self::default()
        }
    }

    pub fn score(seat: Seat, value: u32) -> Self {
        match seat {
            Seat::Player1 => Self {
                player1_score: Some(value),
                ..Self::default()
            },
            Seat::Player2 => Self {
                player2_score: Some(value),
                ..Self::default()
            },
        }
    }

    /// Also mark the competition completed with `winner`.
    #[must_use]
    pub fn completed_by(mut self, winner: ProfileId, now: DateTime<Utc>) -> Self {
        self.status = Some(CompetitionStatus::Completed);
        self.winner_id = Some(winner);
        self.ended_at = Some(now);
        self
    }

    pub fn apply(&self, competition: &mut Competition) {
        if let Some(status) = self.status {
            competition.status = status;
        }
        if let Some(score) = self.player1_score {
            competition.player1_score = score;
        }
        if let Some(score) = self.player2_score {
            competition.player2_score = score;
        }
        if let Some(winner) = self.winner_id {
            competition.winner_id = Some(winner);
        }
        if let Some(at) = self.started_at {
            competition.started_at = Some(at);
        }
        if let Some(at) = self.ended_at {
            competition.ended_at = Some(at);
        }
    }
}

// ── Change feed ─────────────────────────────────────────────────────

/// Tables exposed through the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Presence,
    Invitations,
    Competitions,
}

/// Kind of write reported by the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A persisted row as carried by a change notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "table", content = "record", rename_all = "snake_case")]
pub enum Row {
    Presence(PresenceRecord),
    Invitations(Invitation),
    Competitions(Competition),
}

impl Row {
    pub fn table(&self) -> Table {
        match self {
            Row::Presence(_) => Table::Presence,
            Row::Invitations(_) => Table::Invitations,
            Row::Competitions(_) => Table::Competitions,
        }
    }
}

/// Equality filter on one column of a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "column", content = "eq", rename_all = "snake_case")]
pub enum RowFilter {
    /// Primary key (the profile id for presence rows).
    Id(Uuid),
    Player1(ProfileId),
    Player2(ProfileId),
    Sender(ProfileId),
    Receiver(ProfileId),
}

impl RowFilter {
    pub fn matches(&self, row: &Row) -> bool {
        match (self, row) {
            (RowFilter::Id(id), Row::Presence(p)) => p.profile_id == *id,
            (RowFilter::Id(id), Row::Invitations(i)) => i.id == *id,
            (RowFilter::Id(id), Row::Competitions(c)) => c.id == *id,
            (RowFilter::Player1(id), Row::Competitions(c)) => c.player1_id == *id,
            (RowFilter::Player2(id), Row::Competitions(c)) => c.player2_id == *id,
            (RowFilter::Sender(id), Row::Invitations(i)) => i.sender_id == *id,
            (RowFilter::Receiver(id), Row::Invitations(i)) => i.receiver_id == *id,
            _ => false,
        }
    }
}

/// A change-feed subscription on one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeFilter {
    pub table: Table,
    pub events: Vec<ChangeKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<RowFilter>,
}

impl ChangeFilter {
    pub fn matches(&self, kind: ChangeKind, row: &Row) -> bool {
        self.table == row.table()
            && self.events.contains(&kind)
            && self.filter.is_none_or(|filter| filter.matches(row))
    }
}

/// One committed write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub row: Row,
    pub commit_timestamp: DateTime<Utc>,
}

// ── Broadcasts ──────────────────────────────────────────────────────

/// Payload of a `game_invite` broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteBroadcast {
    pub from_profile_id: ProfileId,
    pub from_name: String,
    pub competition_id: CompetitionId,
    pub invite_id: InviteId,
    /// Milliseconds since the epoch, strictly increasing per sender.
    pub timestamp: i64,
}

/// Ephemeral events carried by broadcast channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum BroadcastEvent {
    GameInvite(InviteBroadcast),
    InviteCancelled {
        from_profile_id: ProfileId,
        competition_id: CompetitionId,
    },
}

// ── Frames ──────────────────────────────────────────────────────────

/// What a channel listens to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinConfig {
    /// Receive broadcasts published by other members.
    #[serde(default)]
    pub broadcast: bool,
    /// Change-feed subscriptions attached to the channel.
    #[serde(default)]
    pub changes: Vec<ChangeFilter>,
}

/// Frames sent from the client to the realtime service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientFrame {
    /// Join a channel. Answered by [`ServerFrame::JoinReply`].
    Join { topic: String, config: JoinConfig },
    /// Leave a channel. No reply.
    Leave { topic: String },
    /// Publish to every other member of a broadcast channel.
    Broadcast {
        topic: String,
        event: BroadcastEvent,
    },
}

/// Frames sent from the realtime service to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerFrame {
    /// Outcome of a join.
    JoinReply {
        topic: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_code: Option<String>,
    },
    /// A broadcast published by another member.
    Broadcast {
        topic: String,
        event: BroadcastEvent,
    },
    /// A committed write matching one of the channel's filters.
    Change { topic: String, change: ChangeEvent },
    /// The service closed the channel.
    ChannelClosed {
        topic: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Connection-level error.
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_code: Option<String>,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn competition() -> Competition {
        Competition {
            id: Uuid::from_u128(9),
            player1_id: Uuid::from_u128(1),
            player2_id: Uuid::from_u128(2),
            player1_score: 3,
            player2_score: 7,
            status: CompetitionStatus::Active,
            winner_id: None,
            started_at: None,
            ended_at: None,
            revision: 4,
        }
    }

    #[test]
    fn stale_presence_is_not_fresh() {
        let now = Utc::now();
        let record = PresenceRecord::online(Uuid::from_u128(1), now - chrono::Duration::seconds(121));
        assert!(!record.is_fresh(now, Duration::from_secs(120)));
        let record = PresenceRecord::online(Uuid::from_u128(1), now - chrono::Duration::seconds(30));
        assert!(record.is_fresh(now, Duration::from_secs(120)));
    }

    #[test]
    fn offline_flag_wins_over_recency() {
        let now = Utc::now();
        let record = PresenceRecord::offline(Uuid::from_u128(1), now);
        assert!(!record.is_fresh(now, Duration::from_secs(120)));
    }

    #[test]
    fn seats_and_opponents() {
        let c = competition();
        assert_eq!(c.seat_of(Uuid::from_u128(2)), Some(Seat::Player2));
        assert_eq!(c.seat_of(Uuid::from_u128(3)), None);
        assert_eq!(c.score(Seat::Player2), 7);
        assert_eq!(c.opponent_of(Uuid::from_u128(1)), Some(Uuid::from_u128(2)));
    }

    #[test]
    fn guard_checks_status_and_owned_score() {
        let c = competition();
        assert!(CompetitionGuard::status(CompetitionStatus::Active).holds(&c));
        assert!(!CompetitionGuard::status(CompetitionStatus::Pending).holds(&c));
        let guard = CompetitionGuard::status(CompetitionStatus::Active).with_score(Seat::Player1, 3);
        assert!(guard.holds(&c));
        let guard = CompetitionGuard::status(CompetitionStatus::Active).with_score(Seat::Player1, 2);
        assert!(!guard.holds(&c));
    }

    #[test]
    fn completing_patch_touches_only_owned_score() {
        let mut c = competition();
        let now = Utc::now();
        CompetitionPatch::score(Seat::Player2, 8)
            .completed_by(c.player2_id, now)
            .apply(&mut c);
        assert_eq!(c.player1_score, 3);
        assert_eq!(c.player2_score, 8);
        assert_eq!(c.status, CompetitionStatus::Completed);
        assert_eq!(c.winner_id, Some(c.player2_id));
        assert_eq!(c.ended_at, Some(now));
    }

    #[test]
    fn row_filters_are_table_aware() {
        let row = Row::Competitions(competition());
        assert!(RowFilter::Player1(Uuid::from_u128(1)).matches(&row));
        assert!(!RowFilter::Sender(Uuid::from_u128(1)).matches(&row));
        let filter = ChangeFilter {
            table: Table::Competitions,
            events: vec![ChangeKind::Update],
            filter: Some(RowFilter::Id(Uuid::from_u128(9))),
        };
        assert!(filter.matches(ChangeKind::Update, &row));
        assert!(!filter.matches(ChangeKind::Insert, &row));
    }

    #[test]
    fn broadcast_event_wire_shape() {
        let event = BroadcastEvent::InviteCancelled {
            from_profile_id: Uuid::nil(),
            competition_id: Uuid::nil(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "invite_cancelled");
        assert!(json["payload"]["competition_id"].is_string());
    }
}
