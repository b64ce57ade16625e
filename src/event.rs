//! Events delivered to the presentation layer.

use crate::protocol::{Competition, CompetitionId, InviteId, ProfileId};

/// An event emitted by a running [`DuelClient`](crate::DuelClient).
///
/// `Disconnected` is always the last event of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DuelEvent {
    /// The realtime connection is up.
    Connected,
    /// A presence row changed; re-read the roster.
    RosterChanged,
    /// Someone challenged the local profile. Delivered once per
    /// `(from_profile_id, competition_id)` whichever path it arrived on.
    InviteReceived {
        invite_id: InviteId,
        from_profile_id: ProfileId,
        from_name: String,
        competition_id: CompetitionId,
    },
    /// The sender withdrew a challenge.
    InviteCancelled {
        from_profile_id: ProfileId,
        competition_id: CompetitionId,
    },
    /// A challenge sent by the local profile was answered.
    InviteResolved {
        competition_id: CompetitionId,
        accepted: bool,
    },
    /// The local view of a followed match changed.
    MatchUpdated(Competition),
    /// A followed match finished. Delivered once per match.
    MatchCompleted { competition: Competition, won: bool },
    /// The store refused the credential; sign out and re-authenticate.
    SessionExpired,
    /// The realtime connection is gone. Live views are stale until a new
    /// client is started.
    Disconnected { reason: Option<String> },
}
