//! Invite protocol.
//!
//! An invitation moves `pending → accepted` or `pending → declined` and never
//! leaves a terminal state. The linked competition moves with it
//! (`pending → active` on accept, `pending → cancelled` on decline, cancel, or
//! expiry). The competition row is the arbiter: every transition first
//! conditionally updates the competition out of `pending`, and only the
//! caller whose update lands goes on to settle the invitation.
//!
//! The `game_invite` broadcast is a hint. The persisted invitation is the
//! source of truth, and a receiver that missed the hint finds it again through
//! [`InviteProtocol::pending_invitations`] or its invitation change feed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::{DuelError, Result};
use crate::protocol::{
    span, BroadcastEvent, ChangeKind, Competition, CompetitionGuard, CompetitionId,
    CompetitionPatch, CompetitionStatus, InviteBroadcast, InviteId, InviteStatus, Invitation,
    NewCompetition, NewInvitation, Profile, ProfileId, Row,
};
use crate::presence::PresenceTracker;
use crate::realtime::{Channel, ChannelMessage, RealtimeHandle, Topic};
use crate::recent::RecentSet;
use crate::store::{InvitationQuery, Store};

/// Challenges a listener remembers for deduplication.
const REMEMBERED_INVITES: usize = 256;

/// A challenge the local profile sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteHandle {
    pub invitation: Invitation,
    pub competition: Competition,
}

/// A challenge addressed to the local profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteNotice {
    pub invite_id: InviteId,
    pub from_profile_id: ProfileId,
    pub from_name: String,
    pub competition_id: CompetitionId,
}

/// What an [`InviteListener`] yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InviteSignal {
    Received(InviteNotice),
    Cancelled {
        from_profile_id: ProfileId,
        competition_id: CompetitionId,
    },
}

/// How the receiver answered a challenge the local profile sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub competition: Competition,
    pub accepted: bool,
}

/// Sends, answers, and withdraws challenges.
pub struct InviteProtocol {
    store: Arc<dyn Store>,
    realtime: RealtimeHandle,
    presence: PresenceTracker,
    invite_ttl: Duration,
    last_stamp: AtomicI64,
}

impl InviteProtocol {
    pub fn new(
        store: Arc<dyn Store>,
        realtime: RealtimeHandle,
        presence: PresenceTracker,
        invite_ttl: Duration,
    ) -> Self {
        Self {
            store,
            realtime,
            presence,
            invite_ttl,
            last_stamp: AtomicI64::new(0),
        }
    }

    /// Challenge `to`: create a pending competition, a pending invitation
    /// linked to it, and announce it on the recipient's two invite channels.
    ///
    /// # Errors
    ///
    /// - [`DuelError::SelfInvite`] if `to` is the sender
    /// - [`DuelError::AlreadyInviting`] if a pending invitation to `to` exists
    /// - [`DuelError::TargetOffline`] if `to` is not in the roster
    /// - the announcement error if neither channel could be reached; the
    ///   persisted invitation then stays pending and discoverable
    pub async fn send_invite(&self, from: &Profile, to: ProfileId) -> Result<InviteHandle> {
        if from.id == to {
            return Err(DuelError::SelfInvite);
        }
        self.expire_stale_invites(from.id).await?;
        if !self
            .live(InvitationQuery::pending_between(from.id, to))
            .await?
            .is_empty()
        {
            return Err(DuelError::AlreadyInviting);
        }
        if !self.presence.is_online(to, from.id).await? {
            return Err(DuelError::TargetOffline);
        }

        let competition = self
            .store
            .insert_competition(NewCompetition {
                player1_id: from.id,
                player2_id: to,
            })
            .await?;
        let invitation = self
            .store
            .insert_invitation(NewInvitation {
                sender_id: from.id,
                receiver_id: to,
                competition_id: competition.id,
            })
            .await?;

        // Two senders racing past the pending check both insert. The oldest
        // invitation of the pair wins; everyone else withdraws their own.
        let pending = self
            .live(InvitationQuery::pending_between(from.id, to))
            .await?;
        let oldest = pending
            .iter()
            .min_by_key(|candidate| (candidate.created_at, candidate.id))
            .map(|candidate| candidate.id);
        if oldest.is_some_and(|id| id != invitation.id) {
            debug!(invite = %invitation.id, "lost a concurrent invite race, withdrawing");
            self.withdraw(&invitation).await?;
            return Err(DuelError::AlreadyInviting);
        }

        info!(
            from = %from.id,
            to = %to,
            competition = %competition.id,
            invite = %invitation.id,
            "invitation created"
        );

        let payload = InviteBroadcast {
            from_profile_id: from.id,
            from_name: from.name.clone(),
            competition_id: competition.id,
            invite_id: invitation.id,
            timestamp: self.next_stamp(),
        };
        if let Err(e) = self.announce(to, BroadcastEvent::GameInvite(payload)).await {
            // Nobody heard about it; take it back unless the receiver already
            // found it through the change feed and answered.
            match self.withdraw(&invitation).await {
                Ok(true) => {
                    warn!(invite = %invitation.id, error = %e, "invite could not be announced, withdrawn");
                    return Err(e);
                }
                Ok(false) => {
                    debug!(invite = %invitation.id, error = %e, "announce failed after the receiver answered");
                }
                Err(withdraw_error) => {
                    warn!(invite = %invitation.id, error = %withdraw_error, "could not withdraw unannounced invite");
                    return Err(e);
                }
            }
        }

        Ok(InviteHandle {
            invitation,
            competition,
        })
    }

    /// Accept or decline `invitation` as `me`.
    ///
    /// Returns the competition as written: `active` on accept, `cancelled` on
    /// decline.
    ///
    /// # Errors
    ///
    /// - [`DuelError::NotReceiver`] if `me` is not the invited profile
    /// - [`DuelError::StaleInvite`] if the invitation or its competition is no
    ///   longer pending, including when a concurrent cancel won
    pub async fn respond_to_invite(
        &self,
        me: ProfileId,
        invitation: &Invitation,
        accept: bool,
    ) -> Result<Competition> {
        if invitation.receiver_id != me {
            return Err(DuelError::NotReceiver);
        }
        let stored = self
            .store
            .invitation(invitation.id)
            .await?
            .ok_or(DuelError::StaleInvite)?;
        if stored.receiver_id != me {
            return Err(DuelError::NotReceiver);
        }
        if stored.status != InviteStatus::Pending {
            return Err(DuelError::StaleInvite);
        }

        let now = Utc::now();
        let patch = if accept {
            CompetitionPatch::activate(now)
        } else {
            CompetitionPatch::cancel(now)
        };
        let Some(competition) = self
            .store
            .update_competition(
                stored.competition_id,
                CompetitionGuard::status(CompetitionStatus::Pending),
                patch,
            )
            .await?
        else {
            settle(self.store.as_ref(), &stored).await?;
            return Err(DuelError::StaleInvite);
        };

        let next = if accept {
            InviteStatus::Accepted
        } else {
            InviteStatus::Declined
        };
        // The match already moved, so the answer stands. An invitation left
        // pending here is settled by the next read that finds it.
        match self
            .store
            .update_invitation(stored.id, InviteStatus::Pending, next)
            .await
            .map_err(DuelError::from)
        {
            Ok(Some(_)) => {}
            Ok(None) => warn!(invite = %stored.id, "invitation left its pending state concurrently"),
            Err(DuelError::SessionExpired) => return Err(DuelError::SessionExpired),
            Err(e) => warn!(invite = %stored.id, error = %e, "invitation left pending while its match moved on"),
        }

        info!(
            invite = %stored.id,
            competition = %competition.id,
            accepted = accept,
            "invitation answered"
        );
        Ok(competition)
    }

    /// Withdraw a challenge the local profile sent and tell the receiver.
    ///
    /// # Errors
    ///
    /// [`DuelError::StaleInvite`] if the receiver already answered.
    pub async fn cancel_invite(&self, handle: &InviteHandle) -> Result<()> {
        let invitation = &handle.invitation;
        if !self.withdraw(invitation).await? {
            return Err(DuelError::StaleInvite);
        }
        info!(invite = %invitation.id, competition = %invitation.competition_id, "invitation cancelled");

        let event = BroadcastEvent::InviteCancelled {
            from_profile_id: invitation.sender_id,
            competition_id: invitation.competition_id,
        };
        if let Err(e) = self.announce(invitation.receiver_id, event).await {
            warn!(invite = %invitation.id, error = %e, "could not announce cancellation");
        }
        Ok(())
    }

    /// Pending invitations addressed to `me`, oldest first.
    pub async fn pending_invitations(&self, me: ProfileId) -> Result<Vec<Invitation>> {
        self.live(InvitationQuery::pending_for(me)).await
    }

    /// Cancel `from`'s own pending invitations older than the invite TTL.
    /// Returns how many were cancelled.
    pub async fn expire_stale_invites(&self, from: ProfileId) -> Result<usize> {
        let cutoff = Utc::now() - span(self.invite_ttl);
        let mut expired = 0;
        for invitation in self
            .store
            .invitations(InvitationQuery::pending_from(from))
            .await?
        {
            if invitation.created_at > cutoff {
                continue;
            }
            if self.withdraw(&invitation).await? {
                debug!(invite = %invitation.id, "expired dangling invitation");
                expired += 1;
            }
        }
        Ok(expired)
    }

    /// Join the local profile's invite channels.
    pub async fn listen(&self, me: ProfileId) -> Result<InviteListener> {
        let roster = self.realtime.open_channel(Topic::InviteRoster(me)).await?;
        let inbox = self.realtime.open_channel(Topic::InviteInbox(me)).await?;
        let feed = self
            .realtime
            .open_channel(Topic::IncomingInvitations(me))
            .await?;
        Ok(InviteListener {
            me,
            store: Arc::clone(&self.store),
            roster,
            inbox,
            feed,
            seen: RecentSet::new(REMEMBERED_INVITES),
            cancelled: RecentSet::new(REMEMBERED_INVITES),
        })
    }

    /// Follow the answers to challenges the local profile sends.
    pub async fn watch_outgoing(&self, me: ProfileId) -> Result<OutgoingWatch> {
        let channel = self
            .realtime
            .open_channel(Topic::OutgoingChallenges(me))
            .await?;
        Ok(OutgoingWatch {
            channel,
            resolved: RecentSet::new(REMEMBERED_INVITES),
        })
    }

    /// Pending invitations matching `query` whose match is still pending.
    async fn live(&self, query: InvitationQuery) -> Result<Vec<Invitation>> {
        let mut live = Vec::new();
        for invitation in self.store.invitations(query).await? {
            if settle(self.store.as_ref(), &invitation).await? {
                live.push(invitation);
            }
        }
        Ok(live)
    }

    /// Cancel the competition, then decline the invitation. `false` if the
    /// competition had already left `pending`; the invitation is then settled
    /// to agree with it.
    async fn withdraw(&self, invitation: &Invitation) -> Result<bool> {
        let cancelled = self
            .store
            .update_competition(
                invitation.competition_id,
                CompetitionGuard::status(CompetitionStatus::Pending),
                CompetitionPatch::cancel(Utc::now()),
            )
            .await?;
        if cancelled.is_none() {
            settle(self.store.as_ref(), invitation).await?;
            return Ok(false);
        }
        self.store
            .update_invitation(invitation.id, InviteStatus::Pending, InviteStatus::Declined)
            .await?;
        Ok(true)
    }

    /// Publish `event` on both of `to`'s invite channels. Succeeds if at
    /// least one publish went out. Both channels are joined at once, so the
    /// whole step is bounded by one subscribe timeout.
    async fn announce(&self, to: ProfileId, event: BroadcastEvent) -> Result<()> {
        let publish = |topic: Topic| {
            let event = event.clone();
            async move {
                match self.realtime.open_channel(topic).await {
                    Ok(channel) => channel.publish(event),
                    Err(e) => Err(e),
                }
            }
        };
        let (roster, inbox) = tokio::join!(
            publish(Topic::InviteRoster(to)),
            publish(Topic::InviteInbox(to))
        );

        let mut last_error = None;
        let mut delivered = 0;
        for (topic, outcome) in [(Topic::InviteRoster(to), roster), (Topic::InviteInbox(to), inbox)] {
            match outcome {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(to = %to, topic = ?topic, error = %e, "invite announcement failed");
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) if delivered == 0 => Err(e),
            _ => Ok(()),
        }
    }

    /// Milliseconds since the epoch, strictly increasing across calls.
    fn next_stamp(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let previous = self
            .last_stamp
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |prev| {
                Some(now.max(prev + 1))
            })
            .unwrap_or_else(|prev| prev);
        now.max(previous + 1)
    }
}

impl std::fmt::Debug for InviteProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InviteProtocol")
            .field("invite_ttl", &self.invite_ttl)
            .finish()
    }
}

/// Incoming challenges from every path, deduplicated by
/// `(from_profile_id, competition_id)`.
pub struct InviteListener {
    me: ProfileId,
    store: Arc<dyn Store>,
    roster: Channel,
    inbox: Channel,
    feed: Channel,
    seen: RecentSet<(ProfileId, CompetitionId)>,
    cancelled: RecentSet<(ProfileId, CompetitionId)>,
}

impl std::fmt::Debug for InviteListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InviteListener")
            .field("me", &self.me)
            .field("seen", &self.seen.len())
            .finish()
    }
}

impl InviteListener {
    /// Pending invitations already in the store, as signals. Marks them seen
    /// so a later hint for the same challenge is not reported twice.
    pub async fn catch_up(&mut self) -> Result<Vec<InviteSignal>> {
        let mut pending = Vec::new();
        for invitation in self
            .store
            .invitations(InvitationQuery::pending_for(self.me))
            .await?
        {
            if settle(self.store.as_ref(), &invitation).await?
                && self.seen.insert((invitation.sender_id, invitation.competition_id))
            {
                pending.push(invitation);
            }
        }
        if pending.is_empty() {
            return Ok(Vec::new());
        }
        let senders: Vec<ProfileId> = pending.iter().map(|i| i.sender_id).collect();
        let names = sender_names(self.store.as_ref(), &senders).await;
        Ok(pending
            .into_iter()
            .map(|invitation| InviteSignal::Received(notice(&invitation, &names)))
            .collect())
    }

    /// Next signal, or `None` once the connection is gone.
    pub async fn next(&mut self) -> Option<InviteSignal> {
        loop {
            let message = tokio::select! {
                message = self.roster.recv() => message,
                message = self.inbox.recv() => message,
                message = self.feed.recv() => message,
            };
            if let Some(signal) = self.interpret(message?).await {
                return Some(signal);
            }
        }
    }

    async fn interpret(&mut self, message: ChannelMessage) -> Option<InviteSignal> {
        match message {
            ChannelMessage::Broadcast(BroadcastEvent::GameInvite(payload)) => {
                if payload.from_profile_id == self.me
                    || !self
                        .seen
                        .insert((payload.from_profile_id, payload.competition_id))
                {
                    return None;
                }
                Some(InviteSignal::Received(InviteNotice {
                    invite_id: payload.invite_id,
                    from_profile_id: payload.from_profile_id,
                    from_name: payload.from_name,
                    competition_id: payload.competition_id,
                }))
            }
            ChannelMessage::Broadcast(BroadcastEvent::InviteCancelled {
                from_profile_id,
                competition_id,
            }) => self
                .cancelled
                .insert((from_profile_id, competition_id))
                .then_some(InviteSignal::Cancelled {
                    from_profile_id,
                    competition_id,
                }),
            ChannelMessage::Change(change) => {
                let Row::Invitations(invitation) = change.row else {
                    return None;
                };
                if change.kind != ChangeKind::Insert
                    || invitation.receiver_id != self.me
                    || invitation.status != InviteStatus::Pending
                    || !self
                        .seen
                        .insert((invitation.sender_id, invitation.competition_id))
                {
                    return None;
                }
                let names = sender_names(self.store.as_ref(), &[invitation.sender_id]).await;
                Some(InviteSignal::Received(notice(&invitation, &names)))
            }
            ChannelMessage::Closed { reason } => {
                debug!(?reason, "invite channel closed by service");
                None
            }
        }
    }
}

/// Answers to the local profile's challenges, one per competition.
#[derive(Debug)]
pub struct OutgoingWatch {
    channel: Channel,
    resolved: RecentSet<CompetitionId>,
}

impl OutgoingWatch {
    /// Next answer, or `None` once the feed ends.
    pub async fn next(&mut self) -> Option<Resolution> {
        loop {
            let ChannelMessage::Change(change) = self.channel.recv().await? else {
                continue;
            };
            let Row::Competitions(competition) = change.row else {
                continue;
            };
            let accepted = match competition.status {
                CompetitionStatus::Active => true,
                CompetitionStatus::Cancelled => false,
                CompetitionStatus::Pending | CompetitionStatus::Completed => continue,
            };
            if self.resolved.insert(competition.id) {
                return Some(Resolution {
                    competition,
                    accepted,
                });
            }
        }
    }
}

/// Bring a pending invitation in line with its match, repairing one left
/// behind by an interrupted transition. `true` while the match is still
/// pending and the invitation therefore still open.
async fn settle(store: &dyn Store, invitation: &Invitation) -> Result<bool> {
    if invitation.status != InviteStatus::Pending {
        return Ok(false);
    }
    let next = match store.competition(invitation.competition_id).await? {
        Some(competition) => match competition.status {
            CompetitionStatus::Pending => return Ok(true),
            CompetitionStatus::Active | CompetitionStatus::Completed => InviteStatus::Accepted,
            CompetitionStatus::Cancelled => InviteStatus::Declined,
        },
        None => InviteStatus::Declined,
    };
    if store
        .update_invitation(invitation.id, InviteStatus::Pending, next)
        .await?
        .is_some()
    {
        info!(invite = %invitation.id, status = ?next, "settled invitation to match its competition");
    }
    Ok(false)
}

async fn sender_names(store: &dyn Store, ids: &[ProfileId]) -> HashMap<ProfileId, String> {
    match store.profiles(ids).await {
        Ok(profiles) => profiles
            .into_iter()
            .map(|profile| (profile.id, profile.name))
            .collect(),
        Err(e) => {
            warn!(error = %e, "could not look up invite senders");
            HashMap::new()
        }
    }
}

fn notice(invitation: &Invitation, names: &HashMap<ProfileId, String>) -> InviteNotice {
    InviteNotice {
        invite_id: invitation.id,
        from_profile_id: invitation.sender_id,
        from_name: names
            .get(&invitation.sender_id)
            .cloned()
            .unwrap_or_else(|| invitation.sender_id.to_string()),
        competition_id: invitation.competition_id,
    }
}
