//! Match synchronizer.
//!
//! Each player's client owns exactly one score field and is its only writer.
//! A score write is conditional on the match still being active and on the
//! owner's score still holding the value it was read at, so two increments
//! from the same player never collapse into one. The write that reaches the
//! win threshold completes the match in the same update, and once the status
//! is `completed` every later write misses its guard.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::{DuelError, Result};
use crate::lock;
use crate::protocol::{
    Competition, CompetitionGuard, CompetitionId, CompetitionPatch, CompetitionStatus, ProfileId,
    Row,
};
use crate::realtime::{Channel, ChannelMessage, RealtimeHandle, Topic};
use crate::store::{Progress, Store};

/// Correct answers needed to win.
pub const DEFAULT_WIN_THRESHOLD: u32 = 15;

/// Guarded writes attempted before giving up on a contended score field.
const MAX_SCORE_ATTEMPTS: usize = 8;

/// Outcome of one correct answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoreReport {
    /// The competition as written.
    pub competition: Competition,
    /// The caller's new score.
    pub score: u32,
    /// This answer won the match.
    pub won: bool,
}

/// Writes scores and follows live matches.
pub struct MatchSync {
    store: Arc<dyn Store>,
    progress: Arc<dyn Progress>,
    realtime: RealtimeHandle,
    win_threshold: u32,
    awarded: Arc<Mutex<HashSet<CompetitionId>>>,
}

impl MatchSync {
    /// `win_threshold` is clamped to at least 1.
    pub fn new(
        store: Arc<dyn Store>,
        progress: Arc<dyn Progress>,
        realtime: RealtimeHandle,
        win_threshold: u32,
    ) -> Self {
        Self {
            store,
            progress,
            realtime,
            win_threshold: win_threshold.max(1),
            awarded: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn win_threshold(&self) -> u32 {
        self.win_threshold
    }

    /// Add one to `me`'s score in `competition`, completing the match with
    /// `me` as winner if the new score reaches the threshold.
    ///
    /// # Errors
    ///
    /// - [`DuelError::MatchNotFound`] if the competition does not exist
    /// - [`DuelError::NotParticipant`] if `me` is not one of the players
    /// - [`DuelError::MatchNotActive`] if the match is not active, including
    ///   when the opponent completed it first; nothing is written
    pub async fn report_correct_answer(
        &self,
        competition: CompetitionId,
        me: ProfileId,
    ) -> Result<ScoreReport> {
        for attempt in 1..=MAX_SCORE_ATTEMPTS {
            let current = self
                .store
                .competition(competition)
                .await?
                .ok_or(DuelError::MatchNotFound)?;
            let seat = current.seat_of(me).ok_or(DuelError::NotParticipant)?;
            if current.status != CompetitionStatus::Active {
                return Err(DuelError::MatchNotActive);
            }

            let previous = current.score(seat);
            let score = previous.saturating_add(1);
            let won = score >= self.win_threshold;
            let mut patch = CompetitionPatch::score(seat, score);
            if won {
                patch = patch.completed_by(me, Utc::now());
            }
            let guard = CompetitionGuard::status(CompetitionStatus::Active).with_score(seat, previous);

            match self
                .store
                .update_competition(competition, guard, patch)
                .await?
            {
                Some(written) => {
                    debug!(competition = %competition, profile = %me, score, "score written");
                    if won {
                        info!(competition = %competition, winner = %me, score, "match completed");
                        self.award_once(&written, me).await;
                    }
                    return Ok(ScoreReport {
                        competition: written,
                        score,
                        won,
                    });
                }
                None => debug!(competition = %competition, attempt, "score guard missed, re-reading"),
            }
        }
        warn!(competition = %competition, profile = %me, "score field stayed contended");
        Err(DuelError::Timeout)
    }

    /// Grant `me` a free game if `competition` is a win for `me` that has not
    /// been rewarded yet. Returns `true` if the award was made by this call.
    ///
    /// A failed award is forgotten so a later notification can retry it.
    pub async fn award_once(&self, competition: &Competition, me: ProfileId) -> bool {
        if competition.status != CompetitionStatus::Completed || competition.winner_id != Some(me) {
            return false;
        }
        if !lock(&self.awarded).insert(competition.id) {
            return false;
        }
        match self.progress.award_free_game(me).await {
            Ok(()) => {
                info!(competition = %competition.id, profile = %me, "free game awarded");
                true
            }
            Err(e) => {
                warn!(competition = %competition.id, profile = %me, error = %e, "free game award failed");
                lock(&self.awarded).remove(&competition.id);
                false
            }
        }
    }

    /// Follow `competition`. The feed yields the current row first, then
    /// every change either player writes.
    ///
    /// # Errors
    ///
    /// [`DuelError::MatchNotFound`] if the competition does not exist, or any
    /// channel error.
    pub async fn subscribe_to_match(&self, competition: CompetitionId) -> Result<MatchFeed> {
        let channel = self
            .realtime
            .open_channel(Topic::Competition(competition))
            .await?;
        // Fetch after joining so no write falls between the two.
        let current = self
            .store
            .competition(competition)
            .await?
            .ok_or(DuelError::MatchNotFound)?;
        Ok(MatchFeed {
            channel,
            initial: Some(current),
        })
    }
}

impl std::fmt::Debug for MatchSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatchSync")
            .field("win_threshold", &self.win_threshold)
            .field("awarded", &lock(&self.awarded).len())
            .finish()
    }
}

/// Rows of one competition, as seen by the local client.
#[derive(Debug)]
pub struct MatchFeed {
    channel: Channel,
    initial: Option<Competition>,
}

impl MatchFeed {
    /// Next row, or `None` once the feed ends.
    pub async fn next(&mut self) -> Option<Competition> {
        if let Some(current) = self.initial.take() {
            return Some(current);
        }
        loop {
            match self.channel.recv().await? {
                ChannelMessage::Change(change) => {
                    if let Row::Competitions(competition) = change.row {
                        return Some(competition);
                    }
                }
                ChannelMessage::Closed { reason } => {
                    debug!(?reason, "match feed closed by service");
                }
                ChannelMessage::Broadcast(_) => {}
            }
        }
    }
}

/// What [`MatchView::reconcile`] did with an incoming row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconcile {
    Applied,
    /// Identical to the local view.
    Duplicate,
    /// Older than the local view, or for another competition.
    Stale,
}

/// The local copy of one competition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchView {
    current: Competition,
}

impl MatchView {
    pub fn new(current: Competition) -> Self {
        Self { current }
    }

    pub fn current(&self) -> &Competition {
        &self.current
    }

    /// Replace the local view with `incoming` unless it is an older echo.
    pub fn reconcile(&mut self, incoming: Competition) -> Reconcile {
        if incoming.id != self.current.id || incoming.revision < self.current.revision {
            return Reconcile::Stale;
        }
        if incoming == self.current {
            return Reconcile::Duplicate;
        }
        self.current = incoming;
        Reconcile::Applied
    }
}

/// What a [`MatchTracker`] reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchSignal {
    Updated(Competition),
    /// Reported once per competition.
    Completed { competition: Competition, won: bool },
}

/// Turns local writes and remote notifications into view updates and a
/// single completion.
#[derive(Debug, Clone)]
pub struct MatchTracker {
    me: ProfileId,
    view: Option<MatchView>,
    completion_reported: bool,
}

impl MatchTracker {
    pub fn new(me: ProfileId) -> Self {
        Self {
            me,
            view: None,
            completion_reported: false,
        }
    }

    pub fn view(&self) -> Option<&Competition> {
        self.view.as_ref().map(MatchView::current)
    }

    pub fn is_finished(&self) -> bool {
        self.completion_reported
    }

    pub fn observe(&mut self, incoming: Competition) -> Vec<MatchSignal> {
        let outcome = match self.view.as_mut() {
            Some(view) => view.reconcile(incoming),
            None => {
                self.view = Some(MatchView::new(incoming));
                Reconcile::Applied
            }
        };
        let Some(current) = self.view.as_ref().map(MatchView::current) else {
            return Vec::new();
        };
        if outcome != Reconcile::Applied {
            debug!(competition = %current.id, ?outcome, "match row not applied");
            return Vec::new();
        }

        let mut signals = vec![MatchSignal::Updated(current.clone())];
        if current.status == CompetitionStatus::Completed && !self.completion_reported {
            self.completion_reported = true;
            signals.push(MatchSignal::Completed {
                competition: current.clone(),
                won: current.winner_id == Some(self.me),
            });
        }
        signals
    }
}
