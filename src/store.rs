//! Persisted-store and reward collaborator contracts.
//!
//! The coordination core never talks to a database directly. It consumes a
//! [`Store`] that exposes the three shared tables (presence, invitations,
//! competitions) and a [`Progress`] collaborator that grants rewards. Row-level
//! authorization is the store's job and is not re-checked here.
//!
//! Every status transition goes through a conditional update: the write only
//! lands if the stored row still matches the caller's expectation, and the
//! store reports a miss as `Ok(None)`.

use std::error::Error;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::error_codes::ErrorCode;
use crate::protocol::{
    Competition, CompetitionGuard, CompetitionId, CompetitionPatch, InviteId, InviteStatus,
    Invitation, NewCompetition, NewInvitation, PresenceRecord, Profile, ProfileId,
};

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Error raised by store backends regardless of the underlying database.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached.
    #[error("store unavailable: {message}")]
    Unavailable {
        message: String,
        #[source]
        source: Option<Box<dyn Error + Send + Sync>>,
    },
    /// The backend answered with an error.
    #[error("store rejected request: {message}")]
    Rejected {
        code: Option<String>,
        message: String,
    },
}

impl StoreError {
    /// Construct an unavailable error from any backend failure.
    pub fn unavailable(message: impl Into<String>, source: impl Error + Send + Sync + 'static) -> Self {
        StoreError::Unavailable {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Construct an unavailable error with no underlying cause.
    pub fn offline(message: impl Into<String>) -> Self {
        StoreError::Unavailable {
            message: message.into(),
            source: None,
        }
    }

    /// Construct a rejection carrying the backend's error code.
    pub fn rejected(code: Option<&str>, message: impl Into<String>) -> Self {
        StoreError::Rejected {
            code: code.map(str::to_owned),
            message: message.into(),
        }
    }

    /// Returns `true` if the backend refused the session credential.
    pub fn is_session_expiry(&self) -> bool {
        match self {
            StoreError::Rejected { code, message } => {
                ErrorCode::is_session_expiry(code.as_deref(), message)
            }
            StoreError::Unavailable { .. } => false,
        }
    }
}

/// Selects invitations by sender, receiver, and status. `None` matches anything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvitationQuery {
    pub sender_id: Option<ProfileId>,
    pub receiver_id: Option<ProfileId>,
    pub status: Option<InviteStatus>,
}

impl InvitationQuery {
    /// Pending invitations from `sender` to `receiver`.
    pub fn pending_between(sender: ProfileId, receiver: ProfileId) -> Self {
        Self {
            sender_id: Some(sender),
            receiver_id: Some(receiver),
            status: Some(InviteStatus::Pending),
        }
    }

    /// Pending invitations sent by `sender`.
    pub fn pending_from(sender: ProfileId) -> Self {
        Self {
            sender_id: Some(sender),
            status: Some(InviteStatus::Pending),
            ..Self::default()
        }
    }

    /// Pending invitations addressed to `receiver`.
    pub fn pending_for(receiver: ProfileId) -> Self {
        Self {
            receiver_id: Some(receiver),
            status: Some(InviteStatus::Pending),
            ..Self::default()
        }
    }

    pub fn matches(&self, invitation: &Invitation) -> bool {
        self.sender_id.is_none_or(|id| id == invitation.sender_id)
            && self.receiver_id.is_none_or(|id| id == invitation.receiver_id)
            && self.status.is_none_or(|status| status == invitation.status)
    }
}

/// The shared relational store.
///
/// Every write emits a change notification to realtime subscribers whose
/// filters match the written row, and bumps the row's `revision` when the row
/// is a competition.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Insert or replace the presence record of `record.profile_id`.
    async fn upsert_presence(&self, record: PresenceRecord) -> StoreResult<PresenceRecord>;

    /// Presence records flagged online and seen at or after `since`.
    async fn online_presence(&self, since: DateTime<Utc>) -> StoreResult<Vec<PresenceRecord>>;

    /// Display data for the given profiles. Unknown ids are skipped.
    async fn profiles(&self, ids: &[ProfileId]) -> StoreResult<Vec<Profile>>;

    /// Create a pending competition with both scores at zero.
    async fn insert_competition(&self, new: NewCompetition) -> StoreResult<Competition>;

    async fn competition(&self, id: CompetitionId) -> StoreResult<Option<Competition>>;

    /// Apply `patch` only if the stored row satisfies `guard`.
    ///
    /// Returns `Ok(None)` when the row is missing or the guard does not hold.
    async fn update_competition(
        &self,
        id: CompetitionId,
        guard: CompetitionGuard,
        patch: CompetitionPatch,
    ) -> StoreResult<Option<Competition>>;

    /// Create a pending invitation.
    async fn insert_invitation(&self, new: NewInvitation) -> StoreResult<Invitation>;

    async fn invitation(&self, id: InviteId) -> StoreResult<Option<Invitation>>;

    async fn invitations(&self, query: InvitationQuery) -> StoreResult<Vec<Invitation>>;

    /// Move an invitation from `expected` to `next`.
    ///
    /// Returns `Ok(None)` when the row is missing or not in `expected`.
    async fn update_invitation(
        &self,
        id: InviteId,
        expected: InviteStatus,
        next: InviteStatus,
    ) -> StoreResult<Option<Invitation>>;
}

/// Progress tracking collaborator that owns reward bookkeeping.
#[async_trait]
pub trait Progress: Send + Sync + 'static {
    /// Grant one free mini-game to `profile`.
    async fn award_free_game(&self, profile: ProfileId) -> StoreResult<()>;
}
