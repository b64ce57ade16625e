//! Error types for the duel coordination core.

use thiserror::Error;

use crate::error_codes::ErrorCode;
use crate::store::StoreError;

/// Errors that can occur while coordinating presence, invitations, and matches.
#[derive(Debug, Error)]
pub enum DuelError {
    /// Failed to send a frame through the transport.
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// Failed to receive a frame from the transport.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// The transport connection was closed unexpectedly.
    #[error("transport connection closed")]
    TransportClosed,

    /// Failed to serialize or deserialize a wire frame.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The realtime connection is gone.
    #[error("not connected to the realtime service")]
    NotConnected,

    /// An operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// The realtime service refused to join a channel.
    #[error("channel {topic} rejected: {reason}")]
    JoinRejected {
        /// Wire name of the channel.
        topic: String,
        /// Reason reported by the service.
        reason: String,
    },

    /// Only broadcast channels accept published events.
    #[error("channel {0} does not carry broadcasts")]
    NotBroadcastChannel(String),

    /// The persisted store failed.
    #[error("store error: {0}")]
    Store(StoreError),

    /// A profile tried to challenge itself.
    #[error("cannot invite yourself")]
    SelfInvite,

    /// A pending invitation already exists for this sender and receiver.
    #[error("an invitation to this player is already pending")]
    AlreadyInviting,

    /// The target profile is not in the online roster.
    #[error("the invited player is not online")]
    TargetOffline,

    /// The invitation or its match is no longer pending.
    #[error("the invitation is no longer valid")]
    StaleInvite,

    /// Only the invited profile may answer an invitation.
    #[error("only the invited player can respond")]
    NotReceiver,

    /// The competition record does not exist.
    #[error("match not found")]
    MatchNotFound,

    /// The competition is not accepting score updates.
    #[error("match is not active")]
    MatchNotActive,

    /// The profile is not one of the two players.
    #[error("profile is not a participant of this match")]
    NotParticipant,

    /// The store rejected the session credential.
    #[error("session expired, sign in again")]
    SessionExpired,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DuelError {
    /// The stable code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::TransportSend(_)
            | Self::TransportReceive(_)
            | Self::TransportClosed
            | Self::NotConnected
            | Self::Io(_) => ErrorCode::TransportUnavailable,
            Self::Serialization(_) => ErrorCode::InvalidFrame,
            Self::Timeout => ErrorCode::SubscribeTimeout,
            Self::JoinRejected { .. } | Self::NotBroadcastChannel(_) => {
                ErrorCode::ChannelJoinRejected
            }
            Self::Store(StoreError::Unavailable { .. }) => ErrorCode::StoreUnavailable,
            Self::Store(StoreError::Rejected { .. }) => ErrorCode::StoreRejected,
            Self::SelfInvite => ErrorCode::SelfInvite,
            Self::AlreadyInviting => ErrorCode::AlreadyInviting,
            Self::TargetOffline => ErrorCode::TargetOffline,
            Self::StaleInvite => ErrorCode::StaleInvite,
            Self::NotReceiver => ErrorCode::NotReceiver,
            Self::MatchNotFound => ErrorCode::MatchNotFound,
            Self::MatchNotActive => ErrorCode::MatchNotActive,
            Self::NotParticipant => ErrorCode::NotParticipant,
            Self::SessionExpired => ErrorCode::SessionExpired,
        }
    }
}

impl From<StoreError> for DuelError {
    fn from(err: StoreError) -> Self {
        if err.is_session_expiry() {
            DuelError::SessionExpired
        } else {
            DuelError::Store(err)
        }
    }
}

/// A specialized [`Result`] type for duel coordination operations.
pub type Result<T> = std::result::Result<T, DuelError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error_codes::ErrorCategory;

    #[test]
    fn expired_credential_becomes_session_expired() {
        let err: DuelError = StoreError::rejected(Some("PGRST301"), "JWT expired").into();
        assert!(matches!(err, DuelError::SessionExpired));
        assert_eq!(err.code().category(), ErrorCategory::Session);
    }

    #[test]
    fn other_rejections_stay_store_errors() {
        let err: DuelError =
            StoreError::rejected(Some("23505"), "duplicate key value violates unique constraint")
                .into();
        assert!(matches!(err, DuelError::Store(StoreError::Rejected { .. })));
        assert_eq!(err.code(), ErrorCode::StoreRejected);
    }

    #[test]
    fn invariant_errors_map_to_their_codes() {
        assert_eq!(DuelError::SelfInvite.code(), ErrorCode::SelfInvite);
        assert_eq!(DuelError::StaleInvite.code().category(), ErrorCategory::Invariant);
        assert_eq!(DuelError::Timeout.code().category(), ErrorCategory::Transient);
    }
}
