//! Stable error codes and their user-facing messages.
//!
//! Codes serialize as `SCREAMING_SNAKE_CASE` strings so the presentation layer
//! can key translations off them. Each code belongs to one [`ErrorCategory`],
//! which decides how the failure is handled.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How a failure is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Transport hiccup: fall back to the persisted record or show a toast.
    Transient,
    /// Credential is no longer valid: force sign-out.
    Session,
    /// Rejected request: show the message, never retry.
    Invariant,
    /// Logged and swallowed; the next heartbeat retries.
    Soft,
}

/// Structured error codes for the coordination core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Invitation errors
    SelfInvite,
    AlreadyInviting,
    TargetOffline,
    StaleInvite,
    NotReceiver,

    // Match errors
    MatchNotFound,
    MatchNotActive,
    NotParticipant,

    // Session errors
    SessionExpired,

    // Transport errors
    ChannelJoinRejected,
    SubscribeTimeout,
    TransportUnavailable,
    InvalidFrame,

    // Store errors
    StoreUnavailable,
    StoreRejected,
    PresenceWriteFailed,
}

/// Error codes and message fragments the store uses for an expired or revoked
/// credential.
const SESSION_EXPIRY_CODES: &[&str] = &["PGRST301", "PGRST302", "401", "invalid_grant"];
const SESSION_EXPIRY_MESSAGES: &[&str] = &[
    "jwt expired",
    "invalid jwt",
    "invalid refresh token",
    "refresh token not found",
    "session not found",
    "session_expired",
];

impl ErrorCode {
    /// Returns a message suitable for showing to the player.
    pub fn description(&self) -> &'static str {
        match self {
            Self::SelfInvite => "You can't challenge yourself. Pick another player from the list.",
            Self::AlreadyInviting => {
                "You already sent this player a challenge. Wait for them to answer."
            }
            Self::TargetOffline => "That player just went offline. Try someone else.",
            Self::StaleInvite => "This challenge is no longer available.",
            Self::NotReceiver => "Only the invited player can answer this challenge.",
            Self::MatchNotFound => "This match could not be found.",
            Self::MatchNotActive => "This match is already over.",
            Self::NotParticipant => "You are not playing in this match.",
            Self::SessionExpired => "Your session has expired. Please sign in again.",
            Self::ChannelJoinRejected => {
                "Live updates are unavailable right now. Your progress is still saved."
            }
            Self::SubscribeTimeout => "The connection is slow. Please try again.",
            Self::TransportUnavailable => "Reconnecting to live updates...",
            Self::InvalidFrame => "Received an update we could not read.",
            Self::StoreUnavailable => "We couldn't reach the server. Please try again.",
            Self::StoreRejected => "The server refused this request.",
            Self::PresenceWriteFailed => "Could not update your online status.",
        }
    }

    /// The handling category of this code.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::SelfInvite
            | Self::AlreadyInviting
            | Self::TargetOffline
            | Self::StaleInvite
            | Self::NotReceiver
            | Self::MatchNotFound
            | Self::MatchNotActive
            | Self::NotParticipant
            | Self::StoreRejected => ErrorCategory::Invariant,
            Self::SessionExpired => ErrorCategory::Session,
            Self::ChannelJoinRejected
            | Self::SubscribeTimeout
            | Self::TransportUnavailable
            | Self::InvalidFrame
            | Self::StoreUnavailable => ErrorCategory::Transient,
            Self::PresenceWriteFailed => ErrorCategory::Soft,
        }
    }

    /// Returns `true` if a store error code or message means the credential
    /// expired and no local recovery is possible.
    pub fn is_session_expiry(code: Option<&str>, message: &str) -> bool {
        if let Some(code) = code {
            if SESSION_EXPIRY_CODES
                .iter()
                .any(|known| known.eq_ignore_ascii_case(code))
            {
                return true;
            }
        }
        let message = message.to_ascii_lowercase();
        SESSION_EXPIRY_MESSAGES
            .iter()
            .any(|fragment| message.contains(fragment))
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}
