//! # duel-sync
//!
//! Client-side coordination core for head-to-head math duels.
//!
//! Two players' clients coordinate without an authoritative game server: they
//! share a relational [`Store`] and a publish/subscribe [`Transport`], and every
//! invariant (one pending invite per pair, one completion per match, one reward
//! per win) is enforced by the clients through conditional writes and
//! single-writer score fields.
//!
//! ## Features
//!
//! - **Presence**: heartbeat-maintained online roster with a read-time freshness window
//! - **Invitations**: send, accept, decline, and cancel challenges, race-safe
//! - **Live matches**: per-player score fields, exactly-once completion and reward
//! - **Transport-agnostic**: implement [`Transport`] for any realtime backend;
//!   the default `transport-websocket` feature provides `WebSocketTransport`
//! - **In-process backend**: [`MemoryHub`](transports::MemoryHub) for tests and offline play
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! let hub = MemoryHub::new();
//! let store: Arc<dyn Store> = Arc::new(hub.clone());
//! let progress: Arc<dyn Progress> = Arc::new(hub.clone());
//! let (client, mut events) =
//!     DuelClient::start(alice, hub.connect(), store, progress, DuelConfig::default()).await?;
//!
//! client.send_invite(bob_id).await?;
//! while let Some(event) = events.recv().await {
//!     if let DuelEvent::InviteResolved { accepted: true, competition_id } = event {
//!         client.follow_match(competition_id).await?;
//!     }
//! }
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod client;
pub mod competition;
pub mod error;
pub mod error_codes;
pub mod event;
pub mod invite;
pub mod presence;
pub mod protocol;
pub mod realtime;
mod recent;
pub mod store;
pub mod transport;
pub mod transports;

// Re-export primary types for ergonomic imports.
pub use client::{DuelClient, DuelConfig};
pub use error::{DuelError, Result};
pub use error_codes::{ErrorCategory, ErrorCode};
pub use event::DuelEvent;
pub use protocol::{ClientFrame, Competition, Invitation, OnlineUser, Profile, ServerFrame};
pub use store::{Progress, Store, StoreError};
pub use transport::Transport;

#[cfg(feature = "transport-websocket")]
pub use transports::WebSocketTransport;

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
