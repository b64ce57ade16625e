//! Presence tracker.
//!
//! Presence is soft state. Writes are logged and swallowed on failure and the
//! next heartbeat tick is the only retry. Staleness is decided at read time:
//! a record whose `last_seen` is older than the freshness window is offline,
//! whatever its flag says.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::error::Result;
use crate::error_codes::ErrorCode;
use crate::protocol::{span, OnlineUser, PresenceRecord, ProfileId, Row};
use crate::realtime::{Channel, ChannelMessage, RealtimeHandle, Topic};
use crate::store::Store;

/// Reads and writes presence records for the online roster.
#[derive(Clone)]
pub struct PresenceTracker {
    store: Arc<dyn Store>,
    freshness_window: Duration,
}

impl PresenceTracker {
    pub fn new(store: Arc<dyn Store>, freshness_window: Duration) -> Self {
        Self {
            store,
            freshness_window,
        }
    }

    pub fn freshness_window(&self) -> Duration {
        self.freshness_window
    }

    /// Upsert `profile` as online, seen now. Never fails.
    pub async fn mark_online(&self, profile: ProfileId) {
        self.write(PresenceRecord::online(profile, Utc::now())).await;
    }

    /// Upsert `profile` as offline. Never fails.
    pub async fn mark_offline(&self, profile: ProfileId) {
        self.write(PresenceRecord::offline(profile, Utc::now())).await;
    }

    async fn write(&self, record: PresenceRecord) {
        let profile = record.profile_id;
        let online = record.online;
        match self.store.upsert_presence(record).await {
            Ok(_) => debug!(profile = %profile, online, "presence written"),
            Err(e) => warn!(
                profile = %profile,
                online,
                error = %e,
                code = ?ErrorCode::PresenceWriteFailed,
                "presence write failed; next heartbeat retries"
            ),
        }
    }

    /// Fresh online profiles other than `excluding`, with display data.
    /// Profiles the store has no display data for are left out.
    ///
    /// # Errors
    ///
    /// Store failures are returned; the roster is a read, not soft state.
    pub async fn list_online(&self, excluding: ProfileId) -> Result<Vec<OnlineUser>> {
        let now = Utc::now();
        let since = now - span(self.freshness_window);
        let fresh: Vec<PresenceRecord> = self
            .store
            .online_presence(since)
            .await?
            .into_iter()
            .filter(|record| record.profile_id != excluding)
            .filter(|record| record.is_fresh(now, self.freshness_window))
            .collect();
        if fresh.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<ProfileId> = fresh.iter().map(|record| record.profile_id).collect();
        let profiles: HashMap<ProfileId, _> = self
            .store
            .profiles(&ids)
            .await?
            .into_iter()
            .map(|profile| (profile.id, profile))
            .collect();

        Ok(fresh
            .into_iter()
            .filter_map(|record| {
                let profile = profiles.get(&record.profile_id)?;
                Some(OnlineUser {
                    profile_id: record.profile_id,
                    name: profile.name.clone(),
                    avatar: profile.avatar.clone(),
                    last_seen: record.last_seen,
                })
            })
            .collect())
    }

    /// Whether `profile` appears in the roster as seen by `viewer`.
    pub async fn is_online(&self, profile: ProfileId, viewer: ProfileId) -> Result<bool> {
        Ok(self
            .list_online(viewer)
            .await?
            .iter()
            .any(|user| user.profile_id == profile))
    }

    /// Mark `profile` online now and again every `interval` until the
    /// returned [`Heartbeat`] is stopped or dropped.
    ///
    /// Must be called within a tokio runtime.
    pub fn start_heartbeat(&self, profile: ProfileId, interval: Duration) -> Heartbeat {
        let tracker = self.clone();
        let interval = interval.max(Duration::from_millis(1));
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                tracker.mark_online(profile).await;
            }
        });
        debug!(profile = %profile, ?interval, "heartbeat started");
        Heartbeat {
            profile,
            task: Some(task),
        }
    }

    /// Follow presence writes so the roster can be refreshed.
    pub async fn watch(&self, realtime: &RealtimeHandle) -> Result<RosterWatch> {
        let channel = realtime.open_channel(Topic::Presence).await?;
        Ok(RosterWatch { channel })
    }
}

impl std::fmt::Debug for PresenceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceTracker")
            .field("freshness_window", &self.freshness_window)
            .finish()
    }
}

/// A running heartbeat. Dropping it stops the heartbeat.
#[derive(Debug)]
pub struct Heartbeat {
    profile: ProfileId,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl Heartbeat {
    pub fn profile(&self) -> ProfileId {
        self.profile
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop ticking. Does not mark the profile offline.
    pub fn stop(mut self) {
        self.abort();
    }

    fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!(profile = %self.profile, "heartbeat stopped");
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Change feed on the presence table.
#[derive(Debug)]
pub struct RosterWatch {
    channel: Channel,
}

impl RosterWatch {
    /// The profile whose presence changed next, or `None` once the feed ends.
    pub async fn changed(&mut self) -> Option<ProfileId> {
        loop {
            match self.channel.recv().await? {
                ChannelMessage::Change(change) => {
                    if let Row::Presence(record) = change.row {
                        return Some(record.profile_id);
                    }
                }
                ChannelMessage::Closed { reason } => {
                    debug!(?reason, "presence feed closed");
                    return None;
                }
                ChannelMessage::Broadcast(_) => {}
            }
        }
    }
}
