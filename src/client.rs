//! High-level client for one signed-in profile.
//!
//! [`DuelClient`] wires the presence tracker, invite protocol, and match
//! synchronizer to one realtime connection and reports everything the
//! presentation layer needs as [`DuelEvent`]s on a bounded channel returned
//! from [`DuelClient::start`].
//!
//! # Example
//!
//! ```rust,ignore
//! let (client, mut events) =
//!     DuelClient::start(me, transport, store, progress, DuelConfig::default()).await?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         DuelEvent::InviteReceived { invite_id, .. } => {
//!             client.respond_to_invite(invite_id, true).await?;
//!         }
//!         DuelEvent::MatchCompleted { won, .. } => { /* … */ }
//!         DuelEvent::Disconnected { .. } => break,
//!         _ => {}
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::competition::{MatchSignal, MatchSync, MatchTracker, ScoreReport, DEFAULT_WIN_THRESHOLD};
use crate::error::{DuelError, Result};
use crate::error_codes::ErrorCode;
use crate::event::DuelEvent;
use crate::invite::{InviteHandle, InviteListener, InviteProtocol, InviteSignal, OutgoingWatch};
use crate::lock;
use crate::presence::{Heartbeat, PresenceTracker, RosterWatch};
use crate::protocol::{Competition, CompetitionId, InviteId, Invitation, OnlineUser, Profile, ProfileId};
use crate::realtime::{LinkEvent, Realtime, RealtimeConfig, RealtimeHandle};
use crate::recent::RecentSet;
use crate::store::{Progress, Store};
use crate::transport::Transport;

/// Default capacity of the bounded event channel.
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_FRESHNESS_WINDOW: Duration = Duration::from_secs(120);
const DEFAULT_SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_INVITE_TTL: Duration = Duration::from_secs(60);

/// Default timeout for the graceful shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Finished matches and withdrawn challenges remembered per session.
const REMEMBERED_MATCHES: usize = 128;

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for a [`DuelClient`].
///
/// # Example
///
/// ```
/// use duel_sync::DuelConfig;
/// use std::time::Duration;
///
/// let config = DuelConfig::default()
///     .with_heartbeat_interval(Duration::from_secs(5))
///     .with_win_threshold(10);
/// assert_eq!(config.win_threshold, 10);
/// assert_eq!(config.freshness_window, Duration::from_secs(120));
/// ```
#[derive(Debug, Clone)]
pub struct DuelConfig {
    /// How often presence is refreshed while the client runs.
    ///
    /// Defaults to **10 seconds**.
    pub heartbeat_interval: Duration,
    /// Presence older than this counts as offline.
    ///
    /// Defaults to **120 seconds**.
    pub freshness_window: Duration,
    /// Bound on joining a channel, including the join-then-publish of an
    /// invite.
    ///
    /// Defaults to **5 seconds**.
    pub subscribe_timeout: Duration,
    /// Pending invitations older than this are cancelled when their sender
    /// sends the next one.
    ///
    /// Defaults to **60 seconds**.
    pub invite_ttl: Duration,
    /// Correct answers needed to win.
    ///
    /// Defaults to **15**. Values below 1 are clamped to 1.
    pub win_threshold: u32,
    /// Capacity of the bounded event channel.
    ///
    /// When the consumer cannot keep up, events are dropped (with a warning
    /// logged) rather than stalling the client. The final `Disconnected` event
    /// is always delivered.
    ///
    /// Defaults to **256**. Values below 1 are clamped to 1.
    pub event_channel_capacity: usize,
    /// Time the realtime loop gets to close the transport on
    /// [`DuelClient::shutdown`].
    ///
    /// Defaults to **1 second**.
    pub shutdown_timeout: Duration,
}

impl Default for DuelConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            freshness_window: DEFAULT_FRESHNESS_WINDOW,
            subscribe_timeout: DEFAULT_SUBSCRIBE_TIMEOUT,
            invite_ttl: DEFAULT_INVITE_TTL,
            win_threshold: DEFAULT_WIN_THRESHOLD,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl DuelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    #[must_use]
    pub fn with_freshness_window(mut self, window: Duration) -> Self {
        self.freshness_window = window;
        self
    }

    #[must_use]
    pub fn with_subscribe_timeout(mut self, timeout: Duration) -> Self {
        self.subscribe_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_invite_ttl(mut self, ttl: Duration) -> Self {
        self.invite_ttl = ttl;
        self
    }

    /// Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_win_threshold(mut self, threshold: u32) -> Self {
        self.win_threshold = threshold.max(1);
        self
    }

    /// Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    fn realtime(&self) -> RealtimeConfig {
        RealtimeConfig::default()
            .with_subscribe_timeout(self.subscribe_timeout)
            .with_shutdown_timeout(self.shutdown_timeout)
    }
}

// ── Shared state ────────────────────────────────────────────────────

/// State shared by the client handle and its background pumps.
struct Inner {
    profile: Profile,
    store: Arc<dyn Store>,
    presence: PresenceTracker,
    invites: InviteProtocol,
    matches: MatchSync,
    realtime: RealtimeHandle,
    /// Taken when the final `Disconnected` is sent, which ends the receiver.
    event_tx: Mutex<Option<mpsc::Sender<DuelEvent>>>,
    /// Matches in progress. A tracker is dropped once its match is over.
    trackers: Mutex<HashMap<CompetitionId, MatchTracker>>,
    /// Matches that reached a terminal state; late rows for them are ignored.
    finished: Mutex<RecentSet<CompetitionId>>,
    followed: Mutex<HashMap<CompetitionId, JoinHandle<()>>>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
    /// Competitions this client withdrew itself; their cancellation is not an
    /// answer from the receiver.
    withdrawn: Mutex<RecentSet<CompetitionId>>,
    session_expired: AtomicBool,
}

impl Inner {
    fn me(&self) -> ProfileId {
        self.profile.id
    }

    /// Emit without blocking; dropped if the consumer lags.
    fn emit(&self, event: DuelEvent) {
        let event_tx = lock(&self.event_tx);
        let Some(tx) = event_tx.as_ref() else {
            debug!(?event, "client closed, dropping event");
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                warn!(
                    "event channel full, dropping event: {:?}",
                    std::mem::discriminant(&dropped)
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("event channel closed, receiver dropped");
            }
        }
    }

    /// Pass `result` through, announcing an expired session once.
    fn check<T>(&self, result: Result<T>) -> Result<T> {
        if matches!(result, Err(DuelError::SessionExpired)) {
            self.expire_session();
        }
        result
    }

    fn expire_session(&self) {
        if !self.session_expired.swap(true, Ordering::AcqRel) {
            warn!(profile = %self.me(), "session expired");
            self.emit(DuelEvent::SessionExpired);
        }
    }

    fn on_link(&self, event: LinkEvent) {
        match event {
            LinkEvent::Connected => self.emit(DuelEvent::Connected),
            LinkEvent::Error {
                message,
                error_code,
            } => {
                if ErrorCode::is_session_expiry(error_code.as_deref(), &message) {
                    self.expire_session();
                } else {
                    warn!(%message, ?error_code, "realtime error");
                }
            }
            // Delivered by `finish`.
            LinkEvent::Disconnected { .. } => {}
        }
    }

    /// Stop every pump and deliver the final `Disconnected`.
    async fn finish(&self, reason: Option<String>) {
        let Some(event_tx) = lock(&self.event_tx).take() else {
            return;
        };
        self.stop_pumps();
        info!(profile = %self.me(), ?reason, "duel client disconnected");
        if event_tx
            .send(DuelEvent::Disconnected { reason })
            .await
            .is_err()
        {
            debug!("event channel closed, receiver dropped");
        }
    }

    fn stop_pumps(&self) {
        for task in lock(&self.pumps).drain(..) {
            task.abort();
        }
        for (_, task) in lock(&self.followed).drain() {
            task.abort();
        }
    }

    fn spawn_pump<F>(&self, pump: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        lock(&self.pumps).push(tokio::spawn(pump));
    }

    /// Feed a competition row through the local view and emit what changed.
    async fn observe(&self, row: Competition) {
        let id = row.id;
        let terminal = row.status.is_terminal();
        let signals = {
            let mut trackers = lock(&self.trackers);
            let mut finished = lock(&self.finished);
            if finished.contains(&id) {
                return;
            }
            let signals = trackers
                .entry(id)
                .or_insert_with(|| MatchTracker::new(self.me()))
                .observe(row);
            if terminal {
                trackers.remove(&id);
                finished.insert(id);
            }
            signals
        };
        for signal in signals {
            match signal {
                MatchSignal::Updated(competition) => self.emit(DuelEvent::MatchUpdated(competition)),
                MatchSignal::Completed { competition, won } => {
                    if won {
                        self.matches.award_once(&competition, self.me()).await;
                    }
                    self.emit(DuelEvent::MatchCompleted { competition, won });
                }
            }
        }
    }

    fn is_finished(&self, competition: CompetitionId) -> bool {
        lock(&self.finished).contains(&competition)
    }

    async fn follow_match(self: &Arc<Self>, competition: CompetitionId) -> Result<()> {
        if lock(&self.followed)
            .get(&competition)
            .is_some_and(|task| !task.is_finished())
        {
            return Ok(());
        }
        let mut feed = self.check(self.matches.subscribe_to_match(competition).await)?;
        let inner = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(row) = feed.next().await {
                inner.observe(row).await;
                if inner.is_finished(competition) {
                    break;
                }
            }
            debug!(competition = %competition, "stopped following match");
        });
        let mut followed = lock(&self.followed);
        followed.retain(|_, task| !task.is_finished());
        if let Some(previous) = followed.insert(competition, task) {
            previous.abort();
        }
        drop(followed);
        debug!(competition = %competition, "following match");
        Ok(())
    }
}

// ── Pumps ───────────────────────────────────────────────────────────

async fn pump_link(inner: Arc<Inner>, mut link_rx: mpsc::Receiver<LinkEvent>) {
    while let Some(event) = link_rx.recv().await {
        if let LinkEvent::Disconnected { reason } = event {
            inner.finish(reason).await;
            return;
        }
        inner.on_link(event);
    }
    inner.finish(Some("client shut down".to_owned())).await;
}

async fn pump_invites(inner: Arc<Inner>, mut listener: InviteListener) {
    while let Some(signal) = listener.next().await {
        inner.emit(invite_event(signal));
    }
}

async fn pump_outgoing(inner: Arc<Inner>, mut watch: OutgoingWatch) {
    while let Some(resolution) = watch.next().await {
        let competition_id = resolution.competition.id;
        if lock(&inner.withdrawn).remove(&competition_id) {
            continue;
        }
        inner.emit(DuelEvent::InviteResolved {
            competition_id,
            accepted: resolution.accepted,
        });
        if resolution.accepted {
            if let Err(e) = inner.follow_match(competition_id).await {
                warn!(competition = %competition_id, error = %e, "could not follow accepted match");
            }
        }
    }
}

async fn pump_roster(inner: Arc<Inner>, mut watch: RosterWatch) {
    while let Some(profile) = watch.changed().await {
        if profile != inner.me() {
            inner.emit(DuelEvent::RosterChanged);
        }
    }
}

fn invite_event(signal: InviteSignal) -> DuelEvent {
    match signal {
        InviteSignal::Received(notice) => DuelEvent::InviteReceived {
            invite_id: notice.invite_id,
            from_profile_id: notice.from_profile_id,
            from_name: notice.from_name,
            competition_id: notice.competition_id,
        },
        InviteSignal::Cancelled {
            from_profile_id,
            competition_id,
        } => DuelEvent::InviteCancelled {
            from_profile_id,
            competition_id,
        },
    }
}

// ── Client ──────────────────────────────────────────────────────────

/// Client handle for one signed-in profile.
///
/// Created via [`DuelClient::start`]. Operations that touch the store await
/// it and return the outcome; live updates arrive as [`DuelEvent`]s.
pub struct DuelClient {
    inner: Arc<Inner>,
    realtime: Option<Realtime>,
    heartbeat: Option<Heartbeat>,
    link_task: Option<JoinHandle<()>>,
    shutdown_timeout: Duration,
}

impl DuelClient {
    /// Connect `profile`: mark it online, start the heartbeat, and join the
    /// invite, challenge, and roster channels.
    ///
    /// The first event is always [`DuelEvent::Connected`], followed by any
    /// invitations that were already pending.
    ///
    /// A channel that cannot be joined is logged and skipped; the persisted
    /// records stay reachable through [`pending_invitations`](Self::pending_invitations)
    /// and [`follow_match`](Self::follow_match).
    ///
    /// # Errors
    ///
    /// Returns [`DuelError::NotConnected`] if the transport closes before the
    /// connection is up.
    #[must_use = "the event receiver must be used to receive events"]
    pub async fn start(
        profile: Profile,
        transport: impl Transport,
        store: Arc<dyn Store>,
        progress: Arc<dyn Progress>,
        config: DuelConfig,
    ) -> Result<(Self, mpsc::Receiver<DuelEvent>)> {
        let capacity = config.event_channel_capacity.max(1);
        let (event_tx, event_rx) = mpsc::channel::<DuelEvent>(capacity);
        let (realtime, mut link_rx) = Realtime::start(transport, config.realtime());
        let handle = realtime.handle();

        let presence = PresenceTracker::new(Arc::clone(&store), config.freshness_window);
        let invites = InviteProtocol::new(
            Arc::clone(&store),
            handle.clone(),
            presence.clone(),
            config.invite_ttl,
        );
        let matches = MatchSync::new(
            Arc::clone(&store),
            progress,
            handle.clone(),
            config.win_threshold,
        );
        let inner = Arc::new(Inner {
            profile,
            store,
            presence,
            invites,
            matches,
            realtime: handle,
            event_tx: Mutex::new(Some(event_tx)),
            trackers: Mutex::new(HashMap::new()),
            finished: Mutex::new(RecentSet::new(REMEMBERED_MATCHES)),
            followed: Mutex::new(HashMap::new()),
            pumps: Mutex::new(Vec::new()),
            withdrawn: Mutex::new(RecentSet::new(REMEMBERED_MATCHES)),
            session_expired: AtomicBool::new(false),
        });
        let me = inner.me();

        match link_rx.recv().await {
            Some(LinkEvent::Connected) => inner.emit(DuelEvent::Connected),
            other => {
                debug!(?other, "realtime loop ended before connecting");
                return Err(DuelError::NotConnected);
            }
        }
        let link_task = tokio::spawn(pump_link(Arc::clone(&inner), link_rx));

        let heartbeat = inner
            .presence
            .start_heartbeat(me, config.heartbeat_interval);

        match inner.check(inner.invites.listen(me).await) {
            Ok(mut listener) => {
                match inner.check(listener.catch_up().await) {
                    Ok(backlog) => {
                        for signal in backlog {
                            inner.emit(invite_event(signal));
                        }
                    }
                    Err(e) => warn!(profile = %me, error = %e, "could not read pending invitations"),
                }
                inner.spawn_pump(pump_invites(Arc::clone(&inner), listener));
            }
            Err(e) => warn!(profile = %me, error = %e, "could not join invite channels"),
        }
        match inner.check(inner.invites.watch_outgoing(me).await) {
            Ok(watch) => inner.spawn_pump(pump_outgoing(Arc::clone(&inner), watch)),
            Err(e) => warn!(profile = %me, error = %e, "could not watch sent challenges"),
        }
        match inner.check(inner.presence.watch(&inner.realtime).await) {
            Ok(watch) => inner.spawn_pump(pump_roster(Arc::clone(&inner), watch)),
            Err(e) => warn!(profile = %me, error = %e, "could not watch the roster"),
        }

        info!(profile = %me, "duel client started");
        let client = Self {
            inner,
            realtime: Some(realtime),
            heartbeat: Some(heartbeat),
            link_task: Some(link_task),
            shutdown_timeout: config.shutdown_timeout,
        };
        Ok((client, event_rx))
    }

    // ── Public API methods ──────────────────────────────────────────

    pub fn profile(&self) -> &Profile {
        &self.inner.profile
    }

    /// Returns `true` while the realtime connection is up.
    pub fn is_connected(&self) -> bool {
        self.inner.realtime.is_connected()
    }

    /// Other profiles currently online.
    pub async fn online_roster(&self) -> Result<Vec<OnlineUser>> {
        self.inner
            .check(self.inner.presence.list_online(self.inner.me()).await)
    }

    /// Invitations addressed to this profile that are still pending.
    pub async fn pending_invitations(&self) -> Result<Vec<Invitation>> {
        self.inner
            .check(self.inner.invites.pending_invitations(self.inner.me()).await)
    }

    /// Challenge `to`. The answer arrives as [`DuelEvent::InviteResolved`];
    /// an accepted match is followed automatically.
    ///
    /// # Errors
    ///
    /// See [`InviteProtocol::send_invite`].
    pub async fn send_invite(&self, to: ProfileId) -> Result<InviteHandle> {
        self.inner
            .check(self.inner.invites.send_invite(&self.inner.profile, to).await)
    }

    /// Withdraw a challenge sent by this client.
    ///
    /// # Errors
    ///
    /// [`DuelError::StaleInvite`] if the receiver already answered.
    pub async fn cancel_invite(&self, handle: &InviteHandle) -> Result<()> {
        let competition = handle.competition.id;
        lock(&self.inner.withdrawn).insert(competition);
        let result = self.inner.check(self.inner.invites.cancel_invite(handle).await);
        if result.is_err() {
            lock(&self.inner.withdrawn).remove(&competition);
        }
        result
    }

    /// Accept or decline the invitation `invite`. An accepted match is
    /// followed immediately.
    ///
    /// # Errors
    ///
    /// - [`DuelError::StaleInvite`] if it was already answered, cancelled, or
    ///   does not exist
    /// - [`DuelError::NotReceiver`] if it is addressed to someone else
    pub async fn respond_to_invite(&self, invite: InviteId, accept: bool) -> Result<Competition> {
        let invitation = self
            .inner
            .check(self.inner.store.invitation(invite).await.map_err(DuelError::from))?
            .ok_or(DuelError::StaleInvite)?;
        let competition = self.inner.check(
            self.inner
                .invites
                .respond_to_invite(self.inner.me(), &invitation, accept)
                .await,
        )?;
        if accept {
            self.inner.follow_match(competition.id).await?;
        }
        Ok(competition)
    }

    /// Follow `competition`, emitting [`DuelEvent::MatchUpdated`] for every
    /// change and [`DuelEvent::MatchCompleted`] once. Following a match that
    /// is already followed does nothing.
    pub async fn follow_match(&self, competition: CompetitionId) -> Result<()> {
        self.inner.follow_match(competition).await
    }

    /// Record one correct answer. The written row is applied to the local
    /// view right away, ahead of its change notification.
    ///
    /// # Errors
    ///
    /// See [`MatchSync::report_correct_answer`].
    pub async fn report_correct_answer(&self, competition: CompetitionId) -> Result<ScoreReport> {
        let report = self.inner.check(
            self.inner
                .matches
                .report_correct_answer(competition, self.inner.me())
                .await,
        )?;
        self.inner.observe(report.competition.clone()).await;
        Ok(report)
    }

    /// The local view of a match in progress. Finished matches are reported
    /// through [`DuelEvent::MatchCompleted`] and then forgotten.
    pub fn match_view(&self, competition: CompetitionId) -> Option<Competition> {
        lock(&self.inner.trackers)
            .get(&competition)
            .and_then(|tracker| tracker.view().cloned())
    }

    /// The app moved to the background or back. Hiding keeps the profile
    /// online; returning refreshes presence right away.
    pub async fn visibility_changed(&self, hidden: bool) {
        debug!(profile = %self.inner.me(), hidden, "visibility changed");
        if !hidden {
            self.inner.presence.mark_online(self.inner.me()).await;
        }
    }

    /// Mark the profile offline, leave every channel, and close the
    /// connection.
    ///
    /// The event receiver yields `Disconnected` and then `None`.
    pub async fn shutdown(&mut self) {
        debug!("DuelClient: shutdown requested");

        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.stop();
            self.inner.presence.mark_offline(self.inner.me()).await;
        }
        self.inner.stop_pumps();

        if let Some(mut realtime) = self.realtime.take() {
            realtime.shutdown().await;
        }

        if let Some(mut task) = self.link_task.take() {
            match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => warn!("link pump terminated with join error: {join_err}"),
                Err(_) => {
                    warn!("link pump did not exit within timeout; aborting task");
                    task.abort();
                }
            }
        }
        self.inner.finish(Some("client shut down".to_owned())).await;
    }
}

impl std::fmt::Debug for DuelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuelClient")
            .field("profile", &self.inner.me())
            .field("connected", &self.is_connected())
            .field("heartbeat", &self.heartbeat.is_some())
            .finish()
    }
}

impl Drop for DuelClient {
    fn drop(&mut self) {
        // No executor context to await the offline write here, so it is
        // handed to the runtime if there is one.
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.stop();
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let presence = self.inner.presence.clone();
                let me = self.inner.me();
                runtime.spawn(async move { presence.mark_offline(me).await });
            }
        }
        self.inner.stop_pumps();
        if let Some(task) = self.link_task.take() {
            task.abort();
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::transports::MemoryHub;
    use uuid::Uuid;

    fn ada() -> Profile {
        Profile::new(Uuid::from_u128(1), "Ada")
    }

    async fn start(hub: &MemoryHub, profile: Profile) -> (DuelClient, mpsc::Receiver<DuelEvent>) {
        hub.register_profile(profile.clone());
        DuelClient::start(
            profile,
            hub.connect(),
            Arc::new(hub.clone()),
            Arc::new(hub.clone()),
            DuelConfig::default().with_subscribe_timeout(Duration::from_millis(200)),
        )
        .await
        .unwrap()
    }

    #[test]
    fn config_defaults() {
        let config = DuelConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.freshness_window, Duration::from_secs(120));
        assert_eq!(config.subscribe_timeout, Duration::from_secs(5));
        assert_eq!(config.invite_ttl, Duration::from_secs(60));
        assert_eq!(config.win_threshold, 15);
        assert_eq!(config.event_channel_capacity, 256);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
    }

    #[test]
    fn config_values_are_clamped() {
        let config = DuelConfig::new()
            .with_win_threshold(0)
            .with_event_channel_capacity(0);
        assert_eq!(config.win_threshold, 1);
        assert_eq!(config.event_channel_capacity, 1);
    }

    #[tokio::test]
    async fn connected_is_first_event_and_profile_is_online() {
        let hub = MemoryHub::new();
        let (mut client, mut events) = start(&hub, ada()).await;
        assert_eq!(events.recv().await, Some(DuelEvent::Connected));
        assert!(client.is_connected());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let since = chrono::Utc::now() - chrono::Duration::minutes(1);
        let online = hub.online_presence(since).await.unwrap();
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].profile_id, ada().id);

        client.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_marks_offline_and_ends_with_disconnected() {
        let hub = MemoryHub::new();
        let (mut client, mut events) = start(&hub, ada()).await;
        client.shutdown().await;
        client.shutdown().await;

        let mut last = None;
        while let Some(event) = events.recv().await {
            last = Some(event);
        }
        assert!(matches!(last, Some(DuelEvent::Disconnected { .. })));
        assert!(!client.is_connected());
        assert_eq!(hub.joined_channels(), 0);

        let since = chrono::Utc::now() - chrono::Duration::minutes(1);
        assert!(hub.online_presence(since).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_session_is_reported_once() {
        let hub = MemoryHub::new();
        let (mut client, mut events) = start(&hub, ada()).await;
        assert_eq!(events.recv().await, Some(DuelEvent::Connected));

        hub.expire_session();
        for _ in 0..2 {
            assert!(matches!(
                client.online_roster().await,
                Err(DuelError::SessionExpired)
            ));
        }
        assert_eq!(events.recv().await, Some(DuelEvent::SessionExpired));
        assert!(events.try_recv().is_err());

        client.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_invite_is_stale() {
        let hub = MemoryHub::new();
        let (mut client, _events) = start(&hub, ada()).await;
        assert!(matches!(
            client.respond_to_invite(Uuid::from_u128(42), true).await,
            Err(DuelError::StaleInvite)
        ));
        client.shutdown().await;
    }

    #[tokio::test]
    async fn debug_impl_for_client() {
        let hub = MemoryHub::new();
        let (mut client, _events) = start(&hub, ada()).await;
        let debug = format!("{client:?}");
        assert!(debug.contains("DuelClient"));
        assert!(debug.contains("connected"));
        client.shutdown().await;
    }

    #[tokio::test]
    async fn drop_without_explicit_shutdown() {
        let hub = MemoryHub::new();
        let (client, _events) = start(&hub, ada()).await;
        drop(client);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let since = chrono::Utc::now() - chrono::Duration::minutes(1);
        assert!(hub.online_presence(since).await.unwrap().is_empty());
    }
}
