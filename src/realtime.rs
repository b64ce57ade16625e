//! Channel transport adapter.
//!
//! [`Realtime`] owns one [`Transport`] and a background loop that multiplexes
//! every open [`Channel`] over it. Each channel is either an ephemeral
//! broadcast channel (at-most-once, only delivered to members joined at publish
//! time) or a change feed on persisted rows (at-least-once while joined, no
//! catch-up after a gap).
//!
//! Incoming frames are routed by channel name through a single dispatch table.
//! Closing or dropping a [`Channel`] removes its route synchronously, so no
//! message reaches a closed handle, and leaves the channel on the service.
//!
//! # Example
//!
//! ```rust,ignore
//! let (realtime, mut link) = Realtime::start(transport, RealtimeConfig::default());
//! let mut inbox = realtime.handle().open_channel(Topic::InviteInbox(me)).await?;
//! while let Some(message) = inbox.recv().await {
//!     // ...
//! }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::{DuelError, Result};
use crate::error_codes::ErrorCode;
use crate::lock;
use crate::protocol::{
    BroadcastEvent, ChangeEvent, ChangeFilter, ChangeKind, ClientFrame, CompetitionId, JoinConfig,
    ProfileId, RowFilter, ServerFrame, Table,
};
use crate::transport::Transport;

/// Default bound on waiting for a join reply.
const DEFAULT_SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for the graceful shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Capacity of the connection-status channel.
const LINK_CHANNEL_CAPACITY: usize = 32;

// ── Topics ──────────────────────────────────────────────────────────

/// Every logical channel the coordination core opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Change feed on the whole presence table.
    Presence,
    /// Broadcast channel carrying invites for one recipient.
    InviteRoster(ProfileId),
    /// The recipient's personal broadcast channel.
    InviteInbox(ProfileId),
    /// Change feed on invitations addressed to a profile.
    IncomingInvitations(ProfileId),
    /// Change feed on competitions the profile created as player 1.
    OutgoingChallenges(ProfileId),
    /// Change feed on one competition.
    Competition(CompetitionId),
}

impl Topic {
    /// Broadcast channels are met by name from both ends, so their name is
    /// shared. Change feeds are private to one session.
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Topic::InviteRoster(_) | Topic::InviteInbox(_))
    }

    pub fn base_name(&self) -> String {
        match self {
            Topic::Presence => "presence-changes".to_owned(),
            Topic::InviteRoster(id) => format!("game-invites:{id}"),
            Topic::InviteInbox(id) => format!("user:{id}"),
            Topic::IncomingInvitations(id) => format!("invitations-to:{id}"),
            Topic::OutgoingChallenges(id) => format!("competitions-from:{id}"),
            Topic::Competition(id) => format!("competition:{id}"),
        }
    }

    /// The wire name used when joining. Change feeds get a fresh suffix on
    /// every open so a rapid reopen never shares a name with the old channel.
    pub fn channel_name(&self) -> String {
        if self.is_broadcast() {
            self.base_name()
        } else {
            format!("{}:{}", self.base_name(), Uuid::new_v4().simple())
        }
    }

    pub fn join_config(&self) -> JoinConfig {
        let changes = match *self {
            Topic::InviteRoster(_) | Topic::InviteInbox(_) => Vec::new(),
            Topic::Presence => vec![ChangeFilter {
                table: Table::Presence,
                events: vec![ChangeKind::Insert, ChangeKind::Update],
                filter: None,
            }],
            Topic::IncomingInvitations(id) => vec![ChangeFilter {
                table: Table::Invitations,
                events: vec![ChangeKind::Insert, ChangeKind::Update],
                filter: Some(RowFilter::Receiver(id)),
            }],
            Topic::OutgoingChallenges(id) => vec![ChangeFilter {
                table: Table::Competitions,
                events: vec![ChangeKind::Update],
                filter: Some(RowFilter::Player1(id)),
            }],
            Topic::Competition(id) => vec![ChangeFilter {
                table: Table::Competitions,
                events: vec![ChangeKind::Update],
                filter: Some(RowFilter::Id(id)),
            }],
        };
        JoinConfig {
            broadcast: self.is_broadcast(),
            changes,
        }
    }
}

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for a [`Realtime`] connection.
///
/// ```
/// use duel_sync::realtime::RealtimeConfig;
/// use std::time::Duration;
///
/// let config = RealtimeConfig::default().with_subscribe_timeout(Duration::from_secs(2));
/// assert_eq!(config.subscribe_timeout, Duration::from_secs(2));
/// ```
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// How long [`RealtimeHandle::open_channel`] waits for the join reply.
    ///
    /// Defaults to **5 seconds**.
    pub subscribe_timeout: Duration,
    /// Time the loop gets to close the transport on
    /// [`Realtime::shutdown`] before it is aborted.
    ///
    /// Defaults to **1 second**.
    pub shutdown_timeout: Duration,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            subscribe_timeout: DEFAULT_SUBSCRIBE_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl RealtimeConfig {
    #[must_use]
    pub fn with_subscribe_timeout(mut self, timeout: Duration) -> Self {
        self.subscribe_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

// ── Messages ────────────────────────────────────────────────────────

/// What a [`Channel`] yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Broadcast(BroadcastEvent),
    Change(ChangeEvent),
    /// The service closed the channel; nothing follows.
    Closed { reason: Option<String> },
}

/// Connection status reported by the realtime loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    /// Connection-level error frame from the service.
    Error {
        message: String,
        error_code: Option<String>,
    },
    /// The loop exited. Always the last event.
    Disconnected { reason: Option<String> },
}

// ── Shared state ────────────────────────────────────────────────────

enum JoinOutcome {
    Joined,
    Rejected {
        reason: String,
        error_code: Option<String>,
    },
}

struct Route {
    generation: u64,
    tx: mpsc::UnboundedSender<ChannelMessage>,
}

/// State shared by the loop and every handle.
struct Shared {
    connected: AtomicBool,
    next_generation: AtomicU64,
    routes: Mutex<HashMap<String, Route>>,
    pending_joins: Mutex<HashMap<String, oneshot::Sender<JoinOutcome>>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            next_generation: AtomicU64::new(1),
            routes: Mutex::new(HashMap::new()),
            pending_joins: Mutex::new(HashMap::new()),
        }
    }

    fn route(&self, topic: &str, message: ChannelMessage) {
        let mut routes = lock(&self.routes);
        match routes.get(topic) {
            Some(route) => {
                if route.tx.send(message).is_err() {
                    routes.remove(topic);
                }
            }
            None => debug!(topic, "dropping frame for a channel that is not open"),
        }
    }

    /// Mark the connection gone and drop every route, ending all channels.
    fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        lock(&self.routes).clear();
        lock(&self.pending_joins).clear();
    }
}

// ── Handles ─────────────────────────────────────────────────────────

/// Cloneable handle for opening channels on a running [`Realtime`].
#[derive(Clone)]
pub struct RealtimeHandle {
    cmd_tx: mpsc::UnboundedSender<ClientFrame>,
    shared: Arc<Shared>,
    subscribe_timeout: Duration,
}

impl RealtimeHandle {
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Join `topic` and wait for the service to confirm.
    ///
    /// Opening a broadcast topic that is already open on this connection
    /// supersedes the older [`Channel`], which then yields `None`.
    ///
    /// # Errors
    ///
    /// - [`DuelError::NotConnected`] if the loop is gone
    /// - [`DuelError::Timeout`] if no reply arrives within the subscribe timeout
    /// - [`DuelError::JoinRejected`] or [`DuelError::SessionExpired`] if the
    ///   service refuses the join
    pub async fn open_channel(&self, topic: Topic) -> Result<Channel> {
        self.join(topic, topic.join_config()).await
    }

    /// Join the change feed of `topic` with caller-chosen `filters` instead of
    /// the topic's default subscription.
    ///
    /// # Errors
    ///
    /// A broadcast topic is refused with [`DuelError::JoinRejected`]; other
    /// errors as for [`open_channel`](Self::open_channel).
    pub async fn on_change(&self, topic: Topic, filters: Vec<ChangeFilter>) -> Result<Channel> {
        if topic.is_broadcast() {
            return Err(DuelError::JoinRejected {
                topic: topic.base_name(),
                reason: "broadcast topics carry no change feed".to_owned(),
            });
        }
        self.join(
            topic,
            JoinConfig {
                broadcast: false,
                changes: filters,
            },
        )
        .await
    }

    async fn join(&self, topic: Topic, config: JoinConfig) -> Result<Channel> {
        if !self.is_connected() {
            return Err(DuelError::NotConnected);
        }
        let name = topic.channel_name();
        let generation = self.shared.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        if lock(&self.shared.routes)
            .insert(name.clone(), Route { generation, tx })
            .is_some()
        {
            debug!(topic = %name, "superseding an open channel");
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        lock(&self.shared.pending_joins).insert(name.clone(), reply_tx);

        // From here on, dropping `channel` undoes the route on every error path.
        let channel = Channel {
            name: name.clone(),
            topic,
            generation,
            rx,
            handle: self.clone(),
        };

        self.send(ClientFrame::Join {
            topic: name.clone(),
            config,
        })?;

        match tokio::time::timeout(self.subscribe_timeout, reply_rx).await {
            Ok(Ok(JoinOutcome::Joined)) => {
                debug!(topic = %name, "channel joined");
                Ok(channel)
            }
            Ok(Ok(JoinOutcome::Rejected { reason, error_code })) => {
                warn!(topic = %name, %reason, "channel join rejected");
                if ErrorCode::is_session_expiry(error_code.as_deref(), &reason) {
                    Err(DuelError::SessionExpired)
                } else {
                    Err(DuelError::JoinRejected {
                        topic: name,
                        reason,
                    })
                }
            }
            Ok(Err(_)) => Err(DuelError::NotConnected),
            Err(_) => {
                lock(&self.shared.pending_joins).remove(&name);
                warn!(topic = %name, timeout = ?self.subscribe_timeout, "timed out joining channel");
                Err(DuelError::Timeout)
            }
        }
    }

    fn send(&self, frame: ClientFrame) -> Result<()> {
        if !self.is_connected() {
            return Err(DuelError::NotConnected);
        }
        self.cmd_tx
            .send(frame)
            .map_err(|_| DuelError::NotConnected)
    }

    fn detach(&self, name: &str, generation: u64) {
        let removed = {
            let mut routes = lock(&self.shared.routes);
            if routes
                .get(name)
                .is_some_and(|route| route.generation == generation)
            {
                routes.remove(name);
                true
            } else {
                false
            }
        };
        if removed && self.is_connected() {
            let _ = self.cmd_tx.send(ClientFrame::Leave {
                topic: name.to_owned(),
            });
            debug!(topic = name, "channel closed");
        }
    }
}

impl std::fmt::Debug for RealtimeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeHandle")
            .field("connected", &self.is_connected())
            .field("subscribe_timeout", &self.subscribe_timeout)
            .finish()
    }
}

/// An open channel. Dropping it closes the channel.
pub struct Channel {
    name: String,
    topic: Topic,
    generation: u64,
    rx: mpsc::UnboundedReceiver<ChannelMessage>,
    handle: RealtimeHandle,
}

impl Channel {
    /// The wire name this channel was joined under.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Publish an ephemeral event to the other members of this channel.
    ///
    /// # Errors
    ///
    /// Returns [`DuelError::NotBroadcastChannel`] on a change-feed channel and
    /// [`DuelError::NotConnected`] if the connection is gone.
    pub fn publish(&self, event: BroadcastEvent) -> Result<()> {
        if !self.topic.is_broadcast() {
            return Err(DuelError::NotBroadcastChannel(self.name.clone()));
        }
        self.handle.send(ClientFrame::Broadcast {
            topic: self.name.clone(),
            event,
        })
    }

    /// Next message, or `None` once the channel is closed, superseded, or the
    /// connection is gone. Cancel-safe.
    pub async fn recv(&mut self) -> Option<ChannelMessage> {
        self.rx.recv().await
    }

    /// Close the channel. No message is delivered after this returns.
    pub fn close(self) {}
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.handle.detach(&self.name, self.generation);
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("topic", &self.topic)
            .finish()
    }
}

// ── Connection owner ────────────────────────────────────────────────

/// Owner of the realtime connection and its background loop.
pub struct Realtime {
    handle: RealtimeHandle,
    task: Option<tokio::task::JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    shutdown_timeout: Duration,
}

impl Realtime {
    /// Spawn the loop over `transport`.
    ///
    /// Returns the owner plus a receiver of [`LinkEvent`]s; the first event is
    /// always `Connected` and the last `Disconnected`.
    #[must_use = "the link receiver reports disconnects"]
    pub fn start(
        transport: impl Transport,
        config: RealtimeConfig,
    ) -> (Self, mpsc::Receiver<LinkEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let (link_tx, link_rx) = mpsc::channel::<LinkEvent>(LINK_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let shared = Arc::new(Shared::new());

        let task = tokio::spawn(transport_loop(
            transport,
            cmd_rx,
            link_tx,
            Arc::clone(&shared),
            shutdown_rx,
        ));

        let realtime = Self {
            handle: RealtimeHandle {
                cmd_tx,
                shared,
                subscribe_timeout: config.subscribe_timeout,
            },
            task: Some(task),
            shutdown_tx: Some(shutdown_tx),
            shutdown_timeout: config.shutdown_timeout,
        };
        (realtime, link_rx)
    }

    pub fn handle(&self) -> RealtimeHandle {
        self.handle.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }

    /// Close the transport and stop the loop, aborting it after the shutdown
    /// timeout.
    pub async fn shutdown(&mut self) {
        debug!("realtime: shutdown requested");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("realtime loop terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!("realtime loop did not exit within timeout; aborting task");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("realtime loop aborted: {join_err}");
                    }
                }
            }
        }

        self.handle.shared.disconnect();
    }
}

impl std::fmt::Debug for Realtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Realtime")
            .field("connected", &self.is_connected())
            .field("has_task", &self.task.is_some())
            .finish()
    }
}

impl Drop for Realtime {
    fn drop(&mut self) {
        // No executor context to await a graceful close here.
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.handle.shared.disconnect();
    }
}

// ── Loop ────────────────────────────────────────────────────────────

/// Multiplexes outgoing frames, incoming frames, and the shutdown signal.
///
/// Exits when the shutdown signal fires, every handle is dropped, the service
/// closes the connection, or the transport fails.
async fn transport_loop(
    mut transport: impl Transport,
    mut cmd_rx: mpsc::UnboundedReceiver<ClientFrame>,
    link_tx: mpsc::Sender<LinkEvent>,
    shared: Arc<Shared>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    debug!("realtime loop started");
    emit_link(&link_tx, LinkEvent::Connected);

    let reason = loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(frame) => {
                        match serde_json::to_string(&frame) {
                            Ok(json) => {
                                if let Err(e) = transport.send(json).await {
                                    error!("transport send error: {e}");
                                    break Some(format!("transport send error: {e}"));
                                }
                            }
                            Err(e) => error!("failed to serialize ClientFrame: {e}"),
                        }
                    }
                    None => {
                        debug!("all realtime handles dropped, closing transport");
                        let _ = transport.close().await;
                        break Some("client shut down".to_owned());
                    }
                }
            }

            _ = &mut shutdown_rx => {
                debug!("shutdown signal received");
                let _ = transport.close().await;
                break Some("client shut down".to_owned());
            }

            incoming = transport.recv() => {
                match incoming {
                    Some(Ok(text)) => match serde_json::from_str::<ServerFrame>(&text) {
                        Ok(frame) => {
                            if let Some(event) = dispatch(&shared, frame) {
                                emit_link(&link_tx, event);
                            }
                        }
                        Err(e) => warn!(error = %e, raw = %text, "failed to deserialize server frame"),
                    },
                    Some(Err(e)) => {
                        error!("transport receive error: {e}");
                        break Some(format!("transport receive error: {e}"));
                    }
                    None => {
                        debug!("transport closed by service");
                        break None;
                    }
                }
            }
        }
    };

    shared.disconnect();
    if link_tx
        .send(LinkEvent::Disconnected { reason })
        .await
        .is_err()
    {
        debug!("link channel closed, receiver dropped");
    }
    debug!("realtime loop exited");
}

/// Route one incoming frame. Returns a connection-level event, if any.
fn dispatch(shared: &Shared, frame: ServerFrame) -> Option<LinkEvent> {
    match frame {
        ServerFrame::JoinReply {
            topic,
            ok,
            reason,
            error_code,
        } => {
            match lock(&shared.pending_joins).remove(&topic) {
                Some(reply) => {
                    let outcome = if ok {
                        JoinOutcome::Joined
                    } else {
                        JoinOutcome::Rejected {
                            reason: reason.unwrap_or_else(|| "join rejected".to_owned()),
                            error_code,
                        }
                    };
                    let _ = reply.send(outcome);
                }
                None => debug!(topic = %topic, "join reply for a channel nobody is waiting on"),
            }
            None
        }
        ServerFrame::Broadcast { topic, event } => {
            shared.route(&topic, ChannelMessage::Broadcast(event));
            None
        }
        ServerFrame::Change { topic, change } => {
            shared.route(&topic, ChannelMessage::Change(change));
            None
        }
        ServerFrame::ChannelClosed { topic, reason } => {
            shared.route(&topic, ChannelMessage::Closed { reason });
            lock(&shared.routes).remove(&topic);
            None
        }
        ServerFrame::Error {
            message,
            error_code,
        } => {
            warn!(%message, ?error_code, "realtime service error");
            Some(LinkEvent::Error {
                message,
                error_code,
            })
        }
    }
}

/// Emit a status event without blocking the loop; dropped if the consumer lags.
fn emit_link(link_tx: &mpsc::Sender<LinkEvent>, event: LinkEvent) {
    match link_tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(dropped)) => {
            warn!("link channel full, dropping event: {dropped:?}");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("link channel closed, receiver dropped");
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
    use async_trait::async_trait;

    /// Client half of an in-process pipe; the test plays the service.
    struct LoopbackTransport {
        tx: mpsc::UnboundedSender<String>,
        rx: mpsc::UnboundedReceiver<String>,
    }

    struct FakeService {
        rx: mpsc::UnboundedReceiver<String>,
        tx: mpsc::UnboundedSender<String>,
    }

    impl FakeService {
        async fn next_frame(&mut self) -> ClientFrame {
            let text = self.rx.recv().await.expect("client frame");
            serde_json::from_str(&text).unwrap()
        }

        fn reply(&self, frame: ServerFrame) {
            self.tx.send(serde_json::to_string(&frame).unwrap()).unwrap();
        }

        async fn accept_join(&mut self) -> String {
            match self.next_frame().await {
                ClientFrame::Join { topic, .. } => {
                    self.reply(ServerFrame::JoinReply {
                        topic: topic.clone(),
                        ok: true,
                        reason: None,
                        error_code: None,
                    });
                    topic
                }
                other => panic!("expected Join, got {other:?}"),
            }
        }
    }

    fn loopback() -> (LoopbackTransport, FakeService) {
        let (client_tx, service_rx) = mpsc::unbounded_channel();
        let (service_tx, client_rx) = mpsc::unbounded_channel();
        (
            LoopbackTransport {
                tx: client_tx,
                rx: client_rx,
            },
            FakeService {
                rx: service_rx,
                tx: service_tx,
            },
        )
    }

    #[async_trait]
    impl Transport for LoopbackTransport {
        async fn send(&mut self, frame: String) -> std::result::Result<(), DuelError> {
            self.tx
                .send(frame)
                .map_err(|e| DuelError::TransportSend(e.to_string()))
        }

        async fn recv(&mut self) -> Option<std::result::Result<String, DuelError>> {
            self.rx.recv().await.map(Ok)
        }

        async fn close(&mut self) -> std::result::Result<(), DuelError> {
            Ok(())
        }
    }

    fn fast_config() -> RealtimeConfig {
        RealtimeConfig::default().with_subscribe_timeout(Duration::from_millis(100))
    }

    #[test]
    fn change_feed_names_are_unique_per_open() {
        let id = Uuid::from_u128(7);
        let a = Topic::Competition(id).channel_name();
        let b = Topic::Competition(id).channel_name();
        assert_ne!(a, b);
        assert!(a.starts_with(&format!("competition:{id}:")));
    }

    #[test]
    fn broadcast_names_are_shared() {
        let id = Uuid::from_u128(7);
        assert_eq!(
            Topic::InviteInbox(id).channel_name(),
            Topic::InviteInbox(id).channel_name()
        );
        assert!(Topic::InviteRoster(id).join_config().broadcast);
        assert!(Topic::InviteRoster(id).join_config().changes.is_empty());
    }

    #[test]
    fn competition_topic_filters_by_id() {
        let id = Uuid::from_u128(3);
        let config = Topic::Competition(id).join_config();
        assert!(!config.broadcast);
        assert_eq!(config.changes.len(), 1);
        assert_eq!(config.changes[0].filter, Some(RowFilter::Id(id)));
    }

    #[tokio::test]
    async fn open_channel_waits_for_join_reply() {
        let (transport, mut service) = loopback();
        let (mut realtime, mut link) = Realtime::start(transport, fast_config());
        assert_eq!(link.recv().await, Some(LinkEvent::Connected));

        let handle = realtime.handle();
        let me = Uuid::from_u128(1);
        let opening = tokio::spawn(async move { handle.open_channel(Topic::InviteInbox(me)).await });
        let topic = service.accept_join().await;
        let channel = opening.await.unwrap().unwrap();
        assert_eq!(channel.name(), topic);

        realtime.shutdown().await;
    }

    #[tokio::test]
    async fn broadcasts_are_routed_to_their_channel() {
        let (transport, mut service) = loopback();
        let (mut realtime, _link) = Realtime::start(transport, fast_config());
        let handle = realtime.handle();
        let me = Uuid::from_u128(1);

        let opening = tokio::spawn(async move { handle.open_channel(Topic::InviteInbox(me)).await });
        let topic = service.accept_join().await;
        let mut channel = opening.await.unwrap().unwrap();

        let event = BroadcastEvent::InviteCancelled {
            from_profile_id: Uuid::from_u128(2),
            competition_id: Uuid::from_u128(3),
        };
        service.reply(ServerFrame::Broadcast {
            topic,
            event: event.clone(),
        });
        assert_eq!(channel.recv().await, Some(ChannelMessage::Broadcast(event)));

        realtime.shutdown().await;
    }

    #[tokio::test]
    async fn join_times_out_without_reply() {
        let (transport, mut service) = loopback();
        let (mut realtime, _link) = Realtime::start(transport, fast_config());

        let result = realtime
            .handle()
            .open_channel(Topic::Competition(Uuid::from_u128(5)))
            .await;
        assert!(matches!(result, Err(DuelError::Timeout)));

        // The abandoned channel is left on the service.
        assert!(matches!(service.next_frame().await, ClientFrame::Join { .. }));
        assert!(matches!(service.next_frame().await, ClientFrame::Leave { .. }));

        realtime.shutdown().await;
    }

    #[tokio::test]
    async fn rejected_join_with_expired_token_is_session_expiry() {
        let (transport, mut service) = loopback();
        let (mut realtime, _link) = Realtime::start(transport, fast_config());
        let handle = realtime.handle();

        let opening =
            tokio::spawn(async move { handle.open_channel(Topic::Presence).await });
        let ClientFrame::Join { topic, .. } = service.next_frame().await else {
            panic!("expected Join");
        };
        service.reply(ServerFrame::JoinReply {
            topic,
            ok: false,
            reason: Some("JWT expired".into()),
            error_code: None,
        });
        let result = opening.await.unwrap();
        assert!(matches!(result, Err(DuelError::SessionExpired)));

        realtime.shutdown().await;
    }

    #[tokio::test]
    async fn close_sends_leave_and_stops_delivery() {
        let (transport, mut service) = loopback();
        let (mut realtime, _link) = Realtime::start(transport, fast_config());
        let handle = realtime.handle();
        let me = Uuid::from_u128(1);

        let opening = tokio::spawn(async move { handle.open_channel(Topic::InviteRoster(me)).await });
        let topic = service.accept_join().await;
        let channel = opening.await.unwrap().unwrap();

        channel.close();
        match service.next_frame().await {
            ClientFrame::Leave { topic: left } => assert_eq!(left, topic),
            other => panic!("expected Leave, got {other:?}"),
        }

        realtime.shutdown().await;
    }

    #[tokio::test]
    async fn reopening_supersedes_the_older_handle() {
        let (transport, mut service) = loopback();
        let (mut realtime, _link) = Realtime::start(transport, fast_config());
        let me = Uuid::from_u128(1);

        let handle = realtime.handle();
        let opening = tokio::spawn(async move { handle.open_channel(Topic::InviteInbox(me)).await });
        service.accept_join().await;
        let mut first = opening.await.unwrap().unwrap();

        let handle = realtime.handle();
        let opening = tokio::spawn(async move { handle.open_channel(Topic::InviteInbox(me)).await });
        service.accept_join().await;
        let second = opening.await.unwrap().unwrap();

        assert_eq!(first.recv().await, None);
        // Dropping the superseded handle must not leave the shared channel.
        drop(first);
        drop(second);
        assert!(matches!(service.next_frame().await, ClientFrame::Leave { .. }));
        assert!(service.rx.try_recv().is_err());

        realtime.shutdown().await;
    }

    #[tokio::test]
    async fn service_close_ends_channels_and_reports_disconnect() {
        let (transport, mut service) = loopback();
        let (realtime, mut link) = Realtime::start(transport, fast_config());
        let handle = realtime.handle();
        let me = Uuid::from_u128(1);

        let opening = tokio::spawn(async move { handle.open_channel(Topic::InviteInbox(me)).await });
        service.accept_join().await;
        let mut channel = opening.await.unwrap().unwrap();

        drop(service);
        assert_eq!(link.recv().await, Some(LinkEvent::Connected));
        assert_eq!(link.recv().await, Some(LinkEvent::Disconnected { reason: None }));
        assert_eq!(channel.recv().await, None);
        assert!(!realtime.is_connected());
    }

    #[tokio::test]
    async fn on_change_joins_with_custom_filters() {
        let (transport, mut service) = loopback();
        let (mut realtime, _link) = Realtime::start(transport, fast_config());
        let handle = realtime.handle();
        let me = Uuid::from_u128(1);
        let filters = vec![ChangeFilter {
            table: Table::Competitions,
            events: vec![ChangeKind::Update],
            filter: Some(RowFilter::Player2(me)),
        }];

        let expected = filters.clone();
        let opening = tokio::spawn(async move {
            handle
                .on_change(Topic::OutgoingChallenges(me), filters)
                .await
        });
        match service.next_frame().await {
            ClientFrame::Join { topic, config } => {
                assert!(!config.broadcast);
                assert_eq!(config.changes, expected);
                service.reply(ServerFrame::JoinReply {
                    topic,
                    ok: true,
                    reason: None,
                    error_code: None,
                });
            }
            other => panic!("expected Join, got {other:?}"),
        }
        opening.await.unwrap().unwrap();

        let refused = realtime
            .handle()
            .on_change(Topic::InviteInbox(me), Vec::new())
            .await;
        assert!(matches!(refused, Err(DuelError::JoinRejected { .. })));

        realtime.shutdown().await;
    }

    #[tokio::test]
    async fn publish_is_refused_on_change_feeds() {
        let (transport, mut service) = loopback();
        let (mut realtime, _link) = Realtime::start(transport, fast_config());
        let handle = realtime.handle();

        let opening = tokio::spawn(async move { handle.open_channel(Topic::Presence).await });
        service.accept_join().await;
        let channel = opening.await.unwrap().unwrap();
        let result = channel.publish(BroadcastEvent::InviteCancelled {
            from_profile_id: Uuid::nil(),
            competition_id: Uuid::nil(),
        });
        assert!(matches!(result, Err(DuelError::NotBroadcastChannel(_))));

        realtime.shutdown().await;
    }
}
