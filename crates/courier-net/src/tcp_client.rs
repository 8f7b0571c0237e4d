//! Client connection core for the Courier relay.
//!
//! [`ConnectionCore`] owns one logical connection to the relay across any
//! number of TCP links. Each link gets its own read loop and writer task,
//! both bound to a per-link [`CancellationToken`]. A single heartbeat task,
//! started on the first successful connect, pings the server, resends
//! unconfirmed items and rebuilds the link (then replays the session join)
//! when the socket dies or the server goes silent.
//!
//! Outbound calls never block on the socket: messages are encoded and handed
//! to the writer task through a channel. Messages the host application must
//! act on are parked in an [`InboundQueue`] and drained with
//! [`ConnectionCore::poll_inbound`]. Lifecycle changes are published on a
//! [`broadcast`] channel of [`ConnectionEvent`]s and a [`watch`] of
//! [`ConnectionStatus`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use courier_config::Config;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::codec::{self, DecodeError};
use crate::exchange::{ExchangeError, PendingExchange};
use crate::framing::{self, FrameConfig, FrameError};
use crate::inbound::InboundQueue;
use crate::item_queue::{OutboundItemQueue, PendingItem};
use crate::messages::{
    AnnounceCharmCosts, AssignmentResult, ConfirmCharmCostsReceived, InitiateGame,
    ItemReceiveConfirm, ItemRecord, ItemSend, ItemsSend, Join, Message, MessageBody, Placement,
    PlayerId, RandoGenerated, Ready, RejoinGame, Save, SessionId,
};
use crate::platform::{self, SocketConfig};
use crate::reconnection::{ReconnectConfig, ReconnectState};

const EVENT_CHANNEL_CAPACITY: usize = 64;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Options, state, events
// ---------------------------------------------------------------------------

/// Settings for a [`ConnectionCore`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Relay host name or literal IP.
    pub host: String,
    /// Relay port.
    pub port: u16,
    /// Name sent in `Join` and `Ready`.
    pub display_name: String,
    /// Per-address connect timeout.
    pub connect_timeout: Duration,
    /// A single frame write taking longer than this kills the link.
    pub write_timeout: Duration,
    /// Heartbeat period.
    pub heartbeat_interval: Duration,
    /// Silence after which the link is rebuilt.
    pub heartbeat_timeout: Duration,
    /// Upper bound on [`ConnectionCore::exchange_items`].
    pub exchange_timeout: Duration,
    /// Inbound queue capacity.
    pub inbound_capacity: usize,
    /// Backoff between failed reconnect attempts.
    pub reconnect: ReconnectConfig,
    /// Socket options.
    pub socket: SocketConfig,
    /// Frame size limit.
    pub frame: FrameConfig,
}

impl ClientOptions {
    /// Build options from the `network` and `client` config sections.
    pub fn from_config(config: &Config) -> Self {
        let client = &config.client;
        Self {
            host: config.network.server_address.clone(),
            port: config.network.server_port,
            display_name: client.display_name.clone(),
            connect_timeout: config.network.connect_timeout(),
            write_timeout: config.network.write_timeout(),
            heartbeat_interval: client.heartbeat_interval(),
            heartbeat_timeout: client.heartbeat_timeout(),
            exchange_timeout: client.exchange_timeout(),
            inbound_capacity: client.inbound_capacity,
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_millis(client.reconnect_initial_delay_ms),
                max_delay: Duration::from_millis(client.reconnect_max_delay_ms),
                ..ReconnectConfig::default()
            },
            socket: SocketConfig::default(),
            frame: FrameConfig::default(),
        }
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Coarse connection status for the host UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No link.
    NotConnected,
    /// A link is being opened or the server has not answered `Connect` yet.
    Connecting,
    /// The server assigned a uid.
    Connected,
    /// Bound to a session player slot.
    Joined,
}

/// Per-core connection bookkeeping.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    /// Uid assigned by the server (0 until `Connect` is answered).
    pub uid: u64,
    /// A connect attempt is in flight.
    pub connecting: bool,
    /// The server answered `Connect`.
    pub connected: bool,
    /// The server answered `Join`.
    pub joined: bool,
    /// Last `Ping` reply (or the start of the current attempt).
    pub last_heartbeat: Instant,
    /// Session to (re)join.
    pub session_id: Option<SessionId>,
    /// Player slot to (re)join.
    pub player_id: Option<PlayerId>,
    /// Last ready-room id reported by the server (-1 when none).
    pub ready_id: i32,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionState {
    /// Fresh state: not connected, no session.
    pub fn new() -> Self {
        Self {
            uid: 0,
            connecting: false,
            connected: false,
            joined: false,
            last_heartbeat: Instant::now(),
            session_id: None,
            player_id: None,
            ready_id: -1,
        }
    }

    /// Reset before a connect attempt. Session ids are kept for rejoin.
    pub fn reset_for_attempt(&mut self, now: Instant) {
        self.uid = 0;
        self.connecting = true;
        self.connected = false;
        self.joined = false;
        self.last_heartbeat = now;
    }

    /// Whether the heartbeat has been silent for longer than `timeout`.
    pub fn heartbeat_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_heartbeat) > timeout
    }

    /// Derived status.
    pub fn status(&self) -> ConnectionStatus {
        match (self.connected, self.joined) {
            (true, true) => ConnectionStatus::Joined,
            (true, false) => ConnectionStatus::Connected,
            (false, _) if self.connecting => ConnectionStatus::Connecting,
            (false, _) => ConnectionStatus::NotConnected,
        }
    }
}

/// Lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The server answered `Connect`.
    Connected {
        /// Assigned uid.
        uid: u64,
    },
    /// The connection was lost or closed.
    Disconnected,
    /// The server accepted a `Join`.
    Joined {
        /// Joined session.
        session_id: SessionId,
        /// Bound player slot.
        player_id: PlayerId,
    },
    /// The session was left.
    Left,
    /// No `Ping` reply within the heartbeat timeout.
    TimedOut,
    /// A reconnect attempt failed.
    ReconnectFailed {
        /// Consecutive failures so far.
        attempt: u32,
        /// Wait before the next attempt.
        retry_in: Duration,
    },
    /// The server sent a tag this client does not know.
    ProtocolViolation {
        /// The offending tag byte.
        tag: u8,
    },
}

/// Errors from [`ConnectionCore::connect`].
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The host name could not be resolved.
    #[error("failed to resolve {host}: {source}")]
    Resolve {
        /// Configured host.
        host: String,
        /// Resolver error.
        #[source]
        source: std::io::Error,
    },
    /// Every resolved address refused or timed out.
    #[error("could not connect to {host}:{port}")]
    NoReachableAddress {
        /// Configured host.
        host: String,
        /// Configured port.
        port: u16,
    },
}

/// Host application hooks.
///
/// Every method has a no-op default so hosts implement only what they use.
/// Calls come from the read loop; implementations must not block.
pub trait ClientHost: Send + Sync + 'static {
    /// Items sent in a previous run that were never confirmed. Re-sent after
    /// every `JoinConfirm`.
    fn unconfirmed_items(&self) -> Vec<PendingItem> {
        Vec::new()
    }

    /// The server stored an item this client sent.
    fn mark_item_confirmed(&self, _to: PlayerId, _item: &str) {}

    /// This player's charm costs, once known.
    fn charm_costs(&self) -> Option<Vec<i32>> {
        None
    }

    /// The assignment exchange finished.
    fn on_assignment(&self, _result: &AssignmentResult) {}

    /// The ready-room id changed (-1 after a save).
    fn ready_id_changed(&self, _ready_id: i32) {}
}

/// A host that ignores every hook.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedHost;

impl ClientHost for DetachedHost {}

// ---------------------------------------------------------------------------
// Shared core
// ---------------------------------------------------------------------------

/// One TCP link: the writer's inbox and the token both link tasks watch.
struct Link {
    id: u64,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    cancel: CancellationToken,
}

impl Link {
    fn is_alive(&self) -> bool {
        !self.cancel.is_cancelled()
    }
}

struct Shared {
    options: ClientOptions,
    host: Arc<dyn ClientHost>,
    state: Mutex<ConnectionState>,
    link: Mutex<Option<Link>>,
    outbound_items: Mutex<OutboundItemQueue>,
    inbound: InboundQueue,
    exchange: PendingExchange,
    backoff: Mutex<ReconnectState>,
    events: broadcast::Sender<ConnectionEvent>,
    status: watch::Sender<ConnectionStatus>,
    heartbeat: Mutex<Option<CancellationToken>>,
    connect_lock: tokio::sync::Mutex<()>,
    next_link_id: AtomicU64,
}

impl Shared {
    /// Mutate the state and publish the resulting status.
    fn with_state<R>(&self, f: impl FnOnce(&mut ConnectionState) -> R) -> R {
        let (result, status) = {
            let mut state = lock(&self.state);
            let result = f(&mut state);
            (result, state.status())
        };
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        result
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    fn link_alive(&self) -> bool {
        lock(&self.link).as_ref().is_some_and(Link::is_alive)
    }

    /// Stamp, encode and queue a message on the current link.
    ///
    /// Returns `false` if there is no live link.
    fn send(&self, body: MessageBody) -> bool {
        let uid = lock(&self.state).uid;
        let message = Message::from_sender(uid, body);
        let tag = message.tag();
        let frame = match codec::encode(&message) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(error = %e, "dropping unencodable message");
                return false;
            }
        };

        let link = lock(&self.link);
        match link.as_ref() {
            Some(link) if link.is_alive() => {
                if link.tx.send(frame).is_err() {
                    tracing::warn!(%tag, link = link.id, "writer gone, marking link dead");
                    link.cancel.cancel();
                    return false;
                }
                tracing::debug!(%tag, "sent");
                true
            }
            _ => {
                tracing::debug!(%tag, "no live link, message not sent");
                false
            }
        }
    }

    /// Drop the current link, optionally telling the server first.
    fn teardown_link(&self, notify_server: bool) {
        let Some(link) = lock(&self.link).take() else {
            return;
        };
        if notify_server && link.is_alive() {
            let uid = lock(&self.state).uid;
            match codec::encode(&Message::from_sender(uid, MessageBody::Disconnect)) {
                Ok(frame) => {
                    let _ = link.tx.send(frame);
                }
                Err(e) => tracing::warn!(error = %e, "could not encode Disconnect"),
            }
        }
        link.cancel.cancel();
    }

    /// Clear connection flags and per-link buffers. Returns whether the
    /// server had acknowledged the connection.
    fn mark_disconnected(&self) -> bool {
        let was_connected = self.with_state(|state| {
            let was = state.connected;
            state.connecting = false;
            state.connected = false;
            state.joined = false;
            was
        });
        self.inbound.clear();
        self.exchange.cancel();
        was_connected
    }

    fn stop_heartbeat(&self) {
        if let Some(token) = lock(&self.heartbeat).take() {
            token.cancel();
        }
    }

    fn send_join(&self, session_id: SessionId, player_id: PlayerId) {
        self.with_state(|state| {
            state.session_id = Some(session_id);
            state.player_id = Some(player_id);
        });
        tracing::info!(session_id, player_id, "joining session");
        self.send(MessageBody::Join(Join {
            display_name: self.options.display_name.clone(),
            session_id,
            player_id,
        }));
    }

    fn rejoin(&self) -> bool {
        let ids = {
            let state = lock(&self.state);
            state.session_id.zip(state.player_id)
        };
        match ids {
            Some((session_id, player_id)) => {
                self.send_join(session_id, player_id);
                true
            }
            None => false,
        }
    }

    fn queue_item(&self, item: PendingItem) {
        let send = ItemSend {
            location: item.location.clone(),
            item: item.item.clone(),
            to: item.to,
        };
        tracing::info!(item = %send.item, to = send.to, "sending item");
        lock(&self.outbound_items).push(item);
        self.send(MessageBody::ItemSend(send));
    }

    /// Open a new link and send `Connect`.
    async fn establish(self: &Arc<Self>) -> Result<(), ConnectionError> {
        tracing::info!(host = %self.options.host, port = self.options.port, "connecting to server");
        self.with_state(|state| state.reset_for_attempt(Instant::now()));
        let result = self.open_link().await;
        if result.is_err() {
            self.with_state(|state| state.connecting = false);
        }
        result
    }

    async fn open_link(self: &Arc<Self>) -> Result<(), ConnectionError> {
        let opts = &self.options;
        let candidates = platform::resolve_candidates(&opts.host, opts.port)
            .await
            .map_err(|source| ConnectionError::Resolve {
                host: opts.host.clone(),
                source,
            })?;
        let stream = platform::connect_any(&candidates, opts.connect_timeout)
            .await
            .ok_or_else(|| ConnectionError::NoReachableAddress {
                host: opts.host.clone(),
                port: opts.port,
            })?;
        if let Err(e) = platform::configure_stream(&stream, &opts.socket) {
            tracing::warn!(error = %e, "failed to apply socket options");
        }
        let peer = stream.peer_addr().ok();

        let (reader, writer) = stream.into_split();
        let id = self.next_link_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(write_loop(
            writer,
            rx,
            cancel.clone(),
            opts.frame.clone(),
            opts.write_timeout,
        ));
        tokio::spawn(read_loop(
            Arc::downgrade(self),
            reader,
            id,
            cancel.clone(),
            opts.frame.clone(),
        ));

        if let Some(old) = lock(&self.link).replace(Link { id, tx, cancel }) {
            old.cancel.cancel();
        }
        tracing::info!(?peer, link = id, "link established");
        self.send(MessageBody::Connect);
        Ok(())
    }

    /// Reconnect (subject to backoff) and replay the session join.
    async fn recover(self: &Arc<Self>) {
        if !lock(&self.backoff).ready(Instant::now()) {
            return;
        }
        let _guard = self.connect_lock.lock().await;
        if self.link_alive() {
            return;
        }

        match self.establish().await {
            Ok(()) => {
                lock(&self.backoff).reset();
                self.rejoin();
            }
            Err(e) => {
                let (outcome, attempt) = {
                    let mut backoff = lock(&self.backoff);
                    let outcome = backoff.record_failure(Instant::now());
                    (outcome, backoff.attempts())
                };
                match outcome {
                    Ok(retry_in) => {
                        tracing::warn!(error = %e, attempt, ?retry_in, "reconnect failed");
                        self.emit(ConnectionEvent::ReconnectFailed { attempt, retry_in });
                    }
                    Err(give_up) => {
                        tracing::error!(error = %e, "{give_up}, stopping heartbeat");
                        self.stop_heartbeat();
                    }
                }
            }
        }
    }

    async fn heartbeat_tick(self: &Arc<Self>) {
        let now = Instant::now();

        if !self.link_alive() {
            self.teardown_link(false);
            if self.mark_disconnected() {
                tracing::info!("disconnected from server");
                self.emit(ConnectionEvent::Disconnected);
            }
            self.recover().await;
            return;
        }

        let (connected, joined, expired) = {
            let state = lock(&self.state);
            (
                state.connected,
                state.joined,
                state.heartbeat_expired(now, self.options.heartbeat_timeout),
            )
        };

        if expired {
            tracing::warn!(timeout = ?self.options.heartbeat_timeout, "connection timed out");
            self.emit(ConnectionEvent::TimedOut);
            self.teardown_link(true);
            self.mark_disconnected();
            self.emit(ConnectionEvent::Disconnected);
            self.recover().await;
            return;
        }

        if connected {
            self.send(MessageBody::Ping);
            if joined {
                let resend = lock(&self.outbound_items).resend_messages();
                if !resend.is_empty() {
                    tracing::debug!(count = resend.len(), "resending unconfirmed items");
                }
                for item in resend {
                    self.send(MessageBody::ItemSend(item));
                }
            }
        }
    }

    /// Hand `message` to the host. Returns `false` if the queue is full.
    fn enqueue(&self, message: &Message) -> bool {
        match self.inbound.push(message.clone()) {
            Ok(()) => true,
            Err(full) => {
                tracing::warn!(
                    capacity = full.capacity,
                    tag = %full.message.tag(),
                    "inbound queue full, not acknowledging message"
                );
                false
            }
        }
    }

    /// Handle one message from link `link_id`.
    fn dispatch(&self, link_id: u64, message: Message) {
        if lock(&self.link).as_ref().map(|link| link.id) != Some(link_id) {
            tracing::debug!(link = link_id, "ignoring message from stale link");
            return;
        }
        tracing::debug!(tag = %message.tag(), "received");

        match &message.body {
            MessageBody::Connect => {
                let uid = message.sender_uid;
                self.with_state(|state| {
                    state.uid = uid;
                    state.connecting = false;
                    state.connected = true;
                    state.last_heartbeat = Instant::now();
                });
                tracing::info!(uid, "connected");
                self.emit(ConnectionEvent::Connected { uid });
            }
            MessageBody::Disconnect => {
                self.with_state(|state| {
                    state.connected = false;
                    state.joined = false;
                });
                tracing::info!("server closed the session");
                self.emit(ConnectionEvent::Disconnected);
            }
            MessageBody::JoinConfirm(confirm) => {
                self.with_state(|state| {
                    state.joined = true;
                    state.session_id = Some(confirm.session_id);
                    state.player_id = Some(confirm.player_id);
                });
                tracing::info!(
                    session_id = confirm.session_id,
                    player_id = confirm.player_id,
                    "joined"
                );
                self.emit(ConnectionEvent::Joined {
                    session_id: confirm.session_id,
                    player_id: confirm.player_id,
                });
                for item in self.host.unconfirmed_items() {
                    self.queue_item(item);
                }
            }
            MessageBody::Leave => {
                // An echo of our own `leave` was already reported.
                let was_joined = self.with_state(|state| std::mem::take(&mut state.joined));
                if was_joined {
                    self.emit(ConnectionEvent::Left);
                }
            }
            MessageBody::Ping => {
                self.with_state(|state| state.last_heartbeat = Instant::now());
            }
            MessageBody::ItemReceive(receive) => {
                let confirm = ItemReceiveConfirm {
                    item: receive.item.clone(),
                    from: receive.from.clone(),
                };
                // Unconfirmed items are resent by the server.
                if self.enqueue(&message) {
                    self.send(MessageBody::ItemReceiveConfirm(confirm));
                }
            }
            MessageBody::ItemSendConfirm(confirm) => {
                let removed = lock(&self.outbound_items).confirm(confirm.to, &confirm.item);
                tracing::info!(item = %confirm.item, to = confirm.to, removed, "item confirmed");
                self.host.mark_item_confirmed(confirm.to, &confirm.item);
            }
            MessageBody::ReadyConfirm(ready) => {
                self.with_state(|state| state.ready_id = ready.ready_id);
                self.host.ready_id_changed(ready.ready_id);
                self.enqueue(&message);
            }
            MessageBody::RequestCharmCosts => {
                let player_id = lock(&self.state).player_id;
                match (player_id, self.host.charm_costs()) {
                    (Some(player_id), Some(costs)) => {
                        self.send(MessageBody::AnnounceCharmCosts(AnnounceCharmCosts {
                            player_id,
                            costs,
                        }));
                    }
                    _ => tracing::debug!("charm costs requested but not known yet"),
                }
            }
            MessageBody::AnnounceCharmCosts(announce) => {
                tracing::info!(player_id = announce.player_id, "received charm costs");
                let confirm = ConfirmCharmCostsReceived {
                    player_id: announce.player_id,
                };
                if self.enqueue(&message) {
                    self.send(MessageBody::ConfirmCharmCostsReceived(confirm));
                }
            }
            MessageBody::Result(result) => {
                if !self.exchange.complete(result.clone()) {
                    tracing::warn!(
                        session_id = result.session_id,
                        "Result arrived with no exchange pending"
                    );
                }
            }
            MessageBody::ItemsSendConfirm(_)
            | MessageBody::Notify(_)
            | MessageBody::RequestRando => {
                self.enqueue(&message);
            }
            MessageBody::Join(_)
            | MessageBody::Ready(_)
            | MessageBody::Unready
            | MessageBody::InitiateGame(_)
            | MessageBody::RejoinGame(_)
            | MessageBody::ItemSend(_)
            | MessageBody::ItemsSend(_)
            | MessageBody::ItemReceiveConfirm(_)
            | MessageBody::Save(_)
            | MessageBody::RandoGenerated(_)
            | MessageBody::ConfirmCharmCostsReceived(_) => {
                tracing::debug!(tag = %message.tag(), "ignoring server-bound message kind");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Link tasks
// ---------------------------------------------------------------------------

async fn read_loop(
    shared: Weak<Shared>,
    mut reader: OwnedReadHalf,
    link_id: u64,
    cancel: CancellationToken,
    frame: FrameConfig,
) {
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = framing::read_message(&mut reader, &frame) => result,
        };
        let Some(core) = shared.upgrade() else {
            break;
        };

        match result {
            Ok(message) => core.dispatch(link_id, message),
            Err(e) if e.is_recoverable() => {
                tracing::warn!(link = link_id, error = %e, "skipping malformed frame");
            }
            Err(FrameError::Decode(DecodeError::UnknownTag(tag))) => {
                tracing::error!(link = link_id, tag, "unknown message tag, closing link");
                core.emit(ConnectionEvent::ProtocolViolation { tag });
                break;
            }
            Err(FrameError::ConnectionClosed) => {
                tracing::info!(link = link_id, "server closed the connection");
                break;
            }
            Err(e) => {
                tracing::warn!(link = link_id, error = %e, "read failed");
                break;
            }
        }
    }
    cancel.cancel();
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    cancel: CancellationToken,
    frame: FrameConfig,
    write_timeout: Duration,
) {
    loop {
        // Queued frames win over cancellation so a final Disconnect is flushed.
        let body = tokio::select! {
            biased;
            body = rx.recv() => match body {
                Some(body) => body,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };

        let write = framing::write_frame(&mut writer, &body, &frame);
        match tokio::time::timeout(write_timeout, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "write failed, dropping link");
                cancel.cancel();
                break;
            }
            Err(_) => {
                tracing::warn!(?write_timeout, "write timed out, dropping link");
                cancel.cancel();
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}

async fn heartbeat_loop(shared: Weak<Shared>, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(core) = shared.upgrade() else {
                    break;
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = core.heartbeat_tick() => {}
                }
            }
        }
    }
    tracing::debug!("heartbeat stopped");
}

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

/// Handle to the relay connection. Cheap to clone; clones share one core.
#[derive(Clone)]
pub struct ConnectionCore {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ConnectionCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionCore")
            .field("host", &self.shared.options.host)
            .field("port", &self.shared.options.port)
            .field("status", &self.status())
            .finish()
    }
}

impl ConnectionCore {
    /// Create a disconnected core.
    pub fn new(options: ClientOptions, host: Arc<dyn ClientHost>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (status, _) = watch::channel(ConnectionStatus::NotConnected);
        let shared = Shared {
            inbound: InboundQueue::new(options.inbound_capacity),
            backoff: Mutex::new(ReconnectState::new(options.reconnect.clone())),
            options,
            host,
            state: Mutex::new(ConnectionState::new()),
            link: Mutex::new(None),
            outbound_items: Mutex::new(OutboundItemQueue::new()),
            exchange: PendingExchange::new(),
            events,
            status,
            heartbeat: Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            next_link_id: AtomicU64::new(1),
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    /// Create a core with no host hooks.
    pub fn detached(options: ClientOptions) -> Self {
        Self::new(options, Arc::new(DetachedHost))
    }

    /// Connect to the relay, dropping any existing link first.
    ///
    /// Returns once the TCP link is up and `Connect` is queued; the status
    /// becomes [`ConnectionStatus::Connected`] when the server answers.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        if self.shared.link_alive() {
            self.disconnect();
        }
        let _guard = self.shared.connect_lock.lock().await;
        self.shared.establish().await?;
        lock(&self.shared.backoff).reset();
        self.start_heartbeat();
        Ok(())
    }

    fn start_heartbeat(&self) {
        let mut slot = lock(&self.shared.heartbeat);
        if slot.as_ref().is_some_and(|token| !token.is_cancelled()) {
            return;
        }
        let token = CancellationToken::new();
        *slot = Some(token.clone());
        tokio::spawn(heartbeat_loop(
            Arc::downgrade(&self.shared),
            self.shared.options.heartbeat_interval,
            token,
        ));
    }

    /// Close the connection and stop the heartbeat.
    ///
    /// Sends a best-effort `Disconnect`, clears the inbound queue and cancels
    /// a pending exchange. The session ids are kept for a later
    /// [`rejoin`](Self::rejoin).
    pub fn disconnect(&self) {
        tracing::info!(uid = lock(&self.shared.state).uid, "disconnecting from server");
        self.shared.stop_heartbeat();
        self.shared.teardown_link(true);
        self.shared.mark_disconnected();
        lock(&self.shared.backoff).reset();
        self.shared.emit(ConnectionEvent::Disconnected);
    }

    /// Bind to a session player slot. Replayed automatically after reconnects.
    pub fn join_session(&self, session_id: SessionId, player_id: PlayerId) {
        self.shared.send_join(session_id, player_id);
    }

    /// Re-send `Join` for the remembered session. Returns `false` if none.
    pub fn rejoin(&self) -> bool {
        self.shared.rejoin()
    }

    /// Leave the current session.
    pub fn leave(&self) {
        self.shared.with_state(|state| {
            state.session_id = None;
            state.player_id = None;
            state.joined = false;
        });
        self.shared.send(MessageBody::Leave);
        self.shared.emit(ConnectionEvent::Left);
    }

    /// Route an item to `to`. It is resent on every heartbeat until the
    /// server confirms it.
    pub fn send_item(&self, location: impl Into<String>, item: impl Into<String>, to: PlayerId) {
        self.shared.queue_item(PendingItem::new(
            to,
            self.shared.options.display_name.clone(),
            location,
            item,
        ));
    }

    /// Route a batch of items in one message. Not tracked for resend.
    pub fn send_items(&self, items: Vec<ItemRecord>) {
        tracing::info!(count = items.len(), "sending item batch");
        self.shared.send(MessageBody::ItemsSend(ItemsSend { items }));
    }

    /// Enter ready room `room`.
    pub fn ready_up(&self, room: impl Into<String>) {
        self.shared.send(MessageBody::Ready(Ready {
            room: room.into(),
            nickname: self.shared.options.display_name.clone(),
        }));
    }

    /// Leave the ready room.
    pub fn unready(&self) {
        self.shared.send(MessageBody::Unready);
    }

    /// Start generation for the current ready room.
    pub fn initiate_game(&self, seed: i32) {
        let ready_id = lock(&self.shared.state).ready_id;
        self.shared
            .send(MessageBody::InitiateGame(InitiateGame { seed, ready_id }));
    }

    /// Ask the server to replay the last generation.
    pub fn rejoin_game(&self) {
        let ready_id = lock(&self.shared.state).ready_id;
        self.shared
            .send(MessageBody::RejoinGame(RejoinGame { ready_id }));
    }

    /// Tell the server the game was saved, then forget the ready id.
    pub fn notify_save(&self) {
        let ready_id = self.shared.with_state(|state| {
            let id = state.ready_id;
            state.ready_id = -1;
            id
        });
        self.shared.send(MessageBody::Save(Save { ready_id }));
        self.shared.host.ready_id_changed(-1);
    }

    /// Restore a persisted ready id.
    pub fn set_ready_id(&self, ready_id: i32) {
        self.shared.with_state(|state| state.ready_id = ready_id);
    }

    /// Send this client's placements and wait for the assignment result.
    ///
    /// On success the host's [`ClientHost::on_assignment`] hook runs before
    /// the result is returned.
    pub async fn exchange_items(
        &self,
        placements: Vec<Placement>,
    ) -> Result<AssignmentResult, ExchangeError> {
        if !self.shared.link_alive() {
            return Err(ExchangeError::NotConnected);
        }
        let rx = self.shared.exchange.begin()?;
        let sent = self
            .shared
            .send(MessageBody::RandoGenerated(RandoGenerated { items: placements }));
        if !sent {
            self.shared.exchange.cancel();
            return Err(ExchangeError::NotConnected);
        }

        let timeout = self.shared.options.exchange_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => {
                tracing::info!(
                    session_id = result.session_id,
                    player_id = result.player_id,
                    "exchanged items with server"
                );
                self.shared.host.on_assignment(&result);
                Ok(result)
            }
            Ok(Err(_)) => Err(ExchangeError::Cancelled),
            Err(_) => {
                self.shared.exchange.cancel();
                tracing::warn!(?timeout, "no assignment result from server");
                Err(ExchangeError::Timeout)
            }
        }
    }

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        lock(&self.shared.state).status()
    }

    /// Status changes as a watch channel.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    /// Take the oldest message waiting for the host.
    pub fn poll_inbound(&self) -> Option<Message> {
        self.shared.inbound.pop()
    }

    /// Snapshot of the connection state.
    pub fn state(&self) -> ConnectionState {
        lock(&self.shared.state).clone()
    }

    /// Items sent but not yet confirmed, oldest first.
    pub fn pending_items(&self) -> Vec<PendingItem> {
        lock(&self.shared.outbound_items).iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{
        ItemReceive, ItemSendConfirm, JoinConfirm, Notify, ReadyConfirm,
    };
    use crate::schema::MessageTag;
    use tokio::net::{TcpListener, TcpStream};

    #[derive(Default)]
    struct RecordingHost {
        confirmed: Mutex<Vec<(PlayerId, String)>>,
        assignments: Mutex<Vec<AssignmentResult>>,
        ready_ids: Mutex<Vec<i32>>,
        unconfirmed: Vec<PendingItem>,
        costs: Option<Vec<i32>>,
    }

    impl ClientHost for RecordingHost {
        fn unconfirmed_items(&self) -> Vec<PendingItem> {
            self.unconfirmed.clone()
        }
        fn mark_item_confirmed(&self, to: PlayerId, item: &str) {
            self.confirmed.lock().unwrap().push((to, item.to_string()));
        }
        fn charm_costs(&self) -> Option<Vec<i32>> {
            self.costs.clone()
        }
        fn on_assignment(&self, result: &AssignmentResult) {
            self.assignments.lock().unwrap().push(result.clone());
        }
        fn ready_id_changed(&self, ready_id: i32) {
            self.ready_ids.lock().unwrap().push(ready_id);
        }
    }

    fn options(port: u16) -> ClientOptions {
        ClientOptions {
            host: "127.0.0.1".into(),
            port,
            display_name: "tester".into(),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(105),
            exchange_timeout: Duration::from_millis(300),
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_millis(20),
                jitter: 0.0,
                ..ReconnectConfig::default()
            },
            ..ClientOptions::default()
        }
    }

    fn fast_heartbeat(port: u16) -> ClientOptions {
        ClientOptions {
            heartbeat_interval: Duration::from_millis(50),
            heartbeat_timeout: Duration::from_millis(175),
            ..options(port)
        }
    }

    async fn listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    async fn send(stream: &mut TcpStream, uid: u64, body: MessageBody) {
        framing::write_message(stream, &Message::from_sender(uid, body), &FrameConfig::default())
            .await
            .unwrap();
    }

    /// Read the next message, answering Pings on the way.
    async fn recv(stream: &mut TcpStream) -> Message {
        loop {
            let msg = tokio::time::timeout(
                Duration::from_secs(5),
                framing::read_message(stream, &FrameConfig::default()),
            )
            .await
            .expect("timed out waiting for client message")
            .unwrap();
            if msg.body == MessageBody::Ping {
                send(stream, 0, MessageBody::Ping).await;
                continue;
            }
            return msg;
        }
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    /// Accept the client and complete the Connect handshake with `uid`.
    async fn handshake(listener: &TcpListener, core: &ConnectionCore, uid: u64) -> TcpStream {
        let (mut stream, _) = listener.accept().await.unwrap();
        let hello = recv(&mut stream).await;
        assert_eq!(hello.body, MessageBody::Connect);
        assert_eq!(hello.sender_uid, 0);
        send(&mut stream, uid, MessageBody::Connect).await;
        wait_for(|| core.status() == ConnectionStatus::Connected).await;
        stream
    }

    async fn join(stream: &mut TcpStream, core: &ConnectionCore, session_id: i32, player_id: i32) {
        core.join_session(session_id, player_id);
        let msg = recv(stream).await;
        assert!(matches!(
            msg.body,
            MessageBody::Join(ref j) if j.session_id == session_id && j.player_id == player_id
        ));
        send(
            stream,
            0,
            MessageBody::JoinConfirm(JoinConfirm {
                session_id,
                player_id,
            }),
        )
        .await;
        wait_for(|| core.status() == ConnectionStatus::Joined).await;
    }

    #[test]
    fn test_status_derivation() {
        let mut state = ConnectionState::new();
        assert_eq!(state.status(), ConnectionStatus::NotConnected);
        state.reset_for_attempt(Instant::now());
        assert_eq!(state.status(), ConnectionStatus::Connecting);
        state.connected = true;
        assert_eq!(state.status(), ConnectionStatus::Connected);
        state.joined = true;
        assert_eq!(state.status(), ConnectionStatus::Joined);
    }

    #[test]
    fn test_reset_keeps_session_ids() {
        let mut state = ConnectionState::new();
        state.uid = 9;
        state.connected = true;
        state.session_id = Some(2);
        state.player_id = Some(1);
        state.reset_for_attempt(Instant::now());
        assert_eq!(state.uid, 0);
        assert!(!state.connected);
        assert_eq!(state.session_id, Some(2));
        assert_eq!(state.player_id, Some(1));
    }

    #[test]
    fn test_options_from_config() {
        let opts = ClientOptions::from_config(&Config::default());
        assert_eq!(opts.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(opts.heartbeat_timeout, Duration::from_secs(35));
        assert_eq!(opts.exchange_timeout, Duration::from_secs(60));
        assert_eq!(opts.port, 38281);
    }

    #[tokio::test]
    async fn test_connect_handshake_assigns_uid() {
        let (listener, port) = listener().await;
        let core = ConnectionCore::detached(options(port));
        let mut events = core.subscribe();

        core.connect().await.unwrap();
        let _stream = handshake(&listener, &core, 42).await;

        assert_eq!(core.state().uid, 42);
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Connected { uid: 42 });
    }

    #[tokio::test]
    async fn test_connect_unreachable() {
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        let core = ConnectionCore::detached(options(port));
        let err = core.connect().await.unwrap_err();
        assert!(matches!(err, ConnectionError::NoReachableAddress { .. }));
        assert_eq!(core.status(), ConnectionStatus::NotConnected);
    }

    #[tokio::test]
    async fn test_send_item_until_confirmed() {
        let (listener, port) = listener().await;
        let host = Arc::new(RecordingHost::default());
        let core = ConnectionCore::new(options(port), host.clone());
        core.connect().await.unwrap();
        let mut stream = handshake(&listener, &core, 7).await;
        join(&mut stream, &core, 3, 1).await;

        core.send_item("Crossroads_04", "Mothwing_Cloak", 2);
        let msg = recv(&mut stream).await;
        assert_eq!(msg.sender_uid, 7);
        assert!(matches!(
            msg.body,
            MessageBody::ItemSend(ref s) if s.item == "Mothwing_Cloak" && s.to == 2
        ));
        assert_eq!(core.pending_items().len(), 1);

        send(
            &mut stream,
            0,
            MessageBody::ItemSendConfirm(ItemSendConfirm {
                location: "Crossroads_04".into(),
                item: "Mothwing_Cloak".into(),
                to: 2,
            }),
        )
        .await;
        wait_for(|| core.pending_items().is_empty()).await;
        assert_eq!(
            host.confirmed.lock().unwrap().as_slice(),
            &[(2, "Mothwing_Cloak".to_string())]
        );
    }

    #[tokio::test]
    async fn test_join_confirm_resends_prior_run_items() {
        let (listener, port) = listener().await;
        let host = Arc::new(RecordingHost {
            unconfirmed: vec![PendingItem::new(4, "tester", "Town", "Grub")],
            ..RecordingHost::default()
        });
        let core = ConnectionCore::new(options(port), host);
        core.connect().await.unwrap();
        let mut stream = handshake(&listener, &core, 1).await;
        join(&mut stream, &core, 8, 0).await;

        let msg = recv(&mut stream).await;
        assert!(matches!(msg.body, MessageBody::ItemSend(ref s) if s.item == "Grub" && s.to == 4));
    }

    #[tokio::test]
    async fn test_item_receive_is_queued_and_confirmed() {
        let (listener, port) = listener().await;
        let core = ConnectionCore::detached(options(port));
        core.connect().await.unwrap();
        let mut stream = handshake(&listener, &core, 1).await;

        let receive = ItemReceive {
            location: "Abyss_06".into(),
            item: "Shade_Cloak".into(),
            from: "Quirrel".into(),
        };
        send(&mut stream, 0, MessageBody::ItemReceive(receive.clone())).await;

        let confirm = recv(&mut stream).await;
        assert_eq!(
            confirm.body,
            MessageBody::ItemReceiveConfirm(ItemReceiveConfirm {
                item: "Shade_Cloak".into(),
                from: "Quirrel".into(),
            })
        );
        let queued = core.poll_inbound().unwrap();
        assert_eq!(queued.body, MessageBody::ItemReceive(receive));
        assert!(core.poll_inbound().is_none());
    }

    #[tokio::test]
    async fn test_full_inbound_queue_leaves_item_unconfirmed() {
        let (listener, port) = listener().await;
        let host = Arc::new(RecordingHost {
            costs: Some(vec![1, 2, 3]),
            ..RecordingHost::default()
        });
        let core = ConnectionCore::new(
            ClientOptions {
                inbound_capacity: 2,
                ..options(port)
            },
            host,
        );
        core.connect().await.unwrap();
        let mut stream = handshake(&listener, &core, 1).await;
        join(&mut stream, &core, 5, 2).await;

        let receive = |item: &str| ItemReceive {
            location: "Crossroads".into(),
            item: item.into(),
            from: "Zote".into(),
        };
        for item in ["A", "B", "C"] {
            send(&mut stream, 0, MessageBody::ItemReceive(receive(item))).await;
        }
        // Answered only after C has been dispatched.
        send(&mut stream, 0, MessageBody::RequestCharmCosts).await;

        let mut confirmed = Vec::new();
        loop {
            match recv(&mut stream).await.body {
                MessageBody::ItemReceiveConfirm(confirm) => confirmed.push(confirm.item),
                MessageBody::AnnounceCharmCosts(_) => break,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(confirmed, vec!["A", "B"]);

        let mut delivered = Vec::new();
        while let Some(message) = core.poll_inbound() {
            if let MessageBody::ItemReceive(r) = message.body {
                delivered.push(r.item);
            }
        }
        assert_eq!(delivered, vec!["A", "B"]);

        // The server resends what it never saw confirmed.
        send(&mut stream, 0, MessageBody::ItemReceive(receive("C"))).await;
        let confirm = recv(&mut stream).await;
        assert_eq!(
            confirm.body,
            MessageBody::ItemReceiveConfirm(ItemReceiveConfirm {
                item: "C".into(),
                from: "Zote".into(),
            })
        );
        let queued = core.poll_inbound().unwrap();
        assert_eq!(queued.body, MessageBody::ItemReceive(receive("C")));
    }

    #[tokio::test]
    async fn test_ready_confirm_updates_ready_id() {
        let (listener, port) = listener().await;
        let host = Arc::new(RecordingHost::default());
        let core = ConnectionCore::new(options(port), host.clone());
        core.connect().await.unwrap();
        let mut stream = handshake(&listener, &core, 1).await;

        core.ready_up("room");
        let ready = recv(&mut stream).await;
        assert_eq!(
            ready.body,
            MessageBody::Ready(Ready {
                room: "room".into(),
                nickname: "tester".into()
            })
        );
        send(
            &mut stream,
            0,
            MessageBody::ReadyConfirm(ReadyConfirm {
                ready_count: 1,
                names: vec!["tester".into()],
                ready_id: 77,
            }),
        )
        .await;
        wait_for(|| core.state().ready_id == 77).await;

        core.initiate_game(1234);
        let start = recv(&mut stream).await;
        assert_eq!(
            start.body,
            MessageBody::InitiateGame(InitiateGame {
                seed: 1234,
                ready_id: 77
            })
        );

        core.notify_save();
        let save = recv(&mut stream).await;
        assert_eq!(save.body, MessageBody::Save(Save { ready_id: 77 }));
        assert_eq!(core.state().ready_id, -1);
        assert_eq!(host.ready_ids.lock().unwrap().as_slice(), &[77, -1]);
    }

    #[tokio::test]
    async fn test_charm_costs_request_and_announce() {
        let (listener, port) = listener().await;
        let host = Arc::new(RecordingHost {
            costs: Some(vec![1, 2, 3]),
            ..RecordingHost::default()
        });
        let core = ConnectionCore::new(options(port), host);
        core.connect().await.unwrap();
        let mut stream = handshake(&listener, &core, 1).await;
        join(&mut stream, &core, 5, 2).await;

        send(&mut stream, 0, MessageBody::RequestCharmCosts).await;
        let announce = recv(&mut stream).await;
        assert_eq!(
            announce.body,
            MessageBody::AnnounceCharmCosts(AnnounceCharmCosts {
                player_id: 2,
                costs: vec![1, 2, 3]
            })
        );

        send(
            &mut stream,
            0,
            MessageBody::AnnounceCharmCosts(AnnounceCharmCosts {
                player_id: 0,
                costs: vec![4],
            }),
        )
        .await;
        let ack = recv(&mut stream).await;
        assert_eq!(
            ack.body,
            MessageBody::ConfirmCharmCostsReceived(ConfirmCharmCostsReceived { player_id: 0 })
        );
    }

    #[tokio::test]
    async fn test_malformed_frame_is_skipped() {
        let (listener, port) = listener().await;
        let core = ConnectionCore::detached(options(port));
        core.connect().await.unwrap();
        let mut stream = handshake(&listener, &core, 1).await;

        framing::write_frame(
            &mut stream,
            &[MessageTag::ItemReceive as u8, 0, 40],
            &FrameConfig::default(),
        )
        .await
        .unwrap();
        send(
            &mut stream,
            0,
            MessageBody::Notify(Notify {
                text: "still here".into(),
            }),
        )
        .await;

        wait_for(|| core.shared.inbound.len() == 1).await;
        let msg = core.poll_inbound().unwrap();
        assert_eq!(msg.tag(), MessageTag::Notify);
        assert_eq!(core.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_unknown_tag_closes_link() {
        let (listener, port) = listener().await;
        let core = ConnectionCore::detached(options(port));
        let mut events = core.subscribe();
        core.connect().await.unwrap();
        let mut stream = handshake(&listener, &core, 1).await;
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Connected { uid: 1 });

        framing::write_frame(&mut stream, &[0xEE, 0], &FrameConfig::default())
            .await
            .unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            ConnectionEvent::ProtocolViolation { tag: 0xEE }
        );
        wait_for(|| !core.shared.link_alive()).await;
    }

    #[tokio::test]
    async fn test_heartbeat_pings_and_resends_items() {
        let (listener, port) = listener().await;
        let core = ConnectionCore::detached(fast_heartbeat(port));
        core.connect().await.unwrap();
        let mut stream = handshake(&listener, &core, 1).await;
        join(&mut stream, &core, 1, 0).await;

        core.send_item("Town", "Geo", 3);
        // Original send plus at least one heartbeat resend.
        for _ in 0..2 {
            let msg = recv(&mut stream).await;
            assert!(matches!(msg.body, MessageBody::ItemSend(ref s) if s.item == "Geo"));
        }
        assert_eq!(core.status(), ConnectionStatus::Joined);
    }

    #[tokio::test]
    async fn test_silent_server_triggers_reconnect_and_rejoin() {
        let (listener, port) = listener().await;
        let core = ConnectionCore::detached(fast_heartbeat(port));
        let mut events = core.subscribe();
        core.connect().await.unwrap();
        let mut first = handshake(&listener, &core, 1).await;
        join(&mut first, &core, 6, 2).await;

        // Stop answering: the client must time out and dial again.
        let (mut second, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();
        let hello = recv(&mut second).await;
        assert_eq!(hello.body, MessageBody::Connect);
        let rejoin = recv(&mut second).await;
        assert!(matches!(
            rejoin.body,
            MessageBody::Join(ref j) if j.session_id == 6 && j.player_id == 2
        ));

        let mut saw_timeout = false;
        while let Ok(event) = events.try_recv() {
            saw_timeout |= event == ConnectionEvent::TimedOut;
        }
        assert!(saw_timeout);
        drop(first);
    }

    #[tokio::test]
    async fn test_exchange_completes() {
        let (listener, port) = listener().await;
        let host = Arc::new(RecordingHost::default());
        let core = ConnectionCore::new(options(port), host.clone());
        core.connect().await.unwrap();
        let mut stream = handshake(&listener, &core, 1).await;

        let placements = vec![Placement {
            location: "Tutorial_01".into(),
            item: "Dash".into(),
        }];
        let exchange = tokio::spawn({
            let core = core.clone();
            let placements = placements.clone();
            async move { core.exchange_items(placements).await }
        });

        let generated = recv(&mut stream).await;
        assert_eq!(
            generated.body,
            MessageBody::RandoGenerated(RandoGenerated {
                items: placements.clone()
            })
        );
        let result = AssignmentResult {
            player_id: 0,
            session_id: 11,
            nicknames: vec!["tester".into()],
            items: placements,
        };
        send(&mut stream, 0, MessageBody::Result(result.clone())).await;

        assert_eq!(exchange.await.unwrap().unwrap(), result);
        assert_eq!(host.assignments.lock().unwrap().as_slice(), &[result]);
    }

    #[tokio::test]
    async fn test_exchange_times_out() {
        let (listener, port) = listener().await;
        let core = ConnectionCore::detached(options(port));
        core.connect().await.unwrap();
        let _stream = handshake(&listener, &core, 1).await;

        let err = core.exchange_items(vec![]).await.unwrap_err();
        assert_eq!(err, ExchangeError::Timeout);
        assert!(!core.shared.exchange.is_pending());
    }

    #[tokio::test]
    async fn test_exchange_requires_connection() {
        let core = ConnectionCore::detached(options(1));
        assert_eq!(
            core.exchange_items(vec![]).await.unwrap_err(),
            ExchangeError::NotConnected
        );
    }

    #[tokio::test]
    async fn test_disconnect_notifies_server_and_clears_inbound() {
        let (listener, port) = listener().await;
        let core = ConnectionCore::detached(options(port));
        core.connect().await.unwrap();
        let mut stream = handshake(&listener, &core, 5).await;

        send(
            &mut stream,
            0,
            MessageBody::Notify(Notify { text: "hi".into() }),
        )
        .await;
        wait_for(|| core.shared.inbound.len() == 1).await;

        core.disconnect();
        let bye = recv(&mut stream).await;
        assert_eq!(bye.body, MessageBody::Disconnect);
        assert_eq!(bye.sender_uid, 5);
        assert_eq!(core.status(), ConnectionStatus::NotConnected);
        assert!(core.poll_inbound().is_none());
    }

    #[tokio::test]
    async fn test_leave_clears_session() {
        let (listener, port) = listener().await;
        let core = ConnectionCore::detached(options(port));
        core.connect().await.unwrap();
        let mut stream = handshake(&listener, &core, 1).await;
        join(&mut stream, &core, 2, 1).await;
        let mut events = core.subscribe();

        core.leave();
        assert_eq!(recv(&mut stream).await.body, MessageBody::Leave);
        assert_eq!(core.status(), ConnectionStatus::Connected);
        assert!(!core.rejoin());

        // The server echoes Leave; the Notify marks it as processed.
        send(&mut stream, 0, MessageBody::Leave).await;
        send(&mut stream, 0, MessageBody::Notify(Notify { text: "bye".into() })).await;
        wait_for(|| core.shared.inbound.len() == 1).await;
        assert_eq!(events.try_recv().unwrap(), ConnectionEvent::Left);
        assert!(events.try_recv().is_err());
    }
}
