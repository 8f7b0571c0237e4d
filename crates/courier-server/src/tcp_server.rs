//! TCP relay server: accepts clients and pumps frames through the [`Relay`].

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use courier_config::ServerConfig;
use courier_net::framing::{self, FrameConfig, FrameError};
use courier_net::messages::{Message, MessageBody};
use courier_net::platform::{self, SocketConfig};
use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{RwLock, mpsc, watch};

use crate::dispatch::Relay;
use crate::error::ServerError;
use crate::lobby::ItemAssigner;
use crate::registry::Outgoing;

/// Unique identifier for a TCP connection within a server run.
///
/// Also sent to the client as its `sender_uid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Atomic generator for monotonically increasing [`ConnectionId`]s.
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a new generator starting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Return the next unique [`ConnectionId`].
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Error returned when the connection map is at capacity.
#[derive(Debug, thiserror::Error)]
#[error("connection limit reached")]
pub struct ConnectionLimitReached;

/// Outbound queues of live connections.
pub struct ConnectionMap {
    inner: RwLock<HashMap<ConnectionId, mpsc::UnboundedSender<Message>>>,
    max_connections: usize,
}

impl ConnectionMap {
    /// Create a new map with the given capacity limit.
    pub fn new(max_connections: usize) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            max_connections,
        }
    }

    /// Insert a connection. Returns `Err` if the map is at capacity.
    pub async fn insert(
        &self,
        id: ConnectionId,
        tx: mpsc::UnboundedSender<Message>,
    ) -> Result<(), ConnectionLimitReached> {
        let mut map = self.inner.write().await;
        if map.len() >= self.max_connections {
            return Err(ConnectionLimitReached);
        }
        map.insert(id, tx);
        Ok(())
    }

    /// Remove a connection by ID.
    pub async fn remove(&self, id: &ConnectionId) -> Option<mpsc::UnboundedSender<Message>> {
        self.inner.write().await.remove(id)
    }

    /// Queue `body` for `id`, stamped with the destination's uid.
    /// Returns `false` if the connection is gone.
    pub async fn send(&self, id: ConnectionId, body: MessageBody) -> bool {
        let map = self.inner.read().await;
        match map.get(&id) {
            Some(tx) => tx.send(Message::from_sender(id.0, body)).is_ok(),
            None => false,
        }
    }

    /// Deliver a batch of outgoing messages.
    pub async fn deliver(&self, outgoing: Vec<Outgoing>) {
        for Outgoing {
            connection,
            message,
        } in outgoing
        {
            let tag = message.tag();
            if !self.send(connection, message).await {
                tracing::debug!(%connection, %tag, "dropping message for closed connection");
            }
        }
    }

    /// Return the number of active connections.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Return whether the map is empty.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

/// Settings for [`RelayServer`].
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Address to bind to. Default: `0.0.0.0:38281`.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections. Default: 256.
    pub max_connections: usize,
    /// Drop a connection after this long without a frame.
    pub idle_timeout: Duration,
    /// Interval of the confirmable resend and session sweep.
    pub resend_interval: Duration,
    /// Options applied to accepted sockets.
    pub socket: SocketConfig,
    /// Frame limits.
    pub frame: FrameConfig,
}

impl Default for ServerOptions {
    fn default() -> Self {
        let config = ServerConfig::default();
        Self {
            bind_addr: SocketAddr::new(IpAddr::from([0, 0, 0, 0]), config.port),
            max_connections: config.max_connections,
            idle_timeout: config.idle_timeout(),
            resend_interval: config.resend_interval(),
            socket: SocketConfig::default(),
            frame: FrameConfig::default(),
        }
    }
}

impl ServerOptions {
    /// Build options from the `server` config section.
    pub fn from_config(config: &ServerConfig) -> Result<Self, ServerError> {
        let ip: IpAddr = config
            .bind_address
            .parse()
            .map_err(|_| ServerError::InvalidBindAddress(config.bind_address.clone()))?;
        Ok(Self {
            bind_addr: SocketAddr::new(ip, config.port),
            max_connections: config.max_connections,
            idle_timeout: config.idle_timeout(),
            resend_interval: config.resend_interval(),
            ..Self::default()
        })
    }
}

/// TCP relay server.
pub struct RelayServer {
    options: ServerOptions,
    relay: Arc<Relay>,
    /// Active connection map (public for test inspection).
    pub connections: Arc<ConnectionMap>,
    id_gen: Arc<IdGenerator>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl RelayServer {
    /// Create a server that keeps each player's own placements.
    pub fn new(options: ServerOptions) -> Self {
        Self::with_relay(options, Relay::default())
    }

    /// Create a server with a custom item assigner.
    pub fn with_assigner(options: ServerOptions, assigner: Arc<dyn ItemAssigner>) -> Self {
        Self::with_relay(options, Relay::new(assigner))
    }

    fn with_relay(options: ServerOptions, relay: Relay) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            connections: Arc::new(ConnectionMap::new(options.max_connections)),
            relay: Arc::new(relay),
            id_gen: Arc::new(IdGenerator::new()),
            options,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Routing state.
    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    /// Bind to the configured address and run the accept loop.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = platform::create_listener(self.options.bind_addr, &self.options.socket)
            .await
            .map_err(|source| ServerError::Bind {
                addr: self.options.bind_addr,
                source,
            })?;
        tracing::info!(addr = %self.options.bind_addr, "relay listening");
        self.run_with_listener(listener).await
    }

    /// Run the accept loop with a pre-bound listener (useful for tests).
    pub async fn run_with_listener(&self, listener: TcpListener) -> Result<(), ServerError> {
        let mut shutdown_rx = self.shutdown_rx.clone();
        let resend = tokio::spawn(resend_loop(
            Arc::clone(&self.relay),
            Arc::clone(&self.connections),
            self.options.resend_interval,
            self.shutdown_rx.clone(),
        ));

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, peer_addr) = match result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    if let Err(e) = platform::configure_stream(&stream, &self.options.socket) {
                        tracing::warn!(%peer_addr, error = %e, "failed to configure socket");
                    }

                    let id = self.id_gen.next_id();
                    let (tx, rx) = mpsc::unbounded_channel();
                    if self.connections.insert(id, tx).await.is_err() {
                        tracing::warn!(%peer_addr, "connection limit reached, rejecting");
                        continue;
                    }
                    tracing::info!(connection = %id, %peer_addr, "accepted connection");

                    let (reader, writer) = stream.into_split();
                    tokio::spawn(write_loop(
                        id,
                        writer,
                        rx,
                        self.options.frame.clone(),
                        self.shutdown_rx.clone(),
                    ));

                    let relay = Arc::clone(&self.relay);
                    let connections = Arc::clone(&self.connections);
                    let options = self.options.clone();
                    let task_shutdown = self.shutdown_rx.clone();
                    tokio::spawn(async move {
                        read_loop(id, reader, &relay, &connections, &options, task_shutdown).await;
                        connections.remove(&id).await;
                        let out = relay.connection_closed(id).await;
                        connections.deliver(out).await;
                        tracing::info!(connection = %id, "connection closed");
                    });
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("relay shutting down");
                        break;
                    }
                }
            }
        }

        resend.abort();
        Ok(())
    }

    /// Signal the server to shut down gracefully.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Per-connection reader loop. Returns when the connection should close.
async fn read_loop(
    id: ConnectionId,
    mut reader: OwnedReadHalf,
    relay: &Relay,
    connections: &ConnectionMap,
    options: &ServerOptions,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let read = tokio::time::timeout(
            options.idle_timeout,
            framing::read_message(&mut reader, &options.frame),
        );
        let result = tokio::select! {
            result = read => result,
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
        };

        match result {
            Ok(Ok(message)) if message.body == MessageBody::Disconnect => {
                tracing::info!(connection = %id, "client disconnected");
                break;
            }
            Ok(Ok(message)) => {
                let out = relay.handle(id, message).await;
                connections.deliver(out).await;
            }
            Ok(Err(e)) if e.is_recoverable() => {
                tracing::warn!(connection = %id, error = %e, "skipping malformed frame");
            }
            Ok(Err(FrameError::ConnectionClosed)) => break,
            Ok(Err(e)) => {
                tracing::warn!(connection = %id, error = %e, "closing connection");
                break;
            }
            Err(_) => {
                tracing::info!(connection = %id, timeout = ?options.idle_timeout, "idle timeout");
                break;
            }
        }
    }
}

/// Per-connection writer. Exits when the connection is removed from the map
/// or the server shuts down.
async fn write_loop(
    id: ConnectionId,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Message>,
    frame: FrameConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let message = tokio::select! {
            biased;
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
        };
        tracing::debug!(connection = %id, tag = %message.tag(), "sending");
        if let Err(e) = framing::write_message(&mut writer, &message, &frame).await {
            tracing::warn!(connection = %id, error = %e, "write failed");
            break;
        }
    }
    let _ = tokio::io::AsyncWriteExt::shutdown(&mut writer).await;
}

async fn resend_loop(
    relay: Arc<Relay>,
    connections: Arc<ConnectionMap>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let out = relay.periodic().await;
                connections.deliver(out).await;
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}
