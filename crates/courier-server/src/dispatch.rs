//! Server-side message routing.
//!
//! [`Relay`] is the transport-independent half of the server: it takes one
//! decoded message from a connection and returns everything that has to be
//! sent in response, to any connection.

use std::sync::{Arc, Mutex, PoisonError};

use courier_net::messages::{ItemReceiveConfirm, Message, MessageBody};

use crate::lobby::{ItemAssigner, KeepOwnItems, Lobby};
use crate::registry::{Outgoing, SessionRegistry};
use crate::tcp_server::ConnectionId;

/// Routes client messages to the session registry and the lobby.
pub struct Relay {
    registry: SessionRegistry,
    lobby: Mutex<Lobby>,
    assigner: Arc<dyn ItemAssigner>,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("registry", &self.registry)
            .field("lobby", &self.lobby)
            .finish_non_exhaustive()
    }
}

impl Default for Relay {
    fn default() -> Self {
        Self::new(Arc::new(KeepOwnItems))
    }
}

impl Relay {
    /// Create a relay using `assigner` for finished generations.
    pub fn new(assigner: Arc<dyn ItemAssigner>) -> Self {
        Self {
            registry: SessionRegistry::new(),
            lobby: Mutex::new(Lobby::new()),
            assigner,
        }
    }

    /// Session state, for inspection.
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    fn lobby(&self) -> std::sync::MutexGuard<'_, Lobby> {
        self.lobby.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handle one message from `connection`.
    ///
    /// `Disconnect` is handled by the transport, which then calls
    /// [`Relay::connection_closed`].
    pub async fn handle(&self, connection: ConnectionId, message: Message) -> Vec<Outgoing> {
        tracing::debug!(%connection, tag = %message.tag(), "received");

        match message.body {
            MessageBody::Connect => {
                tracing::info!(%connection, "client connected");
                vec![Outgoing::new(connection, MessageBody::Connect)]
            }
            MessageBody::Ping => vec![Outgoing::new(connection, MessageBody::Ping)],
            MessageBody::Disconnect => self.connection_closed(connection).await,
            MessageBody::Join(join) => {
                self.registry
                    .join(connection, &join.display_name, join.session_id, join.player_id)
                    .await
            }
            MessageBody::Leave => self.registry.leave(connection).await,
            MessageBody::ItemSend(send) => self.registry.send_item(connection, send).await,
            MessageBody::ItemsSend(batch) => self.registry.send_items(connection, batch).await,
            MessageBody::ItemReceiveConfirm(ItemReceiveConfirm { item, .. }) => {
                self.registry.confirm_item(connection, &item).await;
                Vec::new()
            }
            MessageBody::Save(save) => {
                tracing::debug!(%connection, ready_id = save.ready_id, "save");
                self.registry.save(connection).await;
                Vec::new()
            }
            MessageBody::AnnounceCharmCosts(announce) => {
                self.registry.announce_charm_costs(connection, announce).await
            }
            MessageBody::ConfirmCharmCostsReceived(confirm) => {
                self.registry
                    .confirm_charm_costs(connection, confirm.player_id)
                    .await;
                Vec::new()
            }
            MessageBody::Ready(ready) => {
                let mut lobby = self.lobby();
                lobby.ready(connection, ready)
            }
            MessageBody::Unready => {
                let mut lobby = self.lobby();
                lobby.unready(connection)
            }
            MessageBody::InitiateGame(initiate) => {
                let mut lobby = self.lobby();
                lobby.initiate(connection, initiate)
            }
            MessageBody::RandoGenerated(generated) => {
                let completed = self.lobby().rando_generated(connection, generated);
                match completed {
                    Some(completed) => {
                        let session_id = self.registry.allocate_session_id().await;
                        tracing::info!(
                            session_id,
                            ready_id = completed.ready_id,
                            "assigning items"
                        );
                        completed.into_results(session_id, self.assigner.as_ref())
                    }
                    None => Vec::new(),
                }
            }
            MessageBody::RejoinGame(rejoin) => {
                tracing::info!(
                    %connection,
                    ready_id = rejoin.ready_id,
                    "rejoin of finished generation requested"
                );
                Vec::new()
            }
            body @ (MessageBody::JoinConfirm(_)
            | MessageBody::ReadyConfirm(_)
            | MessageBody::ItemSendConfirm(_)
            | MessageBody::ItemsSendConfirm(_)
            | MessageBody::ItemReceive(_)
            | MessageBody::RequestRando
            | MessageBody::Result(_)
            | MessageBody::RequestCharmCosts
            | MessageBody::Notify(_)) => {
                tracing::debug!(
                    %connection,
                    tag = %body.tag(),
                    "ignoring client-bound message kind"
                );
                Vec::new()
            }
        }
    }

    /// `connection` closed, cleanly or not.
    pub async fn connection_closed(&self, connection: ConnectionId) -> Vec<Outgoing> {
        self.registry.disconnect(connection).await;
        let mut lobby = self.lobby();
        lobby.unready(connection)
    }

    /// Periodic work: resend unacknowledged messages and drop empty sessions.
    pub async fn periodic(&self) -> Vec<Outgoing> {
        let out = self.registry.resend_confirmable().await;
        if !out.is_empty() {
            tracing::debug!(count = out.len(), "resending confirmable messages");
        }
        self.registry.sweep().await;
        out
    }
}
