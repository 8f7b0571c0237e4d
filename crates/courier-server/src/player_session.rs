//! One player's binding to a game session.
//!
//! A [`PlayerSession`] exists while a connection is bound to a player slot.
//! Server-to-client messages that need an acknowledgement (item deliveries,
//! charm-cost requests and announcements) stay in its confirmable list until
//! the client answers, so the resend task can re-dispatch them.

use courier_net::messages::{AnnounceCharmCosts, ItemReceive, MessageBody};
use courier_net::{PlayerId, SessionId};

use crate::tcp_server::ConnectionId;

/// A connection bound to a player slot.
#[derive(Debug, Clone)]
pub struct PlayerSession {
    name: String,
    session_id: SessionId,
    player_id: PlayerId,
    connection: ConnectionId,
    confirmable: Vec<MessageBody>,
    outbox: Vec<MessageBody>,
}

impl PlayerSession {
    /// Bind `connection` to `player_id` of `session_id`.
    pub fn new(
        name: impl Into<String>,
        session_id: SessionId,
        player_id: PlayerId,
        connection: ConnectionId,
    ) -> Self {
        Self {
            name: name.into(),
            session_id,
            player_id,
            connection,
            confirmable: Vec::new(),
            outbox: Vec::new(),
        }
    }

    /// Display name given at join.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Session this binding belongs to.
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Bound player slot.
    pub fn player_id(&self) -> PlayerId {
        self.player_id
    }

    /// Connection that owns the binding.
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Queue a message that must be acknowledged.
    ///
    /// It is dispatched once now and kept for resends. An identical message
    /// already awaiting acknowledgement is not duplicated, but is dispatched
    /// again.
    pub fn queue_confirmable(&mut self, message: MessageBody) {
        if !self.confirmable.contains(&message) {
            self.confirmable.push(message.clone());
        }
        self.outbox.push(message);
    }

    /// Take everything queued since the last call.
    pub fn drain_outbox(&mut self) -> Vec<MessageBody> {
        std::mem::take(&mut self.outbox)
    }

    /// Messages still awaiting acknowledgement.
    pub fn confirmable(&self) -> &[MessageBody] {
        &self.confirmable
    }

    /// Drop pending deliveries of `item`. Returns whether any were removed.
    pub fn acknowledge_item(&mut self, item: &str) -> bool {
        self.remove_confirmable(|m| {
            matches!(
                m,
                MessageBody::ItemReceive(ItemReceive { item: queued, .. }) if queued == item
            )
        })
    }

    /// Drop a pending charm-cost request.
    pub fn acknowledge_cost_request(&mut self) -> bool {
        self.remove_confirmable(|m| matches!(m, MessageBody::RequestCharmCosts))
    }

    /// Drop pending announcements of `owner`'s charm costs.
    pub fn acknowledge_costs(&mut self, owner: PlayerId) -> bool {
        self.remove_confirmable(|m| {
            matches!(
                m,
                MessageBody::AnnounceCharmCosts(AnnounceCharmCosts { player_id, .. })
                    if *player_id == owner
            )
        })
    }

    fn remove_confirmable(&mut self, predicate: impl Fn(&MessageBody) -> bool) -> bool {
        let before = self.confirmable.len();
        self.confirmable.retain(|m| !predicate(m));
        self.confirmable.len() != before
    }
}
