//! Per-session delivery ledger.
//!
//! Every item routed inside a session moves through
//! `unconfirmed -> unsaved -> forgotten`:
//!
//! - `send_item` records the item as *unconfirmed* for its destination and,
//!   if the destination is online, queues an `ItemReceive`.
//! - `ItemReceiveConfirm` moves it to *unsaved*: the client has it in memory.
//! - `Save` forgets the player's unsaved items: the client has them on disk.
//!
//! Rebinding or leaving while items are unsaved moves them back to
//! unconfirmed, so they are redelivered on the next join. Nothing else drops
//! an item.

use std::collections::{BTreeMap, HashMap, HashSet};

use courier_net::messages::{AnnounceCharmCosts, ItemReceive, MessageBody};
use courier_net::{PendingItem, PlayerId, SessionId};

use crate::player_session::PlayerSession;
use crate::tcp_server::ConnectionId;

/// Result of [`GameSessionLedger::leave`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// The player was unbound.
    Removed,
    /// Nobody was bound to the slot.
    NotBound,
    /// The slot is bound to a newer connection; nothing changed.
    StaleConnection {
        /// Connection currently bound to the slot.
        bound: ConnectionId,
    },
}

/// Result of [`GameSessionLedger::confirm_item`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// Moved from unconfirmed to unsaved.
    Confirmed,
    /// Already unsaved; nothing changed.
    AlreadyConfirmed,
    /// Not tracked (already saved, or never sent).
    Unknown,
}

/// State of one game session.
#[derive(Debug)]
pub struct GameSessionLedger {
    session_id: SessionId,
    players: BTreeMap<PlayerId, PlayerSession>,
    nicknames: HashMap<PlayerId, String>,
    charm_costs: BTreeMap<PlayerId, Vec<i32>>,
    unconfirmed: HashMap<PlayerId, HashSet<PendingItem>>,
    unsaved: HashMap<PlayerId, HashSet<PendingItem>>,
}

impl GameSessionLedger {
    /// Create an empty ledger.
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            players: BTreeMap::new(),
            nicknames: HashMap::new(),
            charm_costs: BTreeMap::new(),
            unconfirmed: HashMap::new(),
            unsaved: HashMap::new(),
        }
    }

    /// Session id.
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Move a player's unsaved items back to unconfirmed.
    fn restore_unsaved(&mut self, player_id: PlayerId) {
        let Some(unsaved) = self.unsaved.get_mut(&player_id) else {
            return;
        };
        if unsaved.is_empty() {
            return;
        }
        let restored = std::mem::take(unsaved);
        tracing::debug!(
            session_id = self.session_id,
            player_id,
            count = restored.len(),
            "restoring unsaved items for redelivery"
        );
        self.unconfirmed.entry(player_id).or_default().extend(restored);
    }

    /// Bind `connection` to `player_id`, replacing any existing binding.
    ///
    /// Queues on the new binding: every unconfirmed item, a charm-cost
    /// request if this player's costs are unknown, and every other player's
    /// known costs.
    pub fn join(&mut self, connection: ConnectionId, display_name: &str, player_id: PlayerId) {
        if self.players.contains_key(&player_id) {
            self.restore_unsaved(player_id);
        }
        self.nicknames
            .entry(player_id)
            .or_insert_with(|| display_name.to_string());

        let mut session = PlayerSession::new(display_name, self.session_id, player_id, connection);
        tracing::info!(
            session_id = self.session_id,
            player = player_id + 1,
            %connection,
            "player joined"
        );

        if let Some(items) = self.unconfirmed.get(&player_id) {
            for item in items {
                tracing::info!(
                    session_id = self.session_id,
                    item = %item.item,
                    player = player_id + 1,
                    "resending on join"
                );
                session.queue_confirmable(receive_message(item));
            }
        }

        if !self.charm_costs.contains_key(&player_id) {
            session.queue_confirmable(MessageBody::RequestCharmCosts);
        }
        for (&owner, costs) in &self.charm_costs {
            if owner == player_id {
                continue;
            }
            session.queue_confirmable(MessageBody::AnnounceCharmCosts(AnnounceCharmCosts {
                player_id: owner,
                costs: costs.clone(),
            }));
        }

        self.players.insert(player_id, session);
    }

    /// Unbind `player_id` if `connection` still owns the binding.
    pub fn leave(&mut self, player_id: PlayerId, connection: ConnectionId) -> LeaveOutcome {
        let Some(session) = self.players.get(&player_id) else {
            return LeaveOutcome::NotBound;
        };
        if session.connection() != connection {
            let bound = session.connection();
            tracing::warn!(
                session_id = self.session_id,
                player = player_id + 1,
                %connection,
                %bound,
                "ignoring leave from stale connection"
            );
            return LeaveOutcome::StaleConnection { bound };
        }

        self.players.remove(&player_id);
        tracing::info!(session_id = self.session_id, player = player_id + 1, "player removed");
        self.restore_unsaved(player_id);
        LeaveOutcome::Removed
    }

    /// Route an item to `to`, sent by the player called `from`.
    ///
    /// A repeat of an item the destination already confirmed is ignored.
    pub fn send_item(&mut self, to: PlayerId, item: &str, location: &str, from: &str) {
        let pending = PendingItem::new(to, from, location, item);
        if self.unsaved.get(&to).is_some_and(|set| set.contains(&pending)) {
            tracing::debug!(
                session_id = self.session_id,
                item,
                player = to + 1,
                "item already delivered"
            );
            return;
        }
        if let Some(session) = self.players.get_mut(&to) {
            tracing::info!(
                session_id = self.session_id,
                item,
                from,
                to = session.name(),
                "sending item"
            );
            session.queue_confirmable(receive_message(&pending));
        } else {
            tracing::info!(
                session_id = self.session_id,
                item,
                player = to + 1,
                "holding item for offline player"
            );
        }
        // Unconfirmed doubles as the store for offline players.
        let set = self.unconfirmed.entry(to).or_default();
        set.replace(pending);
    }

    /// Route an item sent by player `from`, labelled with their nickname.
    pub fn send_item_from(&mut self, to: PlayerId, item: &str, location: &str, from: PlayerId) {
        let nickname = self
            .nicknames
            .get(&from)
            .cloned()
            .unwrap_or_else(|| format!("Player {}", from + 1));
        self.send_item(to, item, location, &nickname);
    }

    /// The client of `player_id` received `item`.
    pub fn confirm_item(&mut self, player_id: PlayerId, item: &str) -> ConfirmOutcome {
        if let Some(session) = self.players.get_mut(&player_id) {
            session.acknowledge_item(item);
        }

        let key = PendingItem::new(player_id, "", "", item);
        let taken = self
            .unconfirmed
            .get_mut(&player_id)
            .and_then(|set| set.take(&key));

        let outcome = match taken {
            Some(found) => {
                self.unsaved.entry(player_id).or_default().insert(found);
                ConfirmOutcome::Confirmed
            }
            None if self.unsaved.get(&player_id).is_some_and(|set| set.contains(&key)) => {
                ConfirmOutcome::AlreadyConfirmed
            }
            None => ConfirmOutcome::Unknown,
        };

        tracing::info!(
            session_id = self.session_id,
            item,
            player = player_id + 1,
            unconfirmed = self.unconfirmed_count(player_id),
            unsaved = self.unsaved_count(player_id),
            ?outcome,
            "item confirmed"
        );
        outcome
    }

    /// `player_id` saved; forget its unsaved items. Returns how many.
    pub fn save(&mut self, player_id: PlayerId) -> usize {
        let Some(unsaved) = self.unsaved.get_mut(&player_id) else {
            return 0;
        };
        let cleared = unsaved.len();
        unsaved.clear();
        tracing::info!(
            session_id = self.session_id,
            player = player_id + 1,
            cleared,
            "player saved"
        );
        cleared
    }

    /// Store `player_id`'s charm costs and forward them to every other
    /// bound player.
    pub fn announce_charm_costs(&mut self, player_id: PlayerId, costs: Vec<i32>) {
        self.charm_costs.insert(player_id, costs.clone());
        if let Some(session) = self.players.get_mut(&player_id) {
            session.acknowledge_cost_request();
        }
        let announce = MessageBody::AnnounceCharmCosts(AnnounceCharmCosts { player_id, costs });
        for (&other, session) in self.players.iter_mut() {
            if other == player_id {
                continue;
            }
            session.queue_confirmable(announce.clone());
        }
    }

    /// `receiver` got `owner`'s charm costs.
    pub fn confirm_charm_costs(&mut self, receiver: PlayerId, owner: PlayerId) {
        if let Some(session) = self.players.get_mut(&receiver) {
            session.acknowledge_costs(owner);
        }
    }

    /// No bound players and nothing at risk.
    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
            && self.unconfirmed.values().all(HashSet::is_empty)
            && self.unsaved.values().all(HashSet::is_empty)
    }

    /// Binding of `player_id`, if any.
    pub fn player(&self, player_id: PlayerId) -> Option<&PlayerSession> {
        self.players.get(&player_id)
    }

    /// Nickname recorded for `player_id` (kept after leave).
    pub fn nickname(&self, player_id: PlayerId) -> Option<&str> {
        self.nicknames.get(&player_id).map(String::as_str)
    }

    /// Known charm costs of `player_id`.
    pub fn charm_costs(&self, player_id: PlayerId) -> Option<&[i32]> {
        self.charm_costs.get(&player_id).map(Vec::as_slice)
    }

    /// Items sent to `player_id` and not yet confirmed.
    pub fn unconfirmed_items(&self, player_id: PlayerId) -> impl Iterator<Item = &PendingItem> {
        self.unconfirmed.get(&player_id).into_iter().flatten()
    }

    /// Items confirmed by `player_id` and not yet saved.
    pub fn unsaved_items(&self, player_id: PlayerId) -> impl Iterator<Item = &PendingItem> {
        self.unsaved.get(&player_id).into_iter().flatten()
    }

    fn unconfirmed_count(&self, player_id: PlayerId) -> usize {
        self.unconfirmed.get(&player_id).map_or(0, HashSet::len)
    }

    fn unsaved_count(&self, player_id: PlayerId) -> usize {
        self.unsaved.get(&player_id).map_or(0, HashSet::len)
    }

    /// Take every message queued since the last call, per connection.
    pub fn drain_outgoing(&mut self) -> Vec<(ConnectionId, MessageBody)> {
        let mut out = Vec::new();
        for session in self.players.values_mut() {
            let connection = session.connection();
            out.extend(session.drain_outbox().into_iter().map(|m| (connection, m)));
        }
        out
    }

    /// Every message still awaiting acknowledgement, per connection.
    pub fn pending_confirmable(&self) -> Vec<(ConnectionId, MessageBody)> {
        self.players
            .values()
            .flat_map(|s| s.confirmable().iter().map(|m| (s.connection(), m.clone())))
            .collect()
    }

    /// `"1: name, 2: name"` for bound players.
    pub fn player_summary(&self) -> String {
        self.players
            .iter()
            .map(|(id, s)| format!("{}: {}", id + 1, s.name()))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn receive_message(item: &PendingItem) -> MessageBody {
    MessageBody::ItemReceive(ItemReceive {
        location: item.location.clone(),
        item: item.item.clone(),
        from: item.from.clone(),
    })
}
