//! Session registry: routes per-connection requests to session ledgers.
//!
//! Lock order is `bindings` before a ledger; the `sessions` map lock is only
//! held long enough to clone a ledger handle, so it never waits on a ledger.

use std::collections::HashMap;
use std::sync::Arc;

use courier_net::messages::{
    AnnounceCharmCosts, ItemSend, ItemSendConfirm, ItemsSend, ItemsSendConfirm, JoinConfirm,
    MessageBody,
};
use courier_net::{PlayerId, SessionId};
use rand::Rng;
use tokio::sync::{Mutex, RwLock};

use crate::ledger::GameSessionLedger;
use crate::tcp_server::ConnectionId;

/// A message the server must deliver to one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    /// Destination connection.
    pub connection: ConnectionId,
    /// Body to send.
    pub message: MessageBody,
}

impl Outgoing {
    /// Build an outgoing message.
    pub fn new(connection: ConnectionId, message: MessageBody) -> Self {
        Self {
            connection,
            message,
        }
    }
}

/// The slot a connection is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    /// Session of the slot.
    pub session_id: SessionId,
    /// Player slot.
    pub player_id: PlayerId,
}

type SharedLedger = Arc<Mutex<GameSessionLedger>>;

/// All live game sessions and the connections bound to them.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, SharedLedger>>,
    bindings: RwLock<HashMap<ConnectionId, Binding>>,
}

fn collect(ledger: &mut GameSessionLedger, out: &mut Vec<Outgoing>) {
    out.extend(
        ledger
            .drain_outgoing()
            .into_iter()
            .map(|(connection, message)| Outgoing::new(connection, message)),
    );
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    async fn ledger(&self, session_id: SessionId) -> Option<SharedLedger> {
        self.sessions.read().await.get(&session_id).cloned()
    }

    async fn ledger_or_create(&self, session_id: SessionId) -> SharedLedger {
        let mut sessions = self.sessions.write().await;
        Arc::clone(sessions.entry(session_id).or_insert_with(|| {
            tracing::info!(session_id, "creating session");
            Arc::new(Mutex::new(GameSessionLedger::new(session_id)))
        }))
    }

    /// The binding of `connection` and its ledger.
    async fn bound(&self, connection: ConnectionId) -> Option<(Binding, SharedLedger)> {
        let binding = self.bindings.read().await.get(&connection).copied();
        let Some(binding) = binding else {
            tracing::warn!(%connection, "request from connection not joined to a session");
            return None;
        };
        let ledger = self.ledger(binding.session_id).await?;
        Some((binding, ledger))
    }

    /// Slot `connection` is bound to, if any.
    pub async fn binding(&self, connection: ConnectionId) -> Option<Binding> {
        self.bindings.read().await.get(&connection).copied()
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Run `f` against a session's ledger.
    pub async fn inspect<R>(
        &self,
        session_id: SessionId,
        f: impl FnOnce(&GameSessionLedger) -> R,
    ) -> Option<R> {
        let ledger = self.ledger(session_id).await?;
        let guard = ledger.lock().await;
        Some(f(&guard))
    }

    /// Bind `connection` to a player slot, creating the session if needed.
    ///
    /// A previous binding of the same connection is released first. The
    /// JoinConfirm precedes anything the ledger queued for the joiner.
    pub async fn join(
        &self,
        connection: ConnectionId,
        display_name: &str,
        session_id: SessionId,
        player_id: PlayerId,
    ) -> Vec<Outgoing> {
        let mut bindings = self.bindings.write().await;
        if let Some(previous) = bindings.remove(&connection) {
            if let Some(ledger) = self.ledger(previous.session_id).await {
                ledger.lock().await.leave(previous.player_id, connection);
            }
            if previous.session_id != session_id {
                self.sweep_session(previous.session_id).await;
            }
        }

        let ledger = self.ledger_or_create(session_id).await;
        let mut out = vec![Outgoing::new(
            connection,
            MessageBody::JoinConfirm(JoinConfirm {
                session_id,
                player_id,
            }),
        )];
        {
            let mut ledger = ledger.lock().await;
            ledger.join(connection, display_name, player_id);
            tracing::debug!(session_id, players = %ledger.player_summary(), "session roster");
            collect(&mut ledger, &mut out);
        }
        bindings.insert(
            connection,
            Binding {
                session_id,
                player_id,
            },
        );
        out
    }

    async fn release(&self, connection: ConnectionId) -> Option<SessionId> {
        let binding = self.bindings.write().await.remove(&connection)?;
        let ledger = self.ledger(binding.session_id).await?;
        ledger.lock().await.leave(binding.player_id, connection);
        Some(binding.session_id)
    }

    /// Unbind `connection`; the Leave is echoed back.
    pub async fn leave(&self, connection: ConnectionId) -> Vec<Outgoing> {
        if let Some(session_id) = self.release(connection).await {
            self.sweep_session(session_id).await;
        }
        vec![Outgoing::new(connection, MessageBody::Leave)]
    }

    /// `connection` went away.
    pub async fn disconnect(&self, connection: ConnectionId) {
        if let Some(session_id) = self.release(connection).await {
            self.sweep_session(session_id).await;
        }
    }

    /// Route one item sent by the player bound to `connection`.
    pub async fn send_item(&self, connection: ConnectionId, send: ItemSend) -> Vec<Outgoing> {
        let Some((binding, ledger)) = self.bound(connection).await else {
            return Vec::new();
        };
        let mut out = vec![Outgoing::new(
            connection,
            MessageBody::ItemSendConfirm(ItemSendConfirm {
                location: send.location.clone(),
                item: send.item.clone(),
                to: send.to,
            }),
        )];
        let mut ledger = ledger.lock().await;
        ledger.send_item_from(send.to, &send.item, &send.location, binding.player_id);
        collect(&mut ledger, &mut out);
        out
    }

    /// Route a batch sent by the player bound to `connection`.
    pub async fn send_items(&self, connection: ConnectionId, batch: ItemsSend) -> Vec<Outgoing> {
        let Some((binding, ledger)) = self.bound(connection).await else {
            return Vec::new();
        };
        let items_count = i32::try_from(batch.items.len()).unwrap_or(i32::MAX);
        let mut out = vec![Outgoing::new(
            connection,
            MessageBody::ItemsSendConfirm(ItemsSendConfirm { items_count }),
        )];
        let mut ledger = ledger.lock().await;
        for record in &batch.items {
            ledger.send_item_from(record.to, &record.item, &record.location, binding.player_id);
        }
        collect(&mut ledger, &mut out);
        out
    }

    /// The client on `connection` received `item`.
    pub async fn confirm_item(&self, connection: ConnectionId, item: &str) {
        if let Some((binding, ledger)) = self.bound(connection).await {
            ledger.lock().await.confirm_item(binding.player_id, item);
        }
    }

    /// The client on `connection` saved its game.
    pub async fn save(&self, connection: ConnectionId) {
        let Some((binding, ledger)) = self.bound(connection).await else {
            return;
        };
        ledger.lock().await.save(binding.player_id);
        drop(ledger);
        self.sweep_session(binding.session_id).await;
    }

    /// Store and forward charm costs announced on `connection`.
    pub async fn announce_charm_costs(
        &self,
        connection: ConnectionId,
        announce: AnnounceCharmCosts,
    ) -> Vec<Outgoing> {
        let Some((binding, ledger)) = self.bound(connection).await else {
            return Vec::new();
        };
        if announce.player_id != binding.player_id {
            tracing::warn!(
                %connection,
                bound = binding.player_id,
                announced = announce.player_id,
                "charm costs announced for another player"
            );
        }
        let mut out = Vec::new();
        let mut ledger = ledger.lock().await;
        ledger.announce_charm_costs(announce.player_id, announce.costs);
        collect(&mut ledger, &mut out);
        out
    }

    /// The client on `connection` received `owner`'s charm costs.
    pub async fn confirm_charm_costs(&self, connection: ConnectionId, owner: PlayerId) {
        if let Some((binding, ledger)) = self.bound(connection).await {
            ledger
                .lock()
                .await
                .confirm_charm_costs(binding.player_id, owner);
        }
    }

    /// Every confirmable message still awaiting acknowledgement.
    pub async fn resend_confirmable(&self) -> Vec<Outgoing> {
        let ledgers: Vec<SharedLedger> = self.sessions.read().await.values().cloned().collect();
        let mut out = Vec::new();
        for ledger in ledgers {
            let ledger = ledger.lock().await;
            out.extend(
                ledger
                    .pending_confirmable()
                    .into_iter()
                    .map(|(connection, message)| Outgoing::new(connection, message)),
            );
        }
        out
    }

    /// Drop `session_id` if its ledger is empty and nobody else holds it.
    async fn sweep_session(&self, session_id: SessionId) {
        let mut sessions = self.sessions.write().await;
        let Some(ledger) = sessions.get(&session_id) else {
            return;
        };
        if is_collectable(ledger) {
            sessions.remove(&session_id);
            tracing::info!(session_id, "removed empty session");
        }
    }

    /// Drop every empty session. Returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, ledger| !is_collectable(ledger));
        let removed = before - sessions.len();
        if removed > 0 {
            tracing::info!(removed, "swept empty sessions");
        }
        removed
    }

    /// Pick a random session id that is not in use.
    pub async fn allocate_session_id(&self) -> SessionId {
        let sessions = self.sessions.read().await;
        let mut rng = rand::rng();
        loop {
            let candidate: SessionId = rng.random_range(1..i32::MAX);
            if !sessions.contains_key(&candidate) {
                return candidate;
            }
        }
    }
}

/// A ledger handle is only cloned under the sessions lock, so a count of one
/// means no request is using it.
fn is_collectable(ledger: &SharedLedger) -> bool {
    Arc::strong_count(ledger) == 1
        && ledger
            .try_lock()
            .map(|ledger| ledger.is_empty())
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_net::messages::{ItemRecord, ItemReceive};

    const A: ConnectionId = ConnectionId(1);
    const B: ConnectionId = ConnectionId(2);

    fn item_send(item: &str, to: PlayerId) -> ItemSend {
        ItemSend {
            location: "Crossroads".into(),
            item: item.into(),
            to,
        }
    }

    fn receives_for(out: &[Outgoing], connection: ConnectionId) -> Vec<ItemReceive> {
        out.iter()
            .filter(|o| o.connection == connection)
            .filter_map(|o| match &o.message {
                MessageBody::ItemReceive(r) => Some(r.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_join_confirm_comes_first() {
        let registry = SessionRegistry::new();
        let out = registry.join(A, "alice", 7, 0).await;
        assert_eq!(
            out[0],
            Outgoing::new(
                A,
                MessageBody::JoinConfirm(JoinConfirm {
                    session_id: 7,
                    player_id: 0
                })
            )
        );
        assert!(out.contains(&Outgoing::new(A, MessageBody::RequestCharmCosts)));
        assert_eq!(
            registry.binding(A).await,
            Some(Binding {
                session_id: 7,
                player_id: 0
            })
        );
        assert_eq!(registry.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_send_item_confirms_sender_and_delivers() {
        let registry = SessionRegistry::new();
        registry.join(A, "alice", 7, 0).await;
        registry.join(B, "bob", 7, 1).await;

        let out = registry.send_item(A, item_send("Dash", 1)).await;
        assert_eq!(
            out[0],
            Outgoing::new(
                A,
                MessageBody::ItemSendConfirm(ItemSendConfirm {
                    location: "Crossroads".into(),
                    item: "Dash".into(),
                    to: 1
                })
            )
        );
        let delivered = receives_for(&out, B);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].from, "alice");
    }

    #[tokio::test]
    async fn test_unjoined_sender_is_ignored() {
        let registry = SessionRegistry::new();
        assert!(registry.send_item(A, item_send("Dash", 1)).await.is_empty());
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_send_items_counts_batch() {
        let registry = SessionRegistry::new();
        registry.join(A, "alice", 7, 0).await;
        let batch = ItemsSend {
            items: vec![
                ItemRecord {
                    to: 3,
                    item: "A".into(),
                    location: "L1".into(),
                },
                ItemRecord {
                    to: 4,
                    item: "B".into(),
                    location: "L2".into(),
                },
            ],
        };
        let out = registry.send_items(A, batch).await;
        assert_eq!(
            out,
            vec![Outgoing::new(
                A,
                MessageBody::ItemsSendConfirm(ItemsSendConfirm { items_count: 2 })
            )]
        );
        let held = registry
            .inspect(7, |ledger| {
                ledger.unconfirmed_items(3).count() + ledger.unconfirmed_items(4).count()
            })
            .await;
        assert_eq!(held, Some(2));
    }

    #[tokio::test]
    async fn test_leave_echoes_and_sweeps_empty_session() {
        let registry = SessionRegistry::new();
        registry.join(A, "alice", 7, 0).await;
        let out = registry.leave(A).await;
        assert_eq!(out, vec![Outgoing::new(A, MessageBody::Leave)]);
        assert_eq!(registry.binding(A).await, None);
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_session_with_pending_items_survives_disconnect() {
        let registry = SessionRegistry::new();
        registry.join(A, "alice", 7, 0).await;
        registry.send_item(A, item_send("Dash", 5)).await;
        registry.disconnect(A).await;
        assert_eq!(registry.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_save_after_confirm_collects_session() {
        let registry = SessionRegistry::new();
        registry.join(A, "alice", 7, 0).await;
        registry.join(B, "bob", 7, 1).await;
        registry.send_item(A, item_send("Dash", 1)).await;
        registry.confirm_item(B, "Dash").await;
        registry.leave(A).await;

        registry.save(B).await;
        assert_eq!(registry.session_count().await, 1);
        registry.disconnect(B).await;
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_rejoin_on_other_session_releases_old_slot() {
        let registry = SessionRegistry::new();
        registry.join(A, "alice", 7, 0).await;
        registry.join(B, "bob", 9, 0).await;
        registry.join(A, "alice", 8, 2).await;
        registry.join(B, "bob", 8, 3).await;

        assert_eq!(registry.inspect(7, |_| ()).await, None);
        assert_eq!(registry.inspect(9, |_| ()).await, None);
        assert_eq!(registry.session_count().await, 1);
        assert_eq!(registry.sweep().await, 0);
        assert_eq!(registry.binding(A).await.map(|b| b.session_id), Some(8));
    }

    #[tokio::test]
    async fn test_resend_confirmable_repeats_unacknowledged() {
        let registry = SessionRegistry::new();
        registry.join(A, "alice", 7, 0).await;
        registry.join(B, "bob", 7, 1).await;
        registry.send_item(A, item_send("Dash", 1)).await;

        let resend = registry.resend_confirmable().await;
        assert_eq!(receives_for(&resend, B).len(), 1);

        registry.confirm_item(B, "Dash").await;
        let resend = registry.resend_confirmable().await;
        assert!(receives_for(&resend, B).is_empty());
    }

    #[tokio::test]
    async fn test_charm_costs_forwarded() {
        let registry = SessionRegistry::new();
        registry.join(A, "alice", 7, 0).await;
        registry.join(B, "bob", 7, 1).await;
        let announce = AnnounceCharmCosts {
            player_id: 0,
            costs: vec![2, 3],
        };
        let out = registry.announce_charm_costs(A, announce.clone()).await;
        assert_eq!(
            out,
            vec![Outgoing::new(B, MessageBody::AnnounceCharmCosts(announce))]
        );
        registry.confirm_charm_costs(B, 0).await;
        let resend = registry.resend_confirmable().await;
        assert!(
            !resend
                .iter()
                .any(|o| matches!(o.message, MessageBody::AnnounceCharmCosts(_)))
        );
    }

    #[tokio::test]
    async fn test_allocated_session_ids_are_unused() {
        let registry = SessionRegistry::new();
        registry.join(A, "alice", 7, 0).await;
        for _ in 0..32 {
            let id = registry.allocate_session_id().await;
            assert!(id > 0);
            assert_ne!(id, 7);
        }
    }
}
