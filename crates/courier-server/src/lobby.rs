//! Ready rooms and the generation hand-off.
//!
//! Connections gather in a named room with `Ready`. `InitiateGame` asks every
//! member for its placements (`RequestRando`); once all have answered
//! (`RandoGenerated`) the room closes and a [`CompletedGeneration`] is handed
//! back, which the dispatcher turns into one `Result` per member.

use std::collections::HashMap;

use courier_net::messages::{
    AssignmentResult, InitiateGame, MessageBody, Placement, RandoGenerated, Ready, ReadyConfirm,
};
use courier_net::SessionId;

use crate::registry::Outgoing;
use crate::tcp_server::ConnectionId;

// ---------------------------------------------------------------------------
// Item assignment
// ---------------------------------------------------------------------------

/// Decides which placements end up in which player's world.
///
/// `placements[i]` is what player `i` generated; the result must hold one
/// entry per player in the same order.
pub trait ItemAssigner: Send + Sync {
    /// Produce each player's final placements.
    fn assign(&self, seed: i32, placements: &[Vec<Placement>]) -> Vec<Vec<Placement>>;
}

/// Every player keeps the placements it generated.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeepOwnItems;

impl ItemAssigner for KeepOwnItems {
    fn assign(&self, _seed: i32, placements: &[Vec<Placement>]) -> Vec<Vec<Placement>> {
        placements.to_vec()
    }
}

// ---------------------------------------------------------------------------
// Rooms
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Member {
    connection: ConnectionId,
    nickname: String,
    placements: Option<Vec<Placement>>,
}

#[derive(Debug)]
struct Room {
    ready_id: i32,
    members: Vec<Member>,
    seed: Option<i32>,
}

impl Room {
    fn roster(&self) -> Vec<Outgoing> {
        let confirm = ReadyConfirm {
            ready_count: i32::try_from(self.members.len()).unwrap_or(i32::MAX),
            names: self.members.iter().map(|m| m.nickname.clone()).collect(),
            ready_id: self.ready_id,
        };
        self.members
            .iter()
            .map(|m| Outgoing::new(m.connection, MessageBody::ReadyConfirm(confirm.clone())))
            .collect()
    }

    fn started(&self) -> bool {
        self.seed.is_some()
    }
}

/// A finished generation waiting for a session id.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedGeneration {
    /// Seed from `InitiateGame`.
    pub seed: i32,
    /// Room instance that generated.
    pub ready_id: i32,
    /// Members in player-id order.
    pub members: Vec<(ConnectionId, String)>,
    /// Placements per member, same order.
    pub placements: Vec<Vec<Placement>>,
}

impl CompletedGeneration {
    /// One `Result` per member for the new session.
    pub fn into_results(self, session_id: SessionId, assigner: &dyn ItemAssigner) -> Vec<Outgoing> {
        let mut assigned = assigner.assign(self.seed, &self.placements);
        if assigned.len() != self.members.len() {
            tracing::warn!(
                expected = self.members.len(),
                got = assigned.len(),
                "assigner returned wrong number of worlds"
            );
            assigned.resize(self.members.len(), Vec::new());
        }
        let nicknames: Vec<String> = self.members.iter().map(|(_, n)| n.clone()).collect();

        self.members
            .iter()
            .zip(assigned)
            .enumerate()
            .map(|(index, ((connection, _), items))| {
                Outgoing::new(
                    *connection,
                    MessageBody::Result(AssignmentResult {
                        player_id: i32::try_from(index).unwrap_or(i32::MAX),
                        session_id,
                        nicknames: nicknames.clone(),
                        items,
                    }),
                )
            })
            .collect()
    }
}

/// All ready rooms.
#[derive(Debug, Default)]
pub struct Lobby {
    rooms: HashMap<String, Room>,
    membership: HashMap<ConnectionId, String>,
    next_ready_id: i32,
}

impl Lobby {
    /// Create an empty lobby.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `connection` to a room and broadcast the roster.
    ///
    /// A room that already started generating is replaced by a fresh one.
    pub fn ready(&mut self, connection: ConnectionId, ready: Ready) -> Vec<Outgoing> {
        let mut out = self.unready(connection);

        let needs_new = self.rooms.get(&ready.room).is_none_or(Room::started);
        if needs_new {
            self.next_ready_id += 1;
            let ready_id = self.next_ready_id;
            if let Some(abandoned) = self.rooms.insert(
                ready.room.clone(),
                Room {
                    ready_id,
                    members: Vec::new(),
                    seed: None,
                },
            ) {
                tracing::warn!(
                    room = %ready.room,
                    ready_id = abandoned.ready_id,
                    "replacing room that was generating"
                );
                for member in abandoned.members {
                    self.membership.remove(&member.connection);
                }
            }
        }

        let Some(room) = self.rooms.get_mut(&ready.room) else {
            return out;
        };
        room.members.push(Member {
            connection,
            nickname: ready.nickname.clone(),
            placements: None,
        });
        self.membership.insert(connection, ready.room.clone());
        tracing::info!(
            room = %ready.room,
            nickname = %ready.nickname,
            ready_id = room.ready_id,
            count = room.members.len(),
            "player ready"
        );
        out.extend(room.roster());
        out
    }

    /// Remove `connection` from its room and broadcast the new roster.
    pub fn unready(&mut self, connection: ConnectionId) -> Vec<Outgoing> {
        let Some(name) = self.membership.remove(&connection) else {
            return Vec::new();
        };
        let Some(room) = self.rooms.get_mut(&name) else {
            return Vec::new();
        };
        room.members.retain(|m| m.connection != connection);
        tracing::info!(room = %name, count = room.members.len(), "player unready");

        if room.members.is_empty() {
            self.rooms.remove(&name);
            return Vec::new();
        }
        if room.started() {
            // Generation cannot complete without the missing member.
            tracing::warn!(room = %name, ready_id = room.ready_id, "member left during generation");
        }
        room.roster()
    }

    /// Start generation in `connection`'s room.
    pub fn initiate(&mut self, connection: ConnectionId, initiate: InitiateGame) -> Vec<Outgoing> {
        let Some(room) = self
            .membership
            .get(&connection)
            .and_then(|name| self.rooms.get_mut(name))
        else {
            tracing::warn!(%connection, "InitiateGame from connection outside any room");
            return Vec::new();
        };
        if room.ready_id != initiate.ready_id {
            tracing::warn!(
                expected = room.ready_id,
                got = initiate.ready_id,
                "InitiateGame for a stale room"
            );
            return Vec::new();
        }
        if room.started() {
            tracing::debug!(ready_id = room.ready_id, "generation already started");
            return Vec::new();
        }

        room.seed = Some(initiate.seed);
        tracing::info!(
            ready_id = room.ready_id,
            seed = initiate.seed,
            players = room.members.len(),
            "starting generation"
        );
        room.members
            .iter()
            .map(|m| Outgoing::new(m.connection, MessageBody::RequestRando))
            .collect()
    }

    /// Record `connection`'s placements. Returns the generation once every
    /// member has answered; the room is closed at that point.
    pub fn rando_generated(
        &mut self,
        connection: ConnectionId,
        generated: RandoGenerated,
    ) -> Option<CompletedGeneration> {
        let name = self.membership.get(&connection)?.clone();
        let room = self.rooms.get_mut(&name)?;
        let Some(seed) = room.seed else {
            tracing::warn!(%connection, "placements before InitiateGame");
            return None;
        };
        if let Some(member) = room.members.iter_mut().find(|m| m.connection == connection) {
            member.placements = Some(generated.items);
        }
        if room.members.iter().any(|m| m.placements.is_none()) {
            return None;
        }

        let room = self.rooms.remove(&name)?;
        let mut members = Vec::with_capacity(room.members.len());
        let mut placements = Vec::with_capacity(room.members.len());
        for member in room.members {
            self.membership.remove(&member.connection);
            members.push((member.connection, member.nickname));
            placements.push(member.placements.unwrap_or_default());
        }
        tracing::info!(ready_id = room.ready_id, players = members.len(), "generation complete");
        Some(CompletedGeneration {
            seed,
            ready_id: room.ready_id,
            members,
            placements,
        })
    }

    /// Room `connection` is waiting in, if any.
    pub fn room_of(&self, connection: ConnectionId) -> Option<&str> {
        self.membership.get(&connection).map(String::as_str)
    }

    /// Number of open rooms.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: ConnectionId = ConnectionId(1);
    const B: ConnectionId = ConnectionId(2);
    const C: ConnectionId = ConnectionId(3);

    fn ready(room: &str, nickname: &str) -> Ready {
        Ready {
            room: room.into(),
            nickname: nickname.into(),
        }
    }

    fn placement(item: &str) -> Placement {
        Placement {
            location: format!("{item}-spot"),
            item: item.into(),
        }
    }

    fn confirm_of(out: &[Outgoing], to: ConnectionId) -> Option<ReadyConfirm> {
        out.iter().find_map(|o| match &o.message {
            MessageBody::ReadyConfirm(c) if o.connection == to => Some(c.clone()),
            _ => None,
        })
    }

    #[test]
    fn test_ready_broadcasts_roster() {
        let mut lobby = Lobby::new();
        lobby.ready(A, ready("room", "alice"));
        let out = lobby.ready(B, ready("room", "bob"));

        assert_eq!(out.len(), 2);
        let roster = confirm_of(&out, A).unwrap();
        assert_eq!(roster.ready_count, 2);
        assert_eq!(roster.names, vec!["alice", "bob"]);
        assert_eq!(confirm_of(&out, B), Some(roster));
    }

    #[test]
    fn test_unready_rebroadcasts_and_closes_empty_room() {
        let mut lobby = Lobby::new();
        lobby.ready(A, ready("room", "alice"));
        lobby.ready(B, ready("room", "bob"));

        let out = lobby.unready(A);
        assert_eq!(out.len(), 1);
        assert_eq!(confirm_of(&out, B).unwrap().names, vec!["bob"]);

        assert!(lobby.unready(B).is_empty());
        assert_eq!(lobby.room_count(), 0);
        assert!(lobby.unready(B).is_empty());
    }

    #[test]
    fn test_switching_rooms() {
        let mut lobby = Lobby::new();
        lobby.ready(A, ready("one", "alice"));
        lobby.ready(B, ready("one", "bob"));
        let out = lobby.ready(A, ready("two", "alice"));

        assert_eq!(confirm_of(&out, B).unwrap().names, vec!["bob"]);
        assert_eq!(confirm_of(&out, A).unwrap().names, vec!["alice"]);
        assert_eq!(lobby.room_of(A), Some("two"));
    }

    #[test]
    fn test_full_generation() {
        let mut lobby = Lobby::new();
        lobby.ready(A, ready("room", "alice"));
        let out = lobby.ready(B, ready("room", "bob"));
        let ready_id = confirm_of(&out, A).unwrap().ready_id;

        let out = lobby.initiate(A, InitiateGame { seed: 42, ready_id });
        assert_eq!(
            out,
            vec![
                Outgoing::new(A, MessageBody::RequestRando),
                Outgoing::new(B, MessageBody::RequestRando)
            ]
        );

        let first = lobby.rando_generated(B, RandoGenerated {
            items: vec![placement("Claw")],
        });
        assert!(first.is_none());
        let done = lobby
            .rando_generated(A, RandoGenerated {
                items: vec![placement("Dash")],
            })
            .unwrap();
        assert_eq!(done.seed, 42);
        assert_eq!(done.members, vec![(A, "alice".to_string()), (B, "bob".to_string())]);
        assert_eq!(lobby.room_count(), 0);
        assert_eq!(lobby.room_of(A), None);

        let results = done.into_results(77, &KeepOwnItems);
        assert_eq!(results.len(), 2);
        match &results[1].message {
            MessageBody::Result(result) => {
                assert_eq!(results[1].connection, B);
                assert_eq!(result.player_id, 1);
                assert_eq!(result.session_id, 77);
                assert_eq!(result.nicknames, vec!["alice", "bob"]);
                assert_eq!(result.items, vec![placement("Claw")]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_stale_initiate_ignored() {
        let mut lobby = Lobby::new();
        let out = lobby.ready(A, ready("room", "alice"));
        let ready_id = confirm_of(&out, A).unwrap().ready_id;
        assert!(
            lobby
                .initiate(A, InitiateGame {
                    seed: 1,
                    ready_id: ready_id + 1
                })
                .is_empty()
        );
        assert!(lobby.initiate(C, InitiateGame { seed: 1, ready_id }).is_empty());
        assert!(
            lobby
                .rando_generated(A, RandoGenerated { items: vec![] })
                .is_none()
        );
    }

    #[test]
    fn test_ready_after_start_opens_new_room_instance() {
        let mut lobby = Lobby::new();
        let out = lobby.ready(A, ready("room", "alice"));
        let first_id = confirm_of(&out, A).unwrap().ready_id;
        lobby.initiate(A, InitiateGame {
            seed: 1,
            ready_id: first_id,
        });

        let out = lobby.ready(B, ready("room", "bob"));
        let roster = confirm_of(&out, B).unwrap();
        assert_ne!(roster.ready_id, first_id);
        assert_eq!(roster.names, vec!["bob"]);
        assert_eq!(lobby.room_of(A), None);
    }

    struct Swap;

    impl ItemAssigner for Swap {
        fn assign(&self, _seed: i32, placements: &[Vec<Placement>]) -> Vec<Vec<Placement>> {
            placements.iter().rev().cloned().collect()
        }
    }

    #[test]
    fn test_custom_assigner() {
        let done = CompletedGeneration {
            seed: 0,
            ready_id: 1,
            members: vec![(A, "a".into()), (B, "b".into())],
            placements: vec![vec![placement("X")], vec![placement("Y")]],
        };
        let results = done.into_results(5, &Swap);
        match &results[0].message {
            MessageBody::Result(r) => assert_eq!(r.items, vec![placement("Y")]),
            other => panic!("unexpected {other:?}"),
        }
    }
}
