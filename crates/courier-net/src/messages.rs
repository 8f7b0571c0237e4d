//! Relay message types.
//!
//! Every message carries the sender's connection identifier (`sender_uid`,
//! 0 until the server assigns one) and a [`MessageBody`]. The body variants
//! form the closed set of kinds both ends understand; see [`crate::schema`]
//! for the per-kind field table and [`crate::codec`] for the wire encoding.

use serde::{Deserialize, Serialize};

use crate::schema::MessageTag;

/// Session identifier assigned by the relay when a generation completes.
pub type SessionId = i32;

/// Player index within a session.
pub type PlayerId = i32;

/// A message with its sender stamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Connection identifier of the sender (0 when unassigned).
    pub sender_uid: u64,
    /// The typed body.
    pub body: MessageBody,
}

impl Message {
    /// Wrap a body with an unassigned sender.
    pub fn new(body: MessageBody) -> Self {
        Self {
            sender_uid: 0,
            body,
        }
    }

    /// Wrap a body with an explicit sender.
    pub fn from_sender(sender_uid: u64, body: MessageBody) -> Self {
        Self { sender_uid, body }
    }

    /// The wire tag of this message.
    pub fn tag(&self) -> MessageTag {
        self.body.tag()
    }
}

impl From<MessageBody> for Message {
    fn from(body: MessageBody) -> Self {
        Message::new(body)
    }
}

// ---------------------------------------------------------------------------
// Body enum
// ---------------------------------------------------------------------------

/// Message kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessageBody {
    // --- Connection ---
    /// Client hello; the server answers with the assigned uid as sender.
    Connect,
    /// Either side closes the connection.
    Disconnect,
    /// Ask to bind to a player slot of a session.
    Join(Join),
    /// Server accepted a Join.
    JoinConfirm(JoinConfirm),
    /// Leave the current session (connection stays open).
    Leave,
    /// Heartbeat; the server echoes it back.
    Ping,

    // --- Lobby ---
    /// Enter a ready room.
    Ready(Ready),
    /// Room roster after a change.
    ReadyConfirm(ReadyConfirm),
    /// Leave the ready room.
    Unready,
    /// Start generation for everybody in the room.
    InitiateGame(InitiateGame),
    /// Ask the server to replay a finished generation.
    RejoinGame(RejoinGame),

    // --- Items ---
    /// Client routes an item to another player.
    ItemSend(ItemSend),
    /// Server stored an [`ItemSend`].
    ItemSendConfirm(ItemSendConfirm),
    /// Client routes a batch of items.
    ItemsSend(ItemsSend),
    /// Server stored a batch.
    ItemsSendConfirm(ItemsSendConfirm),
    /// Server delivers an item to its destination.
    ItemReceive(ItemReceive),
    /// Client received an item (it is now "unsaved" on the server).
    ItemReceiveConfirm(ItemReceiveConfirm),
    /// Client persisted its game; unsaved items may be forgotten.
    Save(Save),

    // --- Generation hand-off ---
    /// Server asks every room member for its placements.
    RequestRando,
    /// Client answers with its placements.
    RandoGenerated(RandoGenerated),
    /// Server returns the assigned session to a client.
    Result(AssignmentResult),

    // --- Ancillary per-player data ---
    /// Server asks a client for its charm costs.
    RequestCharmCosts,
    /// Charm costs of one player.
    AnnounceCharmCosts(AnnounceCharmCosts),
    /// Client received another player's costs.
    ConfirmCharmCostsReceived(ConfirmCharmCostsReceived),

    // --- Misc ---
    /// Free-form server notice for the host application.
    Notify(Notify),
}

// ---------------------------------------------------------------------------
// Payload structs
// ---------------------------------------------------------------------------

/// Join request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Join {
    /// Name shown to other players.
    pub display_name: String,
    /// Session to join.
    pub session_id: SessionId,
    /// Player slot within the session.
    pub player_id: PlayerId,
}

/// Join accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinConfirm {
    /// Joined session.
    pub session_id: SessionId,
    /// Bound player slot.
    pub player_id: PlayerId,
}

/// Enter a ready room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ready {
    /// Room name.
    pub room: String,
    /// Name shown in the roster.
    pub nickname: String,
}

/// Room roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyConfirm {
    /// Number of ready players.
    pub ready_count: i32,
    /// Their nicknames, in join order.
    pub names: Vec<String>,
    /// Identifier of this room instance.
    pub ready_id: i32,
}

/// Start generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiateGame {
    /// Shared seed.
    pub seed: i32,
    /// Room instance being started.
    pub ready_id: i32,
}

/// Replay a finished generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejoinGame {
    /// Room instance to replay.
    pub ready_id: i32,
}

/// Route one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemSend {
    /// Where the item was found.
    pub location: String,
    /// Item label.
    pub item: String,
    /// Destination player.
    pub to: PlayerId,
}

/// Acknowledges an [`ItemSend`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemSendConfirm {
    /// Echoed location.
    pub location: String,
    /// Echoed item label.
    pub item: String,
    /// Echoed destination.
    pub to: PlayerId,
}

/// One routed item inside a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRecord {
    /// Destination player.
    pub to: PlayerId,
    /// Item label.
    pub item: String,
    /// Where the item was found.
    pub location: String,
}

/// Route a batch of items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemsSend {
    /// The batch.
    pub items: Vec<ItemRecord>,
}

/// Acknowledges an [`ItemsSend`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemsSendConfirm {
    /// Number of items stored.
    pub items_count: i32,
}

/// Deliver an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemReceive {
    /// Where the item was found.
    pub location: String,
    /// Item label.
    pub item: String,
    /// Nickname of the sending player.
    pub from: String,
}

/// Acknowledges an [`ItemReceive`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemReceiveConfirm {
    /// Echoed item label.
    pub item: String,
    /// Echoed sender nickname.
    pub from: String,
}

/// Client saved its game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Save {
    /// Room instance the save belongs to (-1 when unknown).
    pub ready_id: i32,
}

/// One item placement produced by a client's generator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Placement {
    /// Location label.
    pub location: String,
    /// Item label.
    pub item: String,
}

/// A client's placements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandoGenerated {
    /// Placements in generation order.
    pub items: Vec<Placement>,
}

/// Outcome of the item-assignment exchange for one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentResult {
    /// Player slot assigned to the receiving client.
    pub player_id: PlayerId,
    /// Newly created session.
    pub session_id: SessionId,
    /// Nicknames indexed by player id.
    pub nicknames: Vec<String>,
    /// Placements in the receiving player's world.
    pub items: Vec<Placement>,
}

/// Charm costs of one player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnounceCharmCosts {
    /// Owner of the costs.
    pub player_id: PlayerId,
    /// Cost per charm.
    pub costs: Vec<i32>,
}

/// Acknowledges an [`AnnounceCharmCosts`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmCharmCostsReceived {
    /// Owner of the received costs.
    pub player_id: PlayerId,
}

/// Free-form notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notify {
    /// Text to show.
    pub text: String,
}

impl MessageBody {
    /// Extract the wire tag without consuming the body.
    pub fn tag(&self) -> MessageTag {
        match self {
            MessageBody::Connect => MessageTag::Connect,
            MessageBody::Disconnect => MessageTag::Disconnect,
            MessageBody::Join(_) => MessageTag::Join,
            MessageBody::JoinConfirm(_) => MessageTag::JoinConfirm,
            MessageBody::Leave => MessageTag::Leave,
            MessageBody::Ping => MessageTag::Ping,
            MessageBody::Ready(_) => MessageTag::Ready,
            MessageBody::ReadyConfirm(_) => MessageTag::ReadyConfirm,
            MessageBody::Unready => MessageTag::Unready,
            MessageBody::InitiateGame(_) => MessageTag::InitiateGame,
            MessageBody::RejoinGame(_) => MessageTag::RejoinGame,
            MessageBody::ItemSend(_) => MessageTag::ItemSend,
            MessageBody::ItemSendConfirm(_) => MessageTag::ItemSendConfirm,
            MessageBody::ItemsSend(_) => MessageTag::ItemsSend,
            MessageBody::ItemsSendConfirm(_) => MessageTag::ItemsSendConfirm,
            MessageBody::ItemReceive(_) => MessageTag::ItemReceive,
            MessageBody::ItemReceiveConfirm(_) => MessageTag::ItemReceiveConfirm,
            MessageBody::Save(_) => MessageTag::Save,
            MessageBody::RequestRando => MessageTag::RequestRando,
            MessageBody::RandoGenerated(_) => MessageTag::RandoGenerated,
            MessageBody::Result(_) => MessageTag::Result,
            MessageBody::RequestCharmCosts => MessageTag::RequestCharmCosts,
            MessageBody::AnnounceCharmCosts(_) => MessageTag::AnnounceCharmCosts,
            MessageBody::ConfirmCharmCostsReceived(_) => MessageTag::ConfirmCharmCostsReceived,
            MessageBody::Notify(_) => MessageTag::Notify,
        }
    }
}
