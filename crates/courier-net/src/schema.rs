//! Static per-kind field schema.
//!
//! Each [`MessageTag`] has exactly one [`MessageSchema`] entry listing the
//! fields that follow the frame header, in wire order. The table is plain
//! data: it can be enumerated, printed and checked without a transport. The
//! entries are stored in tag order so lookup is an index; a const assertion
//! below rejects a mis-ordered table at build time.

use std::fmt;

/// Wire tag of a message kind. Values are stable protocol constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum MessageTag {
    Connect = 1,
    Disconnect = 2,
    Join = 3,
    JoinConfirm = 4,
    Leave = 5,
    Ping = 6,
    Ready = 7,
    ReadyConfirm = 8,
    Unready = 9,
    InitiateGame = 10,
    ItemSend = 11,
    ItemSendConfirm = 12,
    ItemsSend = 13,
    ItemsSendConfirm = 14,
    ItemReceive = 15,
    ItemReceiveConfirm = 16,
    RequestRando = 17,
    RandoGenerated = 18,
    Result = 19,
    RequestCharmCosts = 20,
    AnnounceCharmCosts = 21,
    ConfirmCharmCostsReceived = 22,
    Save = 23,
    Notify = 24,
    RejoinGame = 25,
}

impl MessageTag {
    /// Every tag, in wire order.
    pub const ALL: [MessageTag; 25] = [
        MessageTag::Connect,
        MessageTag::Disconnect,
        MessageTag::Join,
        MessageTag::JoinConfirm,
        MessageTag::Leave,
        MessageTag::Ping,
        MessageTag::Ready,
        MessageTag::ReadyConfirm,
        MessageTag::Unready,
        MessageTag::InitiateGame,
        MessageTag::ItemSend,
        MessageTag::ItemSendConfirm,
        MessageTag::ItemsSend,
        MessageTag::ItemsSendConfirm,
        MessageTag::ItemReceive,
        MessageTag::ItemReceiveConfirm,
        MessageTag::RequestRando,
        MessageTag::RandoGenerated,
        MessageTag::Result,
        MessageTag::RequestCharmCosts,
        MessageTag::AnnounceCharmCosts,
        MessageTag::ConfirmCharmCostsReceived,
        MessageTag::Save,
        MessageTag::Notify,
        MessageTag::RejoinGame,
    ];

    /// Look up a tag by its wire value.
    pub fn from_u8(value: u8) -> Option<Self> {
        let index = usize::from(value).checked_sub(1)?;
        Self::ALL.get(index).copied()
    }

    /// Human-readable kind name.
    pub fn name(self) -> &'static str {
        schema_for(self).name
    }
}

impl fmt::Display for MessageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Semantic type of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// Signed 32-bit integer (zig-zag varint).
    Int,
    /// UTF-8 string, length-prefixed.
    Str,
    /// Raw bytes, length-prefixed.
    Bytes,
    /// Length-prefixed sequence of [`FieldType::Int`].
    IntSeq,
    /// Length-prefixed sequence of [`FieldType::Str`].
    StrSeq,
    /// Nested record, named after its [`RecordSchema`].
    Record(&'static str),
    /// Length-prefixed sequence of nested records.
    RecordSeq(&'static str),
}

/// One named, typed field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// Field name.
    pub name: &'static str,
    /// Field type.
    pub ty: FieldType,
}

/// Field list for one message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageSchema {
    /// The kind.
    pub tag: MessageTag,
    /// Kind name.
    pub name: &'static str,
    /// Fields after the header, in wire order.
    pub fields: &'static [FieldDescriptor],
}

/// Field list for a nested record type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordSchema {
    /// Record name referenced by [`FieldType::Record`]/[`FieldType::RecordSeq`].
    pub name: &'static str,
    /// Fields in wire order.
    pub fields: &'static [FieldDescriptor],
}

const fn field(name: &'static str, ty: FieldType) -> FieldDescriptor {
    FieldDescriptor { name, ty }
}

const fn kind(
    tag: MessageTag,
    name: &'static str,
    fields: &'static [FieldDescriptor],
) -> MessageSchema {
    MessageSchema { tag, name, fields }
}

use FieldType::{Int, IntSeq, Record, RecordSeq, Str, StrSeq};

/// Nested record schemas.
pub const RECORDS: &[RecordSchema] = &[
    RecordSchema {
        name: "ItemRecord",
        fields: &[field("to", Int), field("item", Str), field("location", Str)],
    },
    RecordSchema {
        name: "Placement",
        fields: &[field("location", Str), field("item", Str)],
    },
];

/// Message schemas, indexed by `tag - 1`.
pub const SCHEMA: &[MessageSchema] = &[
    kind(MessageTag::Connect, "Connect", &[]),
    kind(MessageTag::Disconnect, "Disconnect", &[]),
    kind(
        MessageTag::Join,
        "Join",
        &[
            field("display_name", Str),
            field("session_id", Int),
            field("player_id", Int),
        ],
    ),
    kind(
        MessageTag::JoinConfirm,
        "JoinConfirm",
        &[field("session_id", Int), field("player_id", Int)],
    ),
    kind(MessageTag::Leave, "Leave", &[]),
    kind(MessageTag::Ping, "Ping", &[]),
    kind(
        MessageTag::Ready,
        "Ready",
        &[field("room", Str), field("nickname", Str)],
    ),
    kind(
        MessageTag::ReadyConfirm,
        "ReadyConfirm",
        &[
            field("ready_count", Int),
            field("names", StrSeq),
            field("ready_id", Int),
        ],
    ),
    kind(MessageTag::Unready, "Unready", &[]),
    kind(
        MessageTag::InitiateGame,
        "InitiateGame",
        &[field("seed", Int), field("ready_id", Int)],
    ),
    kind(
        MessageTag::ItemSend,
        "ItemSend",
        &[field("location", Str), field("item", Str), field("to", Int)],
    ),
    kind(
        MessageTag::ItemSendConfirm,
        "ItemSendConfirm",
        &[field("location", Str), field("item", Str), field("to", Int)],
    ),
    kind(
        MessageTag::ItemsSend,
        "ItemsSend",
        &[field("items", RecordSeq("ItemRecord"))],
    ),
    kind(
        MessageTag::ItemsSendConfirm,
        "ItemsSendConfirm",
        &[field("items_count", Int)],
    ),
    kind(
        MessageTag::ItemReceive,
        "ItemReceive",
        &[field("location", Str), field("item", Str), field("from", Str)],
    ),
    kind(
        MessageTag::ItemReceiveConfirm,
        "ItemReceiveConfirm",
        &[field("item", Str), field("from", Str)],
    ),
    kind(MessageTag::RequestRando, "RequestRando", &[]),
    kind(
        MessageTag::RandoGenerated,
        "RandoGenerated",
        &[field("items", RecordSeq("Placement"))],
    ),
    kind(
        MessageTag::Result,
        "Result",
        &[
            field("player_id", Int),
            field("session_id", Int),
            field("nicknames", StrSeq),
            field("items", RecordSeq("Placement")),
        ],
    ),
    kind(MessageTag::RequestCharmCosts, "RequestCharmCosts", &[]),
    kind(
        MessageTag::AnnounceCharmCosts,
        "AnnounceCharmCosts",
        &[field("player_id", Int), field("costs", IntSeq)],
    ),
    kind(
        MessageTag::ConfirmCharmCostsReceived,
        "ConfirmCharmCostsReceived",
        &[field("player_id", Int)],
    ),
    kind(MessageTag::Save, "Save", &[field("ready_id", Int)]),
    kind(MessageTag::Notify, "Notify", &[field("text", Str)]),
    kind(MessageTag::RejoinGame, "RejoinGame", &[field("ready_id", Int)]),
];

const fn schema_table_is_dense() -> bool {
    if SCHEMA.len() != MessageTag::ALL.len() {
        return false;
    }
    let mut i = 0;
    while i < SCHEMA.len() {
        if SCHEMA[i].tag as usize != i + 1 || MessageTag::ALL[i] as usize != i + 1 {
            return false;
        }
        i += 1;
    }
    true
}

const _: () = assert!(
    schema_table_is_dense(),
    "SCHEMA must hold one entry per MessageTag, in tag order"
);

/// Schema of a message kind.
pub fn schema_for(tag: MessageTag) -> &'static MessageSchema {
    &SCHEMA[tag as usize - 1]
}

/// Schema of a nested record, by name.
pub fn record_schema(name: &str) -> Option<&'static RecordSchema> {
    RECORDS.iter().find(|r| r.name == name)
}
