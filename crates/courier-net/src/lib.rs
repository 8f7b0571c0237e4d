//! Courier wire protocol and client connection core.
//!
//! - [`messages`], [`schema`], [`codec`] and [`framing`]: the typed message set,
//!   its static field schema and the tagged, length-prefixed binary encoding.
//! - [`tcp_client`]: [`ConnectionCore`], the reconnecting client with heartbeat,
//!   inbound hand-off queue and the item-assignment exchange.
//! - [`item_queue`], [`inbound`] and [`exchange`]: the pieces of client state
//!   the connection core is built from.
//! - [`platform`]: socket setup, also used by the relay server.
//! - [`reconnection`]: reconnect backoff.

pub mod codec;
pub mod exchange;
pub mod framing;
pub mod inbound;
pub mod item_queue;
pub mod messages;
pub mod platform;
pub mod reconnection;
pub mod schema;
pub mod tcp_client;

pub use codec::{DecodeError, EncodeError, decode, encode};
pub use exchange::{ExchangeError, PendingExchange};
pub use framing::{FrameConfig, FrameError, read_frame, read_message, write_frame, write_message};
pub use inbound::{InboundFull, InboundQueue};
pub use item_queue::{OutboundItemQueue, PendingItem};
pub use messages::{Message, MessageBody, PlayerId, SessionId};
pub use platform::SocketConfig;
pub use reconnection::{ReconnectConfig, ReconnectError, ReconnectState};
pub use schema::{FieldDescriptor, FieldType, MessageSchema, MessageTag, SCHEMA, schema_for};
pub use tcp_client::{
    ClientHost, ClientOptions, ConnectionCore, ConnectionError, ConnectionEvent, ConnectionState,
    ConnectionStatus, DetachedHost,
};
