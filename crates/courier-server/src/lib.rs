//! Courier relay server.
//!
//! - [`ledger`] and [`player_session`]: per-session delivery bookkeeping
//!   (unconfirmed, unsaved and confirmable messages).
//! - [`registry`]: live sessions and connection bindings.
//! - [`lobby`]: ready rooms and the generation hand-off.
//! - [`dispatch`]: turns one client message into the messages to send back.
//! - [`tcp_server`]: the TCP transport.

pub mod dispatch;
pub mod error;
pub mod ledger;
pub mod lobby;
pub mod player_session;
pub mod registry;
pub mod tcp_server;

pub use dispatch::Relay;
pub use error::ServerError;
pub use ledger::{ConfirmOutcome, GameSessionLedger, LeaveOutcome};
pub use lobby::{CompletedGeneration, ItemAssigner, KeepOwnItems, Lobby};
pub use player_session::PlayerSession;
pub use registry::{Binding, Outgoing, SessionRegistry};
pub use tcp_server::{ConnectionId, ConnectionMap, IdGenerator, RelayServer, ServerOptions};
