//! Binary message codec.
//!
//! Wire layout of one encoded message (the frame body, see [`crate::framing`]
//! for the length prefix that wraps it):
//!
//! ```text
//! +-----------+----------------------+--------------------------------+
//! | tag (u8)  | sender_uid (varint)  | fields, in schema order        |
//! +-----------+----------------------+--------------------------------+
//! ```
//!
//! Fields are encoded with [`postcard`]: integers as zig-zag varints, strings
//! and sequences with a varint length prefix. The field order is the payload
//! struct's declaration order, which the tests check against [`crate::schema`].

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::messages::{Message, MessageBody};
use crate::schema::MessageTag;

/// Errors produced by [`decode`].
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The buffer was empty (no tag byte).
    #[error("empty frame")]
    Empty,

    /// The tag byte is not part of the protocol.
    #[error("unknown message tag {0}")]
    UnknownTag(u8),

    /// The fields could not be parsed for the declared kind.
    #[error("malformed {tag} frame: {source}")]
    Malformed {
        /// Kind announced by the tag byte.
        tag: MessageTag,
        /// Underlying postcard error.
        #[source]
        source: postcard::Error,
    },

    /// All declared fields parsed but bytes were left over.
    #[error("{tag} frame has {remaining} trailing bytes")]
    TrailingBytes {
        /// Kind announced by the tag byte.
        tag: MessageTag,
        /// Number of unread bytes.
        remaining: usize,
    },
}

impl DecodeError {
    /// Whether this error means the peer speaks a different protocol, as
    /// opposed to a single damaged frame.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, DecodeError::UnknownTag(_))
    }
}

/// Errors produced by [`encode`]. Only reachable through postcard internals;
/// every message built from the public types encodes.
#[derive(Debug, thiserror::Error)]
#[error("failed to encode {tag}: {source}")]
pub struct EncodeError {
    /// Kind being encoded.
    pub tag: MessageTag,
    /// Underlying postcard error.
    #[source]
    pub source: postcard::Error,
}

fn put<T: Serialize>(out: &mut Vec<u8>, tag: MessageTag, value: &T) -> Result<(), EncodeError> {
    let bytes = postcard::to_allocvec(value).map_err(|source| EncodeError { tag, source })?;
    out.extend_from_slice(&bytes);
    Ok(())
}

/// Encode a message into a frame body.
pub fn encode(msg: &Message) -> Result<Vec<u8>, EncodeError> {
    let tag = msg.tag();
    let mut out = Vec::with_capacity(16);
    out.push(tag as u8);
    put(&mut out, tag, &msg.sender_uid)?;

    match &msg.body {
        MessageBody::Connect
        | MessageBody::Disconnect
        | MessageBody::Leave
        | MessageBody::Ping
        | MessageBody::Unready
        | MessageBody::RequestRando
        | MessageBody::RequestCharmCosts => {}
        MessageBody::Join(p) => put(&mut out, tag, p)?,
        MessageBody::JoinConfirm(p) => put(&mut out, tag, p)?,
        MessageBody::Ready(p) => put(&mut out, tag, p)?,
        MessageBody::ReadyConfirm(p) => put(&mut out, tag, p)?,
        MessageBody::InitiateGame(p) => put(&mut out, tag, p)?,
        MessageBody::RejoinGame(p) => put(&mut out, tag, p)?,
        MessageBody::ItemSend(p) => put(&mut out, tag, p)?,
        MessageBody::ItemSendConfirm(p) => put(&mut out, tag, p)?,
        MessageBody::ItemsSend(p) => put(&mut out, tag, p)?,
        MessageBody::ItemsSendConfirm(p) => put(&mut out, tag, p)?,
        MessageBody::ItemReceive(p) => put(&mut out, tag, p)?,
        MessageBody::ItemReceiveConfirm(p) => put(&mut out, tag, p)?,
        MessageBody::Save(p) => put(&mut out, tag, p)?,
        MessageBody::RandoGenerated(p) => put(&mut out, tag, p)?,
        MessageBody::Result(p) => put(&mut out, tag, p)?,
        MessageBody::AnnounceCharmCosts(p) => put(&mut out, tag, p)?,
        MessageBody::ConfirmCharmCostsReceived(p) => put(&mut out, tag, p)?,
        MessageBody::Notify(p) => put(&mut out, tag, p)?,
    }

    Ok(out)
}

/// Cursor over the bytes following the tag.
struct Fields<'a> {
    tag: MessageTag,
    rest: &'a [u8],
}

impl<'a> Fields<'a> {
    fn take<T: DeserializeOwned>(&mut self) -> Result<T, DecodeError> {
        let (value, rest) =
            postcard::take_from_bytes::<T>(self.rest).map_err(|source| DecodeError::Malformed {
                tag: self.tag,
                source,
            })?;
        self.rest = rest;
        Ok(value)
    }

    fn finish(self) -> Result<(), DecodeError> {
        if self.rest.is_empty() {
            Ok(())
        } else {
            Err(DecodeError::TrailingBytes {
                tag: self.tag,
                remaining: self.rest.len(),
            })
        }
    }
}

/// Decode a frame body into a message.
pub fn decode(data: &[u8]) -> Result<Message, DecodeError> {
    let (&tag_byte, rest) = data.split_first().ok_or(DecodeError::Empty)?;
    let tag = MessageTag::from_u8(tag_byte).ok_or(DecodeError::UnknownTag(tag_byte))?;
    let mut fields = Fields { tag, rest };
    let sender_uid: u64 = fields.take()?;

    let body = match tag {
        MessageTag::Connect => MessageBody::Connect,
        MessageTag::Disconnect => MessageBody::Disconnect,
        MessageTag::Leave => MessageBody::Leave,
        MessageTag::Ping => MessageBody::Ping,
        MessageTag::Unready => MessageBody::Unready,
        MessageTag::RequestRando => MessageBody::RequestRando,
        MessageTag::RequestCharmCosts => MessageBody::RequestCharmCosts,
        MessageTag::Join => MessageBody::Join(fields.take()?),
        MessageTag::JoinConfirm => MessageBody::JoinConfirm(fields.take()?),
        MessageTag::Ready => MessageBody::Ready(fields.take()?),
        MessageTag::ReadyConfirm => MessageBody::ReadyConfirm(fields.take()?),
        MessageTag::InitiateGame => MessageBody::InitiateGame(fields.take()?),
        MessageTag::RejoinGame => MessageBody::RejoinGame(fields.take()?),
        MessageTag::ItemSend => MessageBody::ItemSend(fields.take()?),
        MessageTag::ItemSendConfirm => MessageBody::ItemSendConfirm(fields.take()?),
        MessageTag::ItemsSend => MessageBody::ItemsSend(fields.take()?),
        MessageTag::ItemsSendConfirm => MessageBody::ItemsSendConfirm(fields.take()?),
        MessageTag::ItemReceive => MessageBody::ItemReceive(fields.take()?),
        MessageTag::ItemReceiveConfirm => MessageBody::ItemReceiveConfirm(fields.take()?),
        MessageTag::Save => MessageBody::Save(fields.take()?),
        MessageTag::RandoGenerated => MessageBody::RandoGenerated(fields.take()?),
        MessageTag::Result => MessageBody::Result(fields.take()?),
        MessageTag::AnnounceCharmCosts => MessageBody::AnnounceCharmCosts(fields.take()?),
        MessageTag::ConfirmCharmCostsReceived => {
            MessageBody::ConfirmCharmCostsReceived(fields.take()?)
        }
        MessageTag::Notify => MessageBody::Notify(fields.take()?),
    };

    fields.finish()?;
    Ok(Message { sender_uid, body })
}
