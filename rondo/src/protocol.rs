//! Wire protocol between the client and the key-value server.
//!
//! The dispatch engine never looks inside requests or replies; it only moves
//! bytes through a [`ProtocolCodec`]. [`RespCodec`] is the default codec and
//! speaks RESP2.
//!
//! Each connection owns its own codec instance (cloned from the client's), so
//! codecs may keep per-stream decode state without synchronisation.

pub mod reply;
pub mod resp;

use bytes::BytesMut;
use thiserror::Error;

use crate::request::Command;

pub use reply::Reply;
pub use resp::RespCodec;

/// Encodes commands and decodes replies for one connection.
pub trait ProtocolCodec: Clone + Send + Sync + 'static {
    /// Appends the wire encoding of `command` to `dst`.
    fn encode(&self, command: &Command, dst: &mut BytesMut);

    /// Decodes one reply from the front of `src`.
    ///
    /// Returns `Ok(None)` when `src` does not yet hold a complete reply; in
    /// that case `src` is left untouched. On success the reply's bytes are
    /// removed from `src`.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] if the stream is malformed. The connection
    /// cannot be resynchronised after that and must be reset.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Reply>, ProtocolError>;

    /// Forgets any partially decoded reply. Called whenever the connection
    /// discards its receive buffer.
    fn reset(&mut self) {}
}

/// Errors while decoding a reply stream.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Unknown reply type byte.
    #[error("unknown reply type: 0x{0:02x}")]
    UnknownType(u8),
    /// Length or integer field is not a valid decimal.
    #[error("invalid integer in reply header")]
    InvalidInteger,
    /// Bulk payload not terminated by CRLF.
    #[error("missing CRLF terminator")]
    MissingTerminator,
    /// Bulk string exceeds the configured maximum.
    #[error("bulk length {len} exceeds limit {max}")]
    BulkTooLarge { len: usize, max: usize },
    /// Arrays nested deeper than the decoder allows.
    #[error("reply nesting exceeds {0} levels")]
    TooDeep(usize),
    /// Negative length other than the `-1` null marker.
    #[error("invalid length {0}")]
    InvalidLength(i64),
}
